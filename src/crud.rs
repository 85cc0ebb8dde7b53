//! CRUD facade: translates both the legacy opcode bodies and modern command
//! documents into store calls, then post-processes synthesized documents
//! with the matcher, projection, sort, skip, and limit.

use crate::aggregation::{execute_pipeline, parse_pipeline};
use crate::bson::{Document, Value};
use crate::connection::ConnectionStats;
use crate::error::Result;
use crate::matcher::{self, sort_documents};
use crate::projection::apply_projection;
use crate::protocol::{
    DELETE_FLAG_SINGLE_REMOVE, OpDelete, OpInsert, OpQuery, OpUpdate, UPDATE_FLAG_MULTI,
    UPDATE_FLAG_UPSERT,
};
use crate::store::{ModelStore, extract_constraints};
use std::sync::atomic::Ordering;

/// Split `db.collection`; a dotless namespace is all database.
pub fn split_namespace(ns: &str) -> (&str, &str) {
    ns.split_once('.').unwrap_or((ns, ""))
}

#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub skip: i64,
    pub limit: i64,
    pub sort: Option<Document>,
    pub projection: Option<Document>,
}

/// Synthesize candidates from the store, keep the ones the filter matches,
/// then apply projection, sort, skip, and limit in that order.
pub async fn find(
    store: &ModelStore,
    db: &str,
    coll: &str,
    filter: &Document,
    opts: &FindOptions,
) -> Result<Vec<Document>> {
    let n = store.collection_size(db, coll).await;
    let constraints = extract_constraints(filter);
    let candidates = store.generate_documents(db, coll, n, &constraints).await;

    let mut docs: Vec<Document> = candidates
        .into_iter()
        .filter(|d| matcher::matches(d, filter))
        .collect();
    if let Some(projection) = &opts.projection {
        docs = docs.iter().map(|d| apply_projection(d, projection)).collect();
    }
    if let Some(sort) = &opts.sort {
        sort_documents(&mut docs, sort);
    }
    if opts.skip > 0 {
        let skip = (opts.skip as usize).min(docs.len());
        docs.drain(..skip);
    }
    if opts.limit > 0 {
        docs.truncate(opts.limit as usize);
    }
    Ok(docs)
}

fn cursor_reply(docs: Vec<Document>, ns: String) -> Document {
    let mut cursor = Document::new();
    cursor.insert("firstBatch", docs);
    cursor.insert("id", 0i64);
    cursor.insert("ns", ns);
    let mut reply = Document::new();
    reply.insert("cursor", cursor);
    reply.insert("ok", 1.0);
    reply
}

// ---- MSG command handlers ----

pub async fn handle_insert(
    store: &ModelStore,
    stats: &ConnectionStats,
    db: &str,
    cmd: &Document,
) -> Result<Document> {
    let coll = cmd.get_str("insert").unwrap_or_default();
    let docs: Vec<Document> = cmd
        .get_array("documents")
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_document().cloned())
                .collect()
        })
        .unwrap_or_default();
    let outcome = store.insert(db, coll, &docs).await?;
    stats
        .documents_inserted
        .fetch_add(outcome.inserted_count as u64, Ordering::Relaxed);
    stats.record_write(outcome.inserted_count);

    let mut reply = Document::new();
    reply.insert("n", outcome.inserted_count);
    reply.insert("ok", 1.0);
    Ok(reply)
}

pub async fn handle_find(
    store: &ModelStore,
    stats: &ConnectionStats,
    db: &str,
    cmd: &Document,
) -> Result<Document> {
    let coll = cmd.get_str("find").unwrap_or_default();
    let filter = cmd.get_document("filter").cloned().unwrap_or_default();
    let opts = FindOptions {
        skip: cmd.get_i64("skip").or(cmd.get_f64("skip").map(|n| n as i64)).unwrap_or(0),
        limit: cmd
            .get_i64("limit")
            .or(cmd.get_f64("limit").map(|n| n as i64))
            .unwrap_or(0),
        sort: cmd.get_document("sort").cloned(),
        projection: cmd.get_document("projection").cloned(),
    };
    let docs = find(store, db, coll, &filter, &opts).await?;
    stats
        .documents_returned
        .fetch_add(docs.len() as u64, Ordering::Relaxed);
    Ok(cursor_reply(docs, format!("{db}.{coll}")))
}

pub async fn handle_update(
    store: &ModelStore,
    stats: &ConnectionStats,
    db: &str,
    cmd: &Document,
) -> Result<Document> {
    let coll = cmd.get_str("update").unwrap_or_default();
    let mut matched_total = 0i64;
    let mut modified_total = 0i64;
    let mut upserted: Vec<Value> = Vec::new();

    if let Some(updates) = cmd.get_array("updates") {
        for (index, entry) in updates.iter().enumerate() {
            let Some(entry) = entry.as_document() else {
                continue;
            };
            let selector = entry.get_document("q").cloned().unwrap_or_default();
            let update = entry.get_document("u").cloned().unwrap_or_default();
            let multi = entry.get_bool("multi").unwrap_or(false);
            let upsert = entry.get_bool("upsert").unwrap_or(false);
            let outcome = store
                .update(db, coll, &selector, &update, multi, upsert)
                .await?;
            matched_total += outcome.matched_count;
            modified_total += outcome.modified_count;
            if let Some(id) = outcome.upserted_id {
                let mut up = Document::new();
                up.insert("index", index as i32);
                up.insert("_id", id);
                upserted.push(Value::Document(up));
            }
        }
    }
    stats
        .documents_updated
        .fetch_add(modified_total as u64, Ordering::Relaxed);

    let n = matched_total + upserted.len() as i64;
    stats.record_write(n);
    let mut reply = Document::new();
    reply.insert("n", n);
    reply.insert("nModified", modified_total);
    if !upserted.is_empty() {
        reply.insert("upserted", upserted);
    }
    reply.insert("ok", 1.0);
    Ok(reply)
}

pub async fn handle_delete(
    store: &ModelStore,
    stats: &ConnectionStats,
    db: &str,
    cmd: &Document,
) -> Result<Document> {
    let coll = cmd.get_str("delete").unwrap_or_default();
    let mut deleted_total = 0i64;
    if let Some(deletes) = cmd.get_array("deletes") {
        for entry in deletes {
            let Some(entry) = entry.as_document() else {
                continue;
            };
            let selector = entry.get_document("q").cloned().unwrap_or_default();
            let single = entry.get_f64("limit").unwrap_or(0.0) == 1.0;
            let outcome = store.delete(db, coll, &selector, single).await?;
            deleted_total += outcome.deleted_count;
        }
    }
    stats
        .documents_deleted
        .fetch_add(deleted_total as u64, Ordering::Relaxed);
    stats.record_write(deleted_total);

    let mut reply = Document::new();
    reply.insert("n", deleted_total);
    reply.insert("ok", 1.0);
    Ok(reply)
}

pub async fn handle_aggregate(
    store: &ModelStore,
    stats: &ConnectionStats,
    db: &str,
    cmd: &Document,
) -> Result<Document> {
    let coll = cmd.get_str("aggregate").unwrap_or_default();
    let stages = parse_pipeline(cmd.get_array("pipeline").unwrap_or(&[]));

    // Let the leading $match guide generation; the stage re-filters anyway.
    let constraints = match stages.first() {
        Some(crate::aggregation::Stage::Match(filter)) => extract_constraints(filter),
        _ => Default::default(),
    };
    let n = store.collection_size(db, coll).await;
    let candidates = store.generate_documents(db, coll, n, &constraints).await;
    let docs = execute_pipeline(candidates, &stages);
    stats
        .documents_returned
        .fetch_add(docs.len() as u64, Ordering::Relaxed);
    Ok(cursor_reply(docs, format!("{db}.{coll}")))
}

pub async fn handle_count(store: &ModelStore, db: &str, cmd: &Document) -> Result<Document> {
    let coll = cmd.get_str("count").unwrap_or_default();
    let filter = cmd.get_document("query").cloned().unwrap_or_default();
    let n = store.count(db, coll, &filter).await?;
    let mut reply = Document::new();
    reply.insert("n", n);
    reply.insert("ok", 1.0);
    Ok(reply)
}

pub async fn handle_create_indexes(
    store: &ModelStore,
    db: &str,
    cmd: &Document,
) -> Result<Document> {
    let coll = cmd.get_str("createIndexes").unwrap_or_default();
    store.ensure_collection(db, coll).await;
    let before = store.index_count(db, coll).await;
    if let Some(indexes) = cmd.get_array("indexes") {
        for spec in indexes {
            let Some(spec) = spec.as_document() else {
                continue;
            };
            let key = spec.get_document("key").cloned().unwrap_or_default();
            let name = spec.get_str("name").map(str::to_string);
            let unique = spec.get_bool("unique").unwrap_or(false);
            let sparse = spec.get_bool("sparse").unwrap_or(false);
            store.create_index(db, coll, key, name, unique, sparse).await?;
        }
    }
    let after = store.index_count(db, coll).await;

    let mut reply = Document::new();
    reply.insert("numIndexesBefore", before as i32);
    reply.insert("numIndexesAfter", after as i32);
    reply.insert("ok", 1.0);
    Ok(reply)
}

pub async fn handle_list_indexes(store: &ModelStore, db: &str, cmd: &Document) -> Result<Document> {
    let coll = cmd.get_str("listIndexes").unwrap_or_default();
    let descriptors = store.list_indexes(db, coll).await;
    Ok(cursor_reply(
        descriptors,
        format!("{db}.$cmd.listIndexes.{coll}"),
    ))
}

// ---- Legacy opcode handlers ----

/// Legacy QUERY on a plain namespace. Old drivers may wrap the filter in
/// `$query` with a sibling `$orderby`.
pub async fn legacy_query(
    store: &ModelStore,
    stats: &ConnectionStats,
    q: &OpQuery,
) -> Result<Vec<Document>> {
    let (db, coll) = split_namespace(&q.full_collection_name);
    let (filter, sort) = match q.query.get_document("$query") {
        Some(inner) => (inner.clone(), q.query.get_document("$orderby").cloned()),
        None => (q.query.clone(), None),
    };
    let opts = FindOptions {
        skip: i64::from(q.number_to_skip),
        limit: i64::from(q.number_to_return.abs()),
        sort,
        projection: q.projection.clone(),
    };
    let docs = find(store, db, coll, &filter, &opts).await?;
    stats
        .documents_returned
        .fetch_add(docs.len() as u64, Ordering::Relaxed);
    Ok(docs)
}

pub async fn legacy_insert(
    store: &ModelStore,
    stats: &ConnectionStats,
    ins: &OpInsert,
) -> Result<()> {
    let (db, coll) = split_namespace(&ins.full_collection_name);
    let outcome = store.insert(db, coll, &ins.documents).await?;
    stats
        .documents_inserted
        .fetch_add(outcome.inserted_count as u64, Ordering::Relaxed);
    stats.record_write(outcome.inserted_count);
    Ok(())
}

pub async fn legacy_update(
    store: &ModelStore,
    stats: &ConnectionStats,
    u: &OpUpdate,
) -> Result<()> {
    let (db, coll) = split_namespace(&u.full_collection_name);
    let upsert = u.flags & UPDATE_FLAG_UPSERT != 0;
    let multi = u.flags & UPDATE_FLAG_MULTI != 0;
    let outcome = store
        .update(db, coll, &u.selector, &u.update, multi, upsert)
        .await?;
    stats
        .documents_updated
        .fetch_add(outcome.modified_count as u64, Ordering::Relaxed);
    stats.record_write(outcome.matched_count + outcome.upserted_count);
    Ok(())
}

pub async fn legacy_delete(
    store: &ModelStore,
    stats: &ConnectionStats,
    d: &OpDelete,
) -> Result<()> {
    let (db, coll) = split_namespace(&d.full_collection_name);
    let single = d.flags & DELETE_FLAG_SINGLE_REMOVE != 0;
    let outcome = store.delete(db, coll, &d.selector, single).await?;
    stats
        .documents_deleted
        .fetch_add(outcome.deleted_count as u64, Ordering::Relaxed);
    stats.record_write(outcome.deleted_count);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    #[tokio::test]
    async fn find_applies_filter_projection_sort_skip_limit() {
        let store = ModelStore::new();
        let docs: Vec<Document> = vec![
            doc! { "k": "a", "keep": 1, "drop": 1 },
            doc! { "k": "a", "keep": 1, "drop": 1 },
            doc! { "k": "a", "keep": 1, "drop": 1 },
        ];
        store.insert("d", "t", &docs).await.unwrap();

        let mut projection = Document::new();
        projection.insert("drop", 0);
        let opts = FindOptions {
            skip: 1,
            limit: 1,
            sort: Some(doc! { "keep": 1 }),
            projection: Some(projection),
        };
        let out = find(&store, "d", "t", &doc! { "k": "a" }, &opts).await.unwrap();
        assert_eq!(out.len(), 1);
        assert!(!out[0].contains_key("drop"));
        assert_eq!(out[0].get_i32("keep"), Some(1));
    }

    #[tokio::test]
    async fn find_on_unknown_collection_is_empty() {
        let store = ModelStore::new();
        let out = find(&store, "nope", "t", &Document::new(), &FindOptions::default())
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn update_command_sums_batched_entries() {
        let store = ModelStore::new();
        let stats = ConnectionStats::default();
        store
            .insert("d", "t", &[doc! { "x": 1 }, doc! { "x": 1 }])
            .await
            .unwrap();

        let cmd = doc! {
            "update": "t",
            "updates": [
                Value::Document(doc! { "q": doc! { "x": 1 }, "u": doc! { "$set": doc! { "y": 2 } }, "multi": true }),
                Value::Document(doc! { "q": doc! { "x": 99 }, "u": doc! { "$set": doc! { "y": 3 } }, "upsert": true }),
            ],
        };
        let reply = handle_update(&store, &stats, "d", &cmd).await.unwrap();
        // Two matched via multi, plus one upsert.
        assert_eq!(reply.get_i64("n"), Some(3));
        assert_eq!(reply.get_i64("nModified"), Some(2));
        let upserted = reply.get_array("upserted").unwrap();
        assert_eq!(upserted.len(), 1);
        let entry = upserted[0].as_document().unwrap();
        assert_eq!(entry.get_i32("index"), Some(1));
        assert!(entry.contains_key("_id"));
    }

    #[tokio::test]
    async fn delete_command_honors_limit_one() {
        let store = ModelStore::new();
        let stats = ConnectionStats::default();
        let docs: Vec<Document> = (0..4).map(|_| doc! { "x": 1 }).collect();
        store.insert("d", "t", &docs).await.unwrap();

        let cmd = doc! {
            "delete": "t",
            "deletes": [Value::Document(doc! { "q": doc! { "x": 1 }, "limit": 1 })],
        };
        let reply = handle_delete(&store, &stats, "d", &cmd).await.unwrap();
        assert_eq!(reply.get_i64("n"), Some(1));
        assert_eq!(stats.last_write_n.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn aggregate_command_runs_pipeline() {
        let store = ModelStore::new();
        let docs: Vec<Document> = (0..6).map(|_| doc! { "k": "a", "v": 2 }).collect();
        store.insert("d", "t", &docs).await.unwrap();

        let cmd = doc! {
            "aggregate": "t",
            "pipeline": [
                Value::Document(doc! { "$match": doc! { "k": "a" } }),
                Value::Document(doc! { "$group": doc! { "_id": "$k", "total": doc! { "$sum": "$v" } } }),
            ],
        };
        let stats = ConnectionStats::default();
        let reply = handle_aggregate(&store, &stats, "d", &cmd).await.unwrap();
        let cursor = reply.get_document("cursor").unwrap();
        assert_eq!(cursor.get_str("ns"), Some("d.t"));
        let batch = cursor.get_array("firstBatch").unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].as_document().unwrap().get_i32("total"), Some(12));
    }
}
