//! Generative storage engine. Inserts never persist documents verbatim:
//! they train a per-collection statistical model, and reads synthesize
//! candidate documents from that model under query constraints.

use crate::bson::{Document, ObjectId, Value};
use crate::error::Result;
use crate::matcher::values_equal;
use rand::Rng;
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// Observed values kept per field; older observations are evicted at random
/// once the reservoir is full.
const OBSERVED_CAP: usize = 64;

/// Upper bound on the candidate sample used for match-count estimates.
const SAMPLE_CAP: u64 = 1_000;

/// Per-field generation constraints extracted from a filter document.
#[derive(Debug, Clone, Default)]
pub struct FieldConstraints {
    pub equals: Option<Value>,
    pub not_equals: Vec<Value>,
    pub min: Option<f64>,
    pub exclude_min: bool,
    pub max: Option<f64>,
    pub exclude_max: bool,
    pub values: Option<Vec<Value>>,
    pub exclude_values: Vec<Value>,
    pub pattern: Option<String>,
    pub exists: Option<bool>,
}

pub type ConstraintMap = HashMap<String, FieldConstraints>;

/// Pull per-field constraints out of a filter. Only conjunctive conditions
/// guide generation; `$or`/`$nor` branches are left to the matcher.
pub fn extract_constraints(filter: &Document) -> ConstraintMap {
    let mut map = ConstraintMap::new();
    collect_constraints(filter, &mut map);
    map
}

fn collect_constraints(filter: &Document, map: &mut ConstraintMap) {
    for (key, cond) in filter.iter() {
        if key == "$and" {
            if let Some(parts) = cond.as_array() {
                for part in parts {
                    if let Some(d) = part.as_document() {
                        collect_constraints(d, map);
                    }
                }
            }
            continue;
        }
        if key.starts_with('$') {
            continue;
        }
        let entry = map.entry(key.to_string()).or_default();
        match cond {
            Value::Document(spec) if spec.keys().any(|k| k.starts_with('$')) => {
                for (op, arg) in spec.iter() {
                    match op {
                        "$eq" => entry.equals = Some(arg.clone()),
                        "$ne" => entry.not_equals.push(arg.clone()),
                        "$gt" => {
                            entry.min = arg.as_f64();
                            entry.exclude_min = true;
                        }
                        "$gte" => {
                            entry.min = arg.as_f64();
                            entry.exclude_min = false;
                        }
                        "$lt" => {
                            entry.max = arg.as_f64();
                            entry.exclude_max = true;
                        }
                        "$lte" => {
                            entry.max = arg.as_f64();
                            entry.exclude_max = false;
                        }
                        "$in" => {
                            entry.values = arg.as_array().map(<[Value]>::to_vec);
                        }
                        "$nin" => {
                            if let Some(vals) = arg.as_array() {
                                entry.exclude_values.extend(vals.iter().cloned());
                            }
                        }
                        "$regex" => {
                            entry.pattern = arg.as_str().map(str::to_string);
                        }
                        "$exists" => {
                            entry.exists = arg.as_bool();
                        }
                        _ => {}
                    }
                }
            }
            direct => entry.equals = Some(direct.clone()),
        }
    }
}

impl FieldConstraints {
    fn allows(&self, value: &Value) -> bool {
        if let Some(eq) = &self.equals
            && !values_equal(value, eq)
        {
            return false;
        }
        if self.not_equals.iter().any(|v| values_equal(value, v)) {
            return false;
        }
        if let Some(wanted) = &self.values
            && !wanted.iter().any(|v| values_equal(value, v))
        {
            return false;
        }
        if self.exclude_values.iter().any(|v| values_equal(value, v)) {
            return false;
        }
        if let Some(n) = value.as_f64() {
            if let Some(min) = self.min
                && (n < min || (self.exclude_min && n == min))
            {
                return false;
            }
            if let Some(max) = self.max
                && (n > max || (self.exclude_max && n == max))
            {
                return false;
            }
        } else if self.min.is_some() || self.max.is_some() {
            return false;
        }
        if let Some(pattern) = &self.pattern {
            let Some(s) = value.as_str() else {
                return false;
            };
            match regex::Regex::new(pattern) {
                Ok(re) => {
                    if !re.is_match(s) {
                        return false;
                    }
                }
                Err(_) => return false,
            }
        }
        true
    }
}

#[derive(Debug, Default)]
struct FieldModel {
    seen: u64,
    observed: Vec<Value>,
    numeric_min: Option<f64>,
    numeric_max: Option<f64>,
}

impl FieldModel {
    fn train(&mut self, value: &Value) {
        self.seen += 1;
        if let Some(n) = value.as_f64() {
            self.numeric_min = Some(self.numeric_min.map_or(n, |m| m.min(n)));
            self.numeric_max = Some(self.numeric_max.map_or(n, |m| m.max(n)));
        }
        if self.observed.len() < OBSERVED_CAP {
            self.observed.push(value.clone());
        } else {
            let slot = rand::thread_rng().gen_range(0..OBSERVED_CAP);
            self.observed[slot] = value.clone();
        }
    }

    /// Sample a value, preferring observed values that satisfy the
    /// constraints, falling back to the modeled numeric range.
    fn synthesize(&self, cons: Option<&FieldConstraints>) -> Option<Value> {
        let mut rng = rand::thread_rng();
        if let Some(cons) = cons {
            if let Some(eq) = &cons.equals {
                return Some(eq.clone());
            }
            if let Some(values) = &cons.values {
                let usable: Vec<&Value> = values.iter().filter(|v| cons.allows(v)).collect();
                return usable.choose(&mut rng).map(|v| (*v).clone());
            }
            let usable: Vec<&Value> = self
                .observed
                .iter()
                .filter(|v| cons.allows(v))
                .collect();
            if let Some(v) = usable.choose(&mut rng) {
                return Some((*v).clone());
            }
            // No observation fits; synthesize inside the constrained range.
            if cons.min.is_some() || cons.max.is_some() {
                let lo = cons.min.or(self.numeric_min)?;
                let hi = cons.max.or(self.numeric_max).unwrap_or(lo + 1.0);
                if lo > hi {
                    return None;
                }
                let n = if lo == hi { lo } else { rng.gen_range(lo..=hi) };
                return Some(Value::number(n));
            }
            return None;
        }
        self.observed.choose(&mut rng).cloned()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpec {
    pub name: String,
    pub key: Document,
    pub unique: bool,
    pub sparse: bool,
}

impl IndexSpec {
    fn descriptor(&self) -> Document {
        let mut d = Document::new();
        d.insert("v", 2);
        d.insert("key", self.key.clone());
        d.insert("name", self.name.as_str());
        if self.unique {
            d.insert("unique", true);
        }
        if self.sparse {
            d.insert("sparse", true);
        }
        d
    }
}

#[derive(Debug, Default)]
struct CollectionModel {
    trained: u64,
    fields: Vec<(String, FieldModel)>,
    indexes: Vec<IndexSpec>,
}

impl CollectionModel {
    fn new() -> Self {
        let mut key = Document::new();
        key.insert("_id", 1);
        Self {
            trained: 0,
            fields: Vec::new(),
            indexes: vec![IndexSpec {
                name: "_id_".to_string(),
                key,
                unique: false,
                sparse: false,
            }],
        }
    }

    fn field_mut(&mut self, name: &str) -> &mut FieldModel {
        if let Some(idx) = self.fields.iter().position(|(k, _)| k == name) {
            return &mut self.fields[idx].1;
        }
        self.fields.push((name.to_string(), FieldModel::default()));
        &mut self.fields.last_mut().unwrap().1
    }

    fn train(&mut self, doc: &Document) {
        self.trained += 1;
        for (key, value) in doc.iter() {
            if key == "_id" {
                continue;
            }
            self.field_mut(key).train(value);
        }
    }

    fn synthesize_one(&self, constraints: &ConstraintMap) -> Document {
        let mut rng = rand::thread_rng();
        let mut doc = Document::new();
        let id = match constraints.get("_id").and_then(|c| c.equals.clone()) {
            Some(pinned) => pinned,
            None => Value::ObjectId(ObjectId::new()),
        };
        doc.insert("_id", id);
        for (name, model) in &self.fields {
            let cons = constraints.get(name);
            if cons.is_some_and(|c| c.exists == Some(false)) {
                continue;
            }
            // Fields absent from some trained documents stay occasionally
            // absent in synthesized ones, unless the query pins them.
            let presence = model.seen as f64 / self.trained.max(1) as f64;
            let pinned = cons.is_some_and(|c| {
                c.equals.is_some() || c.values.is_some() || c.exists == Some(true)
            });
            if !pinned && presence < 1.0 && rng.r#gen::<f64>() > presence {
                continue;
            }
            if let Some(value) = model.synthesize(cons) {
                doc.insert(name.as_str(), value);
            }
        }
        // Constrained fields the model never saw still materialize when the
        // query demands a concrete value.
        for (name, cons) in constraints {
            if name == "_id" || doc.contains_key(name) || name.contains('.') {
                continue;
            }
            if let Some(eq) = &cons.equals {
                doc.insert(name.as_str(), eq.clone());
            }
        }
        doc
    }
}

#[derive(Debug, Clone, Default)]
pub struct InsertOutcome {
    pub inserted_count: i64,
    pub inserted_ids: Vec<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateOutcome {
    pub matched_count: i64,
    pub modified_count: i64,
    pub upserted_count: i64,
    pub upserted_id: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteOutcome {
    pub deleted_count: i64,
}

/// Process-wide model catalog: database → collection → trained model.
#[derive(Debug, Default)]
pub struct ModelStore {
    catalog: RwLock<BTreeMap<String, BTreeMap<String, CollectionModel>>>,
}

impl ModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn ensure_collection(&self, db: &str, coll: &str) {
        let mut catalog = self.catalog.write().await;
        catalog
            .entry(db.to_string())
            .or_default()
            .entry(coll.to_string())
            .or_insert_with(CollectionModel::new);
    }

    /// Train the collection model; documents are not retained.
    pub async fn insert(&self, db: &str, coll: &str, docs: &[Document]) -> Result<InsertOutcome> {
        let mut catalog = self.catalog.write().await;
        let model = catalog
            .entry(db.to_string())
            .or_default()
            .entry(coll.to_string())
            .or_insert_with(CollectionModel::new);

        let mut outcome = InsertOutcome::default();
        for doc in docs {
            let id = doc
                .get("_id")
                .cloned()
                .unwrap_or_else(|| Value::ObjectId(ObjectId::new()));
            model.train(doc);
            outcome.inserted_ids.push(id);
            outcome.inserted_count += 1;
        }
        tracing::debug!(db, coll, n = outcome.inserted_count, "trained model");
        Ok(outcome)
    }

    /// Synthesize `n` documents under the given constraints. Unknown
    /// collections yield nothing.
    pub async fn generate_documents(
        &self,
        db: &str,
        coll: &str,
        n: u64,
        constraints: &ConstraintMap,
    ) -> Vec<Document> {
        let catalog = self.catalog.read().await;
        let Some(model) = catalog.get(db).and_then(|c| c.get(coll)) else {
            return Vec::new();
        };
        (0..n).map(|_| model.synthesize_one(constraints)).collect()
    }

    /// Trained-document count, used to size synthesis batches.
    pub async fn collection_size(&self, db: &str, coll: &str) -> u64 {
        let catalog = self.catalog.read().await;
        catalog
            .get(db)
            .and_then(|c| c.get(coll))
            .map_or(0, |m| m.trained)
    }

    pub async fn count(&self, db: &str, coll: &str, filter: &Document) -> Result<i64> {
        if filter.is_empty() {
            return Ok(self.collection_size(db, coll).await as i64);
        }
        let sample = self.sample_matching(db, coll, filter).await;
        Ok(sample.len() as i64)
    }

    pub async fn update(
        &self,
        db: &str,
        coll: &str,
        selector: &Document,
        update: &Document,
        multi: bool,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        let mut matched = self.sample_matching(db, coll, selector).await.len() as i64;
        if !multi {
            matched = matched.min(1);
        }

        let mut outcome = UpdateOutcome {
            matched_count: matched,
            modified_count: matched,
            ..Default::default()
        };

        // Retrain on the shape the update implies so the model drifts with
        // the write traffic.
        let retrain = update_training_doc(selector, update);
        if matched == 0 && upsert {
            let id = retrain
                .get("_id")
                .cloned()
                .unwrap_or_else(|| Value::ObjectId(ObjectId::new()));
            let mut catalog = self.catalog.write().await;
            let model = catalog
                .entry(db.to_string())
                .or_default()
                .entry(coll.to_string())
                .or_insert_with(CollectionModel::new);
            model.train(&retrain);
            outcome.upserted_count = 1;
            outcome.upserted_id = Some(id);
        } else if matched > 0 && !retrain.is_empty() {
            let mut catalog = self.catalog.write().await;
            if let Some(model) = catalog.get_mut(db).and_then(|c| c.get_mut(coll)) {
                for (key, value) in retrain.iter() {
                    if key != "_id" {
                        model.field_mut(key).train(value);
                    }
                }
            }
        }
        Ok(outcome)
    }

    pub async fn delete(
        &self,
        db: &str,
        coll: &str,
        selector: &Document,
        single: bool,
    ) -> Result<DeleteOutcome> {
        let matched = if selector.is_empty() {
            self.collection_size(db, coll).await as i64
        } else {
            self.sample_matching(db, coll, selector).await.len() as i64
        };
        let deleted = if single { matched.min(1) } else { matched };

        let mut catalog = self.catalog.write().await;
        if let Some(model) = catalog.get_mut(db).and_then(|c| c.get_mut(coll)) {
            model.trained = model.trained.saturating_sub(deleted as u64);
        }
        Ok(DeleteOutcome {
            deleted_count: deleted,
        })
    }

    pub async fn create_index(
        &self,
        db: &str,
        coll: &str,
        key: Document,
        name: Option<String>,
        unique: bool,
        sparse: bool,
    ) -> Result<String> {
        let name = name.unwrap_or_else(|| default_index_name(&key));
        let mut catalog = self.catalog.write().await;
        let model = catalog
            .entry(db.to_string())
            .or_default()
            .entry(coll.to_string())
            .or_insert_with(CollectionModel::new);
        if !model.indexes.iter().any(|ix| ix.name == name) {
            model.indexes.push(IndexSpec {
                name: name.clone(),
                key,
                unique,
                sparse,
            });
        }
        Ok(name)
    }

    pub async fn index_count(&self, db: &str, coll: &str) -> usize {
        let catalog = self.catalog.read().await;
        catalog
            .get(db)
            .and_then(|c| c.get(coll))
            .map_or(0, |m| m.indexes.len())
    }

    pub async fn list_indexes(&self, db: &str, coll: &str) -> Vec<Document> {
        let catalog = self.catalog.read().await;
        catalog
            .get(db)
            .and_then(|c| c.get(coll))
            .map(|m| m.indexes.iter().map(IndexSpec::descriptor).collect())
            .unwrap_or_default()
    }

    pub async fn list_databases(&self) -> Vec<String> {
        let catalog = self.catalog.read().await;
        catalog.keys().cloned().collect()
    }

    pub async fn list_collections(&self, db: &str) -> Vec<String> {
        let catalog = self.catalog.read().await;
        catalog
            .get(db)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Estimate how much of the trained distribution a selector matches:
    /// sample the model unconstrained and filter. Constraining here would
    /// fabricate matches for values the model never saw.
    async fn sample_matching(&self, db: &str, coll: &str, selector: &Document) -> Vec<Document> {
        let n = self.collection_size(db, coll).await.min(SAMPLE_CAP);
        self.generate_documents(db, coll, n, &ConstraintMap::new())
            .await
            .into_iter()
            .filter(|d| crate::matcher::matches(d, selector))
            .collect()
    }
}

/// The document shape a write trains on: `$set` fields plus the selector's
/// equality fields; a bare replacement document trains as-is.
fn update_training_doc(selector: &Document, update: &Document) -> Document {
    let mut doc = Document::new();
    for (key, value) in selector.iter() {
        if !key.starts_with('$') && !key.contains('.') && !matches!(value, Value::Document(_)) {
            doc.insert(key, value.clone());
        }
    }
    if update.keys().any(|k| k.starts_with('$')) {
        if let Some(set) = update.get_document("$set") {
            for (key, value) in set.iter() {
                if !key.contains('.') {
                    doc.insert(key, value.clone());
                }
            }
        }
    } else {
        for (key, value) in update.iter() {
            doc.insert(key, value.clone());
        }
    }
    doc
}

fn default_index_name(key: &Document) -> String {
    let parts: Vec<String> = key
        .iter()
        .map(|(k, v)| format!("{}_{}", k, v.as_f64().map(|n| n as i64).unwrap_or(1)))
        .collect();
    parts.join("_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use crate::matcher::matches;

    #[tokio::test]
    async fn insert_trains_and_find_synthesizes() {
        let store = ModelStore::new();
        let docs = vec![
            doc! { "name": "ada", "n": 1 },
            doc! { "name": "ada", "n": 1 },
        ];
        let out = store.insert("d", "t", &docs).await.unwrap();
        assert_eq!(out.inserted_count, 2);
        assert_eq!(out.inserted_ids.len(), 2);

        let generated = store
            .generate_documents("d", "t", 2, &ConstraintMap::new())
            .await;
        assert_eq!(generated.len(), 2);
        for d in &generated {
            // Single-valued fields reproduce exactly.
            assert_eq!(d.get_str("name"), Some("ada"));
            assert_eq!(d.get_i32("n"), Some(1));
            assert!(d.contains_key("_id"));
        }
    }

    #[tokio::test]
    async fn generation_honors_constraints() {
        let store = ModelStore::new();
        let docs: Vec<Document> = (0..20).map(|i| doc! { "n": i }).collect();
        store.insert("d", "t", &docs).await.unwrap();

        let filter = doc! { "n": doc! { "$gte": 5, "$lt": 10 } };
        let constraints = extract_constraints(&filter);
        let generated = store.generate_documents("d", "t", 50, &constraints).await;
        for d in &generated {
            assert!(matches(d, &filter), "constraint violated: {d:?}");
        }
    }

    #[tokio::test]
    async fn equality_constraint_pins_values() {
        let store = ModelStore::new();
        store
            .insert("d", "t", &[doc! { "k": "a" }, doc! { "k": "b" }])
            .await
            .unwrap();
        let constraints = extract_constraints(&doc! { "k": "a" });
        for d in store.generate_documents("d", "t", 10, &constraints).await {
            assert_eq!(d.get_str("k"), Some("a"));
        }
    }

    #[tokio::test]
    async fn count_and_delete_track_trained_size() {
        let store = ModelStore::new();
        let docs: Vec<Document> = (0..5).map(|_| doc! { "x": 1 }).collect();
        store.insert("d", "t", &docs).await.unwrap();
        assert_eq!(store.count("d", "t", &Document::new()).await.unwrap(), 5);

        let out = store.delete("d", "t", &doc! { "x": 1 }, true).await.unwrap();
        assert_eq!(out.deleted_count, 1);
        assert_eq!(store.count("d", "t", &Document::new()).await.unwrap(), 4);

        let out = store
            .delete("d", "t", &Document::new(), false)
            .await
            .unwrap();
        assert_eq!(out.deleted_count, 4);
        assert_eq!(store.count("d", "t", &Document::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn upsert_reports_id_and_trains() {
        let store = ModelStore::new();
        store.ensure_collection("d", "t").await;
        let out = store
            .update(
                "d",
                "t",
                &doc! { "k": "missing" },
                &doc! { "$set": doc! { "v": 9 } },
                false,
                true,
            )
            .await
            .unwrap();
        assert_eq!(out.matched_count, 0);
        assert_eq!(out.upserted_count, 1);
        assert!(out.upserted_id.is_some());
        assert_eq!(store.collection_size("d", "t").await, 1);
    }

    #[tokio::test]
    async fn update_multi_reports_matched_sample() {
        let store = ModelStore::new();
        let docs: Vec<Document> = (0..3).map(|_| doc! { "x": 1 }).collect();
        store.insert("d", "t", &docs).await.unwrap();
        let out = store
            .update(
                "d",
                "t",
                &doc! { "x": 1 },
                &doc! { "$set": doc! { "y": 2 } },
                true,
                false,
            )
            .await
            .unwrap();
        assert_eq!(out.matched_count, 3);
        assert_eq!(out.modified_count, 3);
    }

    #[tokio::test]
    async fn indexes_are_catalogued() {
        let store = ModelStore::new();
        store.ensure_collection("d", "t").await;
        let mut key = Document::new();
        key.insert("a", 1);
        let name = store
            .create_index("d", "t", key, None, true, false)
            .await
            .unwrap();
        assert_eq!(name, "a_1");
        let listed = store.list_indexes("d", "t").await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].get_str("name"), Some("_id_"));
        assert_eq!(listed[1].get_str("name"), Some("a_1"));
        assert_eq!(listed[1].get_bool("unique"), Some(true));
    }

    #[tokio::test]
    async fn catalog_listing() {
        let store = ModelStore::new();
        store.ensure_collection("db1", "a").await;
        store.ensure_collection("db1", "b").await;
        store.ensure_collection("db2", "c").await;
        assert_eq!(store.list_databases().await, vec!["db1", "db2"]);
        assert_eq!(store.list_collections("db1").await, vec!["a", "b"]);
    }

    #[test]
    fn constraint_extraction_covers_operator_map() {
        let filter = doc! {
            "a": 1,
            "b": doc! { "$gt": 2, "$lte": 8 },
            "c": doc! { "$in": ["x", "y"] },
            "d": doc! { "$exists": false },
            "e": doc! { "$ne": 0, "$regex": "^z" },
        };
        let map = extract_constraints(&filter);
        assert_eq!(map["a"].equals, Some(Value::Int32(1)));
        assert_eq!(map["b"].min, Some(2.0));
        assert!(map["b"].exclude_min);
        assert_eq!(map["b"].max, Some(8.0));
        assert!(!map["b"].exclude_max);
        assert_eq!(map["c"].values.as_ref().map(Vec::len), Some(2));
        assert_eq!(map["d"].exists, Some(false));
        assert_eq!(map["e"].not_equals.len(), 1);
        assert_eq!(map["e"].pattern.as_deref(), Some("^z"));
    }
}
