use crate::aggregation::pipeline::{Accumulator, Stage};
use crate::bson::{Document, Value, encode_document};
use crate::matcher::{self, compare_for_sort, resolve_path, sort_documents};
use crate::projection::apply_projection;
use std::cmp::Ordering;

/// Run parsed stages over materialized documents.
pub fn execute_pipeline(mut docs: Vec<Document>, stages: &[Stage]) -> Vec<Document> {
    for stage in stages {
        docs = match stage {
            Stage::Match(filter) => docs
                .into_iter()
                .filter(|d| matcher::matches(d, filter))
                .collect(),
            Stage::Project(spec) => docs.iter().map(|d| apply_projection(d, spec)).collect(),
            Stage::Sort(spec) => {
                sort_documents(&mut docs, spec);
                docs
            }
            Stage::Limit(n) => {
                docs.truncate((*n).max(0) as usize);
                docs
            }
            Stage::Skip(n) => {
                let n = (*n).max(0) as usize;
                if n >= docs.len() {
                    Vec::new()
                } else {
                    docs.split_off(n)
                }
            }
            Stage::Group { id, accumulators } => group(docs, id, accumulators),
            Stage::Unwind {
                path,
                preserve_null_and_empty,
            } => unwind(docs, path, *preserve_null_and_empty),
        };
    }
    docs
}

/// Evaluate a stage expression: `"$path"` is a field reference, a document
/// evaluates field-wise, anything else is a literal.
pub fn eval_expr(doc: &Document, expr: &Value) -> Value {
    match expr {
        Value::String(s) if s.starts_with('$') => {
            resolve_path(doc, &s[1..]).cloned().unwrap_or(Value::Undefined)
        }
        Value::Document(fields) => Value::Document(
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), eval_expr(doc, v)))
                .collect(),
        ),
        literal => literal.clone(),
    }
}

struct GroupSlot {
    key: Value,
    docs: Vec<Document>,
}

fn group(docs: Vec<Document>, id: &Value, accumulators: &[(String, Accumulator)]) -> Vec<Document> {
    // Group membership is keyed by the encoded bytes of the evaluated _id so
    // structurally equal keys land in one bucket.
    let mut order: Vec<Vec<u8>> = Vec::new();
    let mut slots: std::collections::HashMap<Vec<u8>, GroupSlot> = std::collections::HashMap::new();

    for doc in docs {
        let key = eval_expr(&doc, id);
        let mut key_doc = Document::new();
        key_doc.insert("", key.clone());
        let Ok(key_bytes) = encode_document(&key_doc) else {
            continue;
        };
        let slot = slots.entry(key_bytes.clone()).or_insert_with(|| {
            order.push(key_bytes);
            GroupSlot {
                key,
                docs: Vec::new(),
            }
        });
        slot.docs.push(doc);
    }

    order
        .into_iter()
        .filter_map(|key_bytes| slots.remove(&key_bytes))
        .map(|slot| {
            let mut out = Document::new();
            out.insert("_id", slot.key.clone());
            for (field, acc) in accumulators {
                out.insert(field.as_str(), accumulate(&slot.docs, acc));
            }
            out
        })
        .collect()
}

fn accumulate(docs: &[Document], acc: &Accumulator) -> Value {
    match acc {
        Accumulator::Sum(expr) => {
            let mut sum = 0.0;
            for d in docs {
                if let Some(n) = eval_expr(d, expr).as_f64() {
                    sum += n;
                }
            }
            Value::number(sum)
        }
        Accumulator::Avg(expr) => {
            let mut sum = 0.0;
            let mut count = 0u64;
            for d in docs {
                if let Some(n) = eval_expr(d, expr).as_f64() {
                    sum += n;
                    count += 1;
                }
            }
            if count == 0 {
                Value::Null
            } else {
                Value::Double(sum / count as f64)
            }
        }
        Accumulator::Min(expr) => extremum(docs, expr, Ordering::Less),
        Accumulator::Max(expr) => extremum(docs, expr, Ordering::Greater),
        Accumulator::Count => Value::number(docs.len() as f64),
        Accumulator::First(expr) => docs
            .first()
            .map(|d| eval_expr(d, expr))
            .unwrap_or(Value::Null),
        Accumulator::Last(expr) => docs
            .last()
            .map(|d| eval_expr(d, expr))
            .unwrap_or(Value::Null),
    }
}

fn extremum(docs: &[Document], expr: &Value, wanted: Ordering) -> Value {
    let mut best: Option<Value> = None;
    for d in docs {
        let v = eval_expr(d, expr);
        if v.is_undefined() || v.is_null() {
            continue;
        }
        best = Some(match best {
            None => v,
            Some(b) => {
                if compare_for_sort(Some(&v), Some(&b)) == wanted {
                    v
                } else {
                    b
                }
            }
        });
    }
    best.unwrap_or(Value::Null)
}

fn unwind(docs: Vec<Document>, path: &str, preserve: bool) -> Vec<Document> {
    let mut out = Vec::new();
    for doc in docs {
        match resolve_path(&doc, path).cloned() {
            Some(Value::Array(items)) if !items.is_empty() => {
                for item in items {
                    let mut clone = doc.clone();
                    set_top_level(&mut clone, path, item);
                    out.push(clone);
                }
            }
            Some(Value::Array(_)) | Some(Value::Null) | None => {
                if preserve {
                    let mut clone = doc.clone();
                    remove_top_level(&mut clone, path);
                    out.push(clone);
                }
            }
            Some(scalar) => {
                let mut clone = doc.clone();
                set_top_level(&mut clone, path, scalar);
                out.push(clone);
            }
        }
    }
    out
}

fn set_top_level(doc: &mut Document, path: &str, value: Value) {
    match path.split_once('.') {
        None => doc.insert(path, value),
        Some((head, rest)) => {
            if let Some(Value::Document(inner)) = doc.get_mut(head) {
                set_top_level(inner, rest, value);
            }
        }
    }
}

fn remove_top_level(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Document(inner)) = doc.get_mut(head) {
                remove_top_level(inner, rest);
            }
        }
    }
}
