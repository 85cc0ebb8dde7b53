//! Projection: shape result documents by an inclusion or exclusion spec,
//! with dotted paths reaching into nested documents.

use crate::bson::{Document, Value};
use crate::matcher::resolve_path;

/// Apply a projection spec. Any truthy value switches the spec into
/// inclusion mode; otherwise the 0-marked fields are stripped from a full
/// copy. `_id` stays in inclusion mode unless excluded with 0.
pub fn apply_projection(doc: &Document, spec: &Document) -> Document {
    if spec.is_empty() {
        return doc.clone();
    }
    let inclusion = spec.iter().any(|(_, v)| truthy(v));
    if inclusion {
        let mut out = Document::new();
        let id_excluded = spec.get("_id").is_some_and(|v| !truthy(v));
        if !id_excluded
            && let Some(id) = doc.get("_id")
        {
            out.insert("_id", id.clone());
        }
        for (path, v) in spec.iter() {
            if !truthy(v) || path == "_id" {
                continue;
            }
            if let Some(value) = resolve_path(doc, path) {
                set_path(&mut out, path, value.clone());
            }
        }
        out
    } else {
        let mut out = doc.clone();
        for (path, v) in spec.iter() {
            if !truthy(v) {
                unset_path(&mut out, path);
            }
        }
        out
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Boolean(b) => *b,
        other => other.as_f64().map(|n| n != 0.0).unwrap_or(false),
    }
}

fn set_path(doc: &mut Document, path: &str, value: Value) {
    match path.split_once('.') {
        None => doc.insert(path, value),
        Some((head, rest)) => {
            if !matches!(doc.get(head), Some(Value::Document(_))) {
                doc.insert(head, Document::new());
            }
            if let Some(Value::Document(inner)) = doc.get_mut(head) {
                set_path(inner, rest, value);
            }
        }
    }
}

fn unset_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Document(inner)) = doc.get_mut(head) {
                unset_path(inner, rest);
            }
        }
    }
}
