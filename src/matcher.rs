//! Predicate evaluation: does a candidate document satisfy a filter
//! document? Used by the CRUD facade on synthesized documents and by the
//! `$match` aggregation stage.

use crate::bson::{Document, Value, canonical_regex_options};
use std::cmp::Ordering;

/// Evaluate a filter against a candidate. An empty filter matches everything.
pub fn matches(doc: &Document, predicate: &Document) -> bool {
    for (key, cond) in predicate.iter() {
        let ok = match key {
            "$and" => match cond.as_array() {
                Some(preds) => preds
                    .iter()
                    .all(|p| p.as_document().is_some_and(|p| matches(doc, p))),
                None => false,
            },
            "$or" => match cond.as_array() {
                Some(preds) => preds
                    .iter()
                    .any(|p| p.as_document().is_some_and(|p| matches(doc, p))),
                None => false,
            },
            "$nor" => match cond.as_array() {
                Some(preds) => !preds
                    .iter()
                    .any(|p| p.as_document().is_some_and(|p| matches(doc, p))),
                None => false,
            },
            "$not" => match cond.as_document() {
                Some(p) => !matches(doc, p),
                None => false,
            },
            path => matches_field(doc, path, cond),
        };
        if !ok {
            return false;
        }
    }
    true
}

fn matches_field(doc: &Document, path: &str, cond: &Value) -> bool {
    let field = resolve_path(doc, path);
    match cond {
        Value::Document(spec) if has_operator(spec) => eval_operators(field, spec),
        Value::Regex { pattern, options } => regex_matches(field, pattern, options),
        other => values_match_eq(field, other),
    }
}

/// Walk a dotted path through nested documents. Absent intermediates and the
/// decoded 0x06 sentinel both resolve to "absent".
pub fn resolve_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        let value = current.get(part)?;
        if parts.peek().is_none() {
            return match value {
                Value::Undefined => None,
                v => Some(v),
            };
        }
        current = value.as_document()?;
    }
    None
}

fn has_operator(spec: &Document) -> bool {
    spec.keys().any(|k| k.starts_with('$'))
}

fn eval_operators(field: Option<&Value>, spec: &Document) -> bool {
    for (op, arg) in spec.iter() {
        let ok = match op {
            "$eq" => values_match_eq(field, arg),
            "$ne" => !values_match_eq(field, arg),
            "$gt" => relational(field, arg) == Some(Ordering::Greater),
            "$gte" => matches!(
                relational(field, arg),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            "$lt" => relational(field, arg) == Some(Ordering::Less),
            "$lte" => matches!(
                relational(field, arg),
                Some(Ordering::Less | Ordering::Equal)
            ),
            "$in" => arg
                .as_array()
                .is_some_and(|cands| cands.iter().any(|c| values_match_eq(field, c))),
            "$nin" => arg
                .as_array()
                .is_some_and(|cands| !cands.iter().any(|c| values_match_eq(field, c))),
            "$exists" => {
                let wanted = match arg {
                    Value::Boolean(b) => *b,
                    other => other.as_f64().map(|n| n != 0.0).unwrap_or(true),
                };
                field.is_some() == wanted
            }
            "$type" => field.is_some_and(|v| type_matches(v, arg)),
            "$regex" => {
                let options = spec.get_str("$options").unwrap_or("");
                match arg {
                    Value::String(pattern) => regex_matches(field, pattern, options),
                    Value::Regex { pattern, options: inner } => {
                        let opts = if options.is_empty() { inner } else { options };
                        regex_matches(field, pattern, opts)
                    }
                    _ => false,
                }
            }
            "$options" => true,
            "$size" => field
                .and_then(Value::as_array)
                .zip(arg.as_f64())
                .is_some_and(|(arr, n)| arr.len() as f64 == n),
            "$all" => match (field.and_then(Value::as_array), arg.as_array()) {
                (Some(arr), Some(wanted)) => wanted
                    .iter()
                    .all(|w| arr.iter().any(|v| values_equal(v, w))),
                _ => false,
            },
            "$elemMatch" => match (field.and_then(Value::as_array), arg.as_document()) {
                (Some(arr), Some(sub)) => arr.iter().any(|elem| match elem {
                    Value::Document(d) => matches(d, sub),
                    scalar => has_operator(sub) && eval_operators(Some(scalar), sub),
                }),
                _ => false,
            },
            "$not" => match arg {
                Value::Document(sub) => !eval_operators(field, sub),
                Value::Regex { pattern, options } => !regex_matches(field, pattern, options),
                _ => false,
            },
            other => {
                tracing::warn!(operator = other, "ignoring unsupported query operator");
                true
            }
        };
        if !ok {
            return false;
        }
    }
    true
}

/// Equality with the absent rule: an absent field compares equal only to
/// explicit null.
fn values_match_eq(field: Option<&Value>, target: &Value) -> bool {
    match field {
        None => matches!(target, Value::Null),
        Some(v) => values_equal(v, target),
    }
}

/// Structural equality: numbers by value across kinds, dates by millisecond,
/// arrays element-wise, documents key-set-equal with recursive equality.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    if a.is_number() && b.is_number() {
        return a.as_f64() == b.as_f64();
    }
    match (a, b) {
        (Value::Null | Value::Undefined, Value::Null | Value::Undefined) => true,
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(v, w)| values_equal(v, w))
        }
        (Value::Document(x), Value::Document(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| values_equal(v, w)))
        }
        (
            Value::Regex { pattern: p1, options: o1 },
            Value::Regex { pattern: p2, options: o2 },
        ) => p1 == p2 && canonical_regex_options(o1) == canonical_regex_options(o2),
        _ => a == b,
    }
}

/// Ordering for `$gt`-family operators: defined only between numerically
/// comparable operands (numbers with numbers, dates with dates). Anything
/// mixed yields no ordering, so the operator evaluates false.
fn relational(field: Option<&Value>, target: &Value) -> Option<Ordering> {
    let field = field?;
    if field.is_number() && target.is_number() {
        return field.as_f64()?.partial_cmp(&target.as_f64()?);
    }
    match (field, target) {
        (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn type_matches(value: &Value, arg: &Value) -> bool {
    match arg {
        Value::String(name) => value.type_name() == name || (name == "number" && value.is_number()),
        other => match other.as_f64() {
            Some(code) => value.element_tag() == Some(code as u8),
            None => false,
        },
    }
}

fn regex_matches(field: Option<&Value>, pattern: &str, options: &str) -> bool {
    let Some(Value::String(s)) = field else {
        return false;
    };
    // `u` and `g` have no matching-time meaning; only i/m/s translate.
    let flags: String = canonical_regex_options(options)
        .chars()
        .filter(|c| matches!(c, 'i' | 'm' | 's'))
        .collect();
    let full = if flags.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{flags}){pattern}")
    };
    match regex::Regex::new(&full) {
        Ok(re) => re.is_match(s),
        Err(e) => {
            tracing::warn!(pattern, error = %e, "invalid regex in filter");
            false
        }
    }
}

/// Canonical cross-type ordering for sorting: a total order so multi-key
/// sorts are well-defined even over mixed-type fields.
pub fn compare_for_sort(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Undefined) => 1,
            Some(Value::MinKey) => 0,
            Some(Value::Null) => 2,
            Some(Value::Int32(_) | Value::Int64(_) | Value::Double(_)) => 3,
            Some(Value::String(_) | Value::Code(_)) => 4,
            Some(Value::Document(_)) => 5,
            Some(Value::Array(_)) => 6,
            Some(Value::Binary { .. }) => 7,
            Some(Value::ObjectId(_)) => 8,
            Some(Value::Boolean(_)) => 9,
            Some(Value::DateTime(_)) => 10,
            Some(Value::Timestamp { .. }) => 11,
            Some(Value::Regex { .. }) => 12,
            Some(Value::MaxKey) => 13,
        }
    }

    let (ra, rb) = (rank(a), rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Some(x), Some(y)) if x.is_number() && y.is_number() => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Code(x)), Some(Value::Code(y))) => x.cmp(y),
        (Some(Value::Boolean(x)), Some(Value::Boolean(y))) => x.cmp(y),
        (Some(Value::DateTime(x)), Some(Value::DateTime(y))) => x.cmp(y),
        (
            Some(Value::Timestamp { low: l1, high: h1 }),
            Some(Value::Timestamp { low: l2, high: h2 }),
        ) => (h1, l1).cmp(&(h2, l2)),
        (Some(Value::ObjectId(x)), Some(Value::ObjectId(y))) => x.bytes().cmp(&y.bytes()),
        (Some(Value::Binary { bytes: x, .. }), Some(Value::Binary { bytes: y, .. })) => x.cmp(y),
        (Some(Value::Array(x)), Some(Value::Array(y))) => {
            for (v, w) in x.iter().zip(y.iter()) {
                let ord = compare_for_sort(Some(v), Some(w));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

/// Stable multi-key sort; each key's direction is ±1.
pub fn sort_documents(docs: &mut [Document], spec: &Document) {
    let keys: Vec<(String, bool)> = spec
        .iter()
        .map(|(k, v)| (k.to_string(), v.as_f64().unwrap_or(1.0) >= 0.0))
        .collect();
    docs.sort_by(|a, b| {
        for (path, ascending) in &keys {
            let ord = compare_for_sort(resolve_path(a, path), resolve_path(b, path));
            let ord = if *ascending { ord } else { ord.reverse() };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}
