use crate::bson::{Document, Value};

/// Supported pipeline stages. Anything else is logged and skipped at parse
/// time.
#[derive(Debug, Clone)]
pub enum Stage {
    Match(Document),
    Project(Document),
    Sort(Document),
    Limit(i64),
    Skip(i64),
    Group {
        id: Value,
        accumulators: Vec<(String, Accumulator)>,
    },
    Unwind {
        path: String,
        preserve_null_and_empty: bool,
    },
}

#[derive(Debug, Clone)]
pub enum Accumulator {
    Sum(Value),
    Avg(Value),
    Min(Value),
    Max(Value),
    Count,
    First(Value),
    Last(Value),
}

/// Parse the `pipeline` array of an aggregate command.
pub fn parse_pipeline(stages: &[Value]) -> Vec<Stage> {
    let mut out = Vec::with_capacity(stages.len());
    for stage in stages {
        let Some(doc) = stage.as_document() else {
            tracing::warn!("skipping non-document pipeline stage");
            continue;
        };
        let Some(name) = doc.first_key().map(str::to_string) else {
            continue;
        };
        let spec = doc.get(&name).cloned().unwrap_or(Value::Null);
        match name.as_str() {
            "$match" => {
                if let Value::Document(filter) = spec {
                    out.push(Stage::Match(filter));
                }
            }
            "$project" => {
                if let Value::Document(p) = spec {
                    out.push(Stage::Project(p));
                }
            }
            "$sort" => {
                if let Value::Document(s) = spec {
                    out.push(Stage::Sort(s));
                }
            }
            "$limit" => {
                if let Some(n) = spec.as_f64() {
                    out.push(Stage::Limit(n as i64));
                }
            }
            "$skip" => {
                if let Some(n) = spec.as_f64() {
                    out.push(Stage::Skip(n as i64));
                }
            }
            "$group" => {
                if let Value::Document(g) = spec {
                    out.push(parse_group(&g));
                }
            }
            "$unwind" => out.push(parse_unwind(&spec)),
            other => {
                tracing::warn!(stage = other, "skipping unsupported pipeline stage");
            }
        }
    }
    out
}

fn parse_group(spec: &Document) -> Stage {
    let id = spec.get("_id").cloned().unwrap_or(Value::Null);
    let mut accumulators = Vec::new();
    for (field, acc) in spec.iter() {
        if field == "_id" {
            continue;
        }
        let Some(acc_doc) = acc.as_document() else {
            continue;
        };
        let Some(op) = acc_doc.first_key().map(str::to_string) else {
            continue;
        };
        let arg = acc_doc.get(&op).cloned().unwrap_or(Value::Null);
        let parsed = match op.as_str() {
            "$sum" => Accumulator::Sum(arg),
            "$avg" => Accumulator::Avg(arg),
            "$min" => Accumulator::Min(arg),
            "$max" => Accumulator::Max(arg),
            "$count" => Accumulator::Count,
            "$first" => Accumulator::First(arg),
            "$last" => Accumulator::Last(arg),
            other => {
                tracing::warn!(accumulator = other, "skipping unsupported accumulator");
                continue;
            }
        };
        accumulators.push((field.to_string(), parsed));
    }
    Stage::Group { id, accumulators }
}

fn parse_unwind(spec: &Value) -> Stage {
    match spec {
        Value::String(path) => Stage::Unwind {
            path: path.trim_start_matches('$').to_string(),
            preserve_null_and_empty: false,
        },
        Value::Document(d) => Stage::Unwind {
            path: d
                .get_str("path")
                .unwrap_or("")
                .trim_start_matches('$')
                .to_string(),
            preserve_null_and_empty: d.get_bool("preserveNullAndEmptyArrays").unwrap_or(false),
        },
        _ => Stage::Unwind {
            path: String::new(),
            preserve_null_and_empty: false,
        },
    }
}
