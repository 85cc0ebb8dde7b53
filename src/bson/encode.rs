use crate::bson::value::{Document, Value, canonical_regex_options};
use crate::error::{Error, Result};

/// Encode a document to its on-wire byte form.
///
/// The total length is computed up front with the same tag rules the writer
/// uses; the two passes agreeing is an internal invariant.
pub fn encode_document(doc: &Document) -> Result<Vec<u8>> {
    let size = document_size(doc)?;
    let mut buf = Vec::with_capacity(size);
    write_document(&mut buf, doc)?;
    debug_assert_eq!(buf.len(), size, "size precomputation disagrees with writer");
    Ok(buf)
}

/// Total encoded byte length: length prefix + elements + terminator.
pub fn document_size(doc: &Document) -> Result<usize> {
    let mut size = 4 + 1;
    for (key, value) in doc.iter() {
        size += element_size(key, value)?;
    }
    Ok(size)
}

fn element_size(key: &str, value: &Value) -> Result<usize> {
    // Absent sentinel: the whole element is omitted.
    if value.is_undefined() {
        return Ok(0);
    }
    Ok(1 + key.len() + 1 + value_size(value)?)
}

fn value_size(value: &Value) -> Result<usize> {
    Ok(match value {
        Value::Double(_) => 8,
        Value::String(s) | Value::Code(s) => 4 + s.len() + 1,
        Value::Document(d) => document_size(d)?,
        Value::Array(items) => array_size(items)?,
        Value::Binary { bytes, .. } => 4 + 1 + bytes.len(),
        Value::Undefined => 0,
        Value::ObjectId(_) => 12,
        Value::Boolean(_) => 1,
        Value::DateTime(_) => 8,
        Value::Null => 0,
        Value::Regex { pattern, options } => {
            pattern.len() + 1 + canonical_regex_options(options).len() + 1
        }
        Value::Int32(_) => 4,
        Value::Timestamp { .. } => 8,
        Value::Int64(_) => 8,
        Value::MinKey | Value::MaxKey => 0,
    })
}

fn array_size(items: &[Value]) -> Result<usize> {
    let mut size = 4 + 1;
    for (i, item) in items.iter().enumerate() {
        size += element_size(array_key(i).as_str(), item)?;
    }
    Ok(size)
}

fn write_document(buf: &mut Vec<u8>, doc: &Document) -> Result<()> {
    let size = document_size(doc)?;
    buf.extend_from_slice(&(size as i32).to_le_bytes());
    for (key, value) in doc.iter() {
        write_element(buf, key, value)?;
    }
    buf.push(0);
    Ok(())
}

fn write_element(buf: &mut Vec<u8>, key: &str, value: &Value) -> Result<()> {
    let Some(tag) = value.element_tag() else {
        return Ok(());
    };
    buf.push(tag);
    write_cstring(buf, key)?;
    write_value(buf, value)
}

fn write_value(buf: &mut Vec<u8>, value: &Value) -> Result<()> {
    match value {
        Value::Double(n) => buf.extend_from_slice(&n.to_le_bytes()),
        Value::String(s) | Value::Code(s) => write_string(buf, s),
        Value::Document(d) => write_document(buf, d)?,
        Value::Array(items) => {
            let size = array_size(items)?;
            buf.extend_from_slice(&(size as i32).to_le_bytes());
            for (i, item) in items.iter().enumerate() {
                write_element(buf, array_key(i).as_str(), item)?;
            }
            buf.push(0);
        }
        Value::Binary { subtype, bytes } => {
            buf.extend_from_slice(&(bytes.len() as i32).to_le_bytes());
            buf.push(*subtype);
            buf.extend_from_slice(bytes);
        }
        Value::Undefined => {}
        Value::ObjectId(oid) => buf.extend_from_slice(&oid.bytes()),
        Value::Boolean(b) => buf.push(u8::from(*b)),
        Value::DateTime(ms) => buf.extend_from_slice(&ms.to_le_bytes()),
        Value::Null => {}
        Value::Regex { pattern, options } => {
            write_cstring(buf, pattern)?;
            write_cstring(buf, &canonical_regex_options(options))?;
        }
        Value::Int32(n) => buf.extend_from_slice(&n.to_le_bytes()),
        Value::Timestamp { low, high } => {
            buf.extend_from_slice(&low.to_le_bytes());
            buf.extend_from_slice(&high.to_le_bytes());
        }
        Value::Int64(n) => buf.extend_from_slice(&n.to_le_bytes()),
        Value::MinKey | Value::MaxKey => {}
    }
    Ok(())
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&((s.len() + 1) as i32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

fn write_cstring(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    if s.as_bytes().contains(&0) {
        return Err(Error::InvalidValue(format!(
            "cstring contains interior NUL: {s:?}"
        )));
    }
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    Ok(())
}

fn array_key(i: usize) -> String {
    i.to_string()
}
