use crate::bson::oid::ObjectId;
use crate::bson::tag;
use crate::bson::value::{Document, Value};
use crate::error::{Error, Result};

/// Decode one document from the front of `bytes`, returning it together with
/// the number of bytes consumed.
pub fn decode_document(bytes: &[u8]) -> Result<(Document, usize)> {
    let mut reader = Reader::new(bytes);
    let doc = reader.read_document()?;
    Ok((doc, reader.pos))
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.pos + n > self.buf.len() {
            return Err(Error::Truncated {
                needed: self.pos + n,
                available: self.buf.len(),
            });
        }
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n)?;
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_i32(&mut self) -> Result<i32> {
        let b = self.read_bytes(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i64(&mut self) -> Result<i64> {
        let b = self.read_bytes(8)?;
        Ok(i64::from_le_bytes(b.try_into().unwrap()))
    }

    fn read_f64(&mut self) -> Result<f64> {
        let b = self.read_bytes(8)?;
        Ok(f64::from_le_bytes(b.try_into().unwrap()))
    }

    fn read_cstring(&mut self) -> Result<String> {
        let start = self.pos;
        while self.pos < self.buf.len() && self.buf[self.pos] != 0 {
            self.pos += 1;
        }
        if self.pos >= self.buf.len() {
            return Err(Error::Truncated {
                needed: self.pos + 1,
                available: self.buf.len(),
            });
        }
        let s = std::str::from_utf8(&self.buf[start..self.pos])
            .map_err(|e| Error::InvalidValue(format!("invalid UTF-8 in cstring: {e}")))?
            .to_string();
        self.pos += 1;
        Ok(s)
    }

    /// Length-prefixed string; the declared length includes the terminator.
    fn read_string(&mut self) -> Result<String> {
        let len = self.read_i32()?;
        if len < 1 {
            return Err(Error::InvalidValue(format!("string length {len} < 1")));
        }
        let bytes = self.read_bytes(len as usize)?;
        let (body, term) = bytes.split_at(len as usize - 1);
        if term != [0] {
            return Err(Error::InvalidValue("string missing terminator".into()));
        }
        std::str::from_utf8(body)
            .map(str::to_string)
            .map_err(|e| Error::InvalidValue(format!("invalid UTF-8 in string: {e}")))
    }

    fn read_document(&mut self) -> Result<Document> {
        let start = self.pos;
        let total = self.read_i32()?;
        if total < 5 {
            return Err(Error::InvalidValue(format!(
                "document length {total} < 5"
            )));
        }
        let end = start + total as usize;
        if end > self.buf.len() {
            return Err(Error::Truncated {
                needed: end,
                available: self.buf.len(),
            });
        }

        let mut doc = Document::new();
        loop {
            if self.pos >= end {
                return Err(Error::InvalidValue("document missing terminator".into()));
            }
            let tag = self.read_u8()?;
            if tag == 0 {
                if self.pos != end {
                    return Err(Error::InvalidValue(
                        "document terminator before declared end".into(),
                    ));
                }
                return Ok(doc);
            }
            let key = self.read_cstring()?;
            let value = self.read_value(tag)?;
            doc.insert(key, value);
        }
    }

    fn read_value(&mut self, element_tag: u8) -> Result<Value> {
        Ok(match element_tag {
            tag::DOUBLE => Value::Double(self.read_f64()?),
            tag::STRING => Value::String(self.read_string()?),
            tag::DOCUMENT => Value::Document(self.read_document()?),
            tag::ARRAY => Value::Array(document_to_array(self.read_document()?)),
            tag::BINARY => {
                let len = self.read_i32()?;
                if len < 0 {
                    return Err(Error::InvalidValue(format!("binary length {len} < 0")));
                }
                let subtype = self.read_u8()?;
                let bytes = self.read_bytes(len as usize)?.to_vec();
                Value::Binary { subtype, bytes }
            }
            // Deprecated: accepted on decode, mapped to the absent sentinel.
            tag::UNDEFINED => Value::Undefined,
            tag::OBJECT_ID => {
                let bytes = self.read_bytes(12)?;
                Value::ObjectId(ObjectId::from_bytes(bytes.try_into().unwrap()))
            }
            tag::BOOLEAN => Value::Boolean(self.read_u8()? != 0),
            tag::DATETIME => Value::DateTime(self.read_i64()?),
            tag::NULL => Value::Null,
            tag::REGEX => {
                let pattern = self.read_cstring()?;
                let options = self.read_cstring()?;
                Value::Regex { pattern, options }
            }
            tag::CODE => Value::Code(self.read_string()?),
            tag::INT32 => Value::Int32(self.read_i32()?),
            tag::TIMESTAMP => {
                let low = self.read_u32()?;
                let high = self.read_u32()?;
                Value::Timestamp { low, high }
            }
            tag::INT64 => Value::Int64(self.read_i64()?),
            tag::MIN_KEY => Value::MinKey,
            tag::MAX_KEY => Value::MaxKey,
            other => return Err(Error::UnsupportedTag(other)),
        })
    }
}

/// Array slots arrive as documents keyed "0", "1", …; the sequence ends at
/// the first missing consecutive index.
fn document_to_array(mut doc: Document) -> Vec<Value> {
    let mut items = Vec::with_capacity(doc.len());
    let mut i = 0usize;
    while let Some(v) = doc.remove(&i.to_string()) {
        items.push(v);
        i += 1;
    }
    items
}
