//! Wire message framing: the fixed 16-byte header plus typed bodies for the
//! seven request opcodes, and the two reply envelopes.

use crate::bson::{Document, decode_document, encode_document};
use crate::error::{Error, Result};

pub const HEADER_LEN: usize = 16;

/// Largest message the framer will accept, header included.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 48_000_000;

pub const OP_REPLY: i32 = 1;
pub const OP_UPDATE: i32 = 2001;
pub const OP_INSERT: i32 = 2002;
pub const OP_QUERY: i32 = 2004;
pub const OP_GET_MORE: i32 = 2005;
pub const OP_DELETE: i32 = 2006;
pub const OP_KILL_CURSORS: i32 = 2007;
pub const OP_MSG: i32 = 2013;

pub const QUERY_FLAG_TAILABLE_CURSOR: u32 = 1 << 1;
pub const UPDATE_FLAG_UPSERT: u32 = 1 << 0;
pub const UPDATE_FLAG_MULTI: u32 = 1 << 1;
pub const DELETE_FLAG_SINGLE_REMOVE: u32 = 1 << 0;
pub const MSG_FLAG_CHECKSUM_PRESENT: u32 = 1 << 0;
pub const REPLY_FLAG_CURSOR_NOT_FOUND: u32 = 1 << 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MessageHeader {
    pub fn parse(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let message_length = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let request_id = i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let response_to = i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let op_code = i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);

        Some((
            Self {
                message_length,
                request_id,
                response_to,
                op_code,
            },
            HEADER_LEN,
        ))
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.message_length.to_le_bytes());
        out.extend_from_slice(&self.request_id.to_le_bytes());
        out.extend_from_slice(&self.response_to.to_le_bytes());
        out.extend_from_slice(&self.op_code.to_le_bytes());
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpQuery {
    pub flags: u32,
    pub full_collection_name: String,
    pub number_to_skip: i32,
    pub number_to_return: i32,
    pub query: Document,
    pub projection: Option<Document>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpInsert {
    pub flags: u32,
    pub full_collection_name: String,
    pub documents: Vec<Document>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpUpdate {
    pub full_collection_name: String,
    pub flags: u32,
    pub selector: Document,
    pub update: Document,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpDelete {
    pub full_collection_name: String,
    pub flags: u32,
    pub selector: Document,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpGetMore {
    pub full_collection_name: String,
    pub number_to_return: i32,
    pub cursor_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpKillCursors {
    pub cursor_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MsgSection {
    /// Kind 0: a single body document.
    Body(Document),
    /// Kind 1: an identified sequence of documents.
    Sequence {
        identifier: String,
        documents: Vec<Document>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpMsg {
    pub flag_bits: u32,
    pub sections: Vec<MsgSection>,
}

impl OpMsg {
    /// The kind-0 body document, which every well-formed request carries.
    pub fn body(&self) -> Option<&Document> {
        self.sections.iter().find_map(|s| match s {
            MsgSection::Body(d) => Some(d),
            MsgSection::Sequence { .. } => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Query(OpQuery),
    Insert(OpInsert),
    Update(OpUpdate),
    Delete(OpDelete),
    GetMore(OpGetMore),
    KillCursors(OpKillCursors),
    Msg(OpMsg),
}

impl Request {
    pub fn op_code(&self) -> i32 {
        match self {
            Request::Query(_) => OP_QUERY,
            Request::Insert(_) => OP_INSERT,
            Request::Update(_) => OP_UPDATE,
            Request::Delete(_) => OP_DELETE,
            Request::GetMore(_) => OP_GET_MORE,
            Request::KillCursors(_) => OP_KILL_CURSORS,
            Request::Msg(_) => OP_MSG,
        }
    }
}

/// Legacy reply envelope, used only to answer QUERY/GET_MORE.
#[derive(Debug, Clone, PartialEq)]
pub struct OpReply {
    pub response_flags: u32,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub documents: Vec<Document>,
}

struct Cur<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cur<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
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

    fn read_i32(&mut self) -> Result<i32> {
        self.need(4)?;
        let b = &self.buf[self.pos..self.pos + 4];
        self.pos += 4;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(self.read_i32()? as u32)
    }

    fn read_i64(&mut self) -> Result<i64> {
        self.need(8)?;
        let b = &self.buf[self.pos..self.pos + 8];
        self.pos += 8;
        Ok(i64::from_le_bytes(b.try_into().unwrap()))
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
            .map_err(|e| Error::Protocol(format!("invalid UTF-8 in cstring: {e}")))?
            .to_string();
        self.pos += 1;
        Ok(s)
    }

    fn read_document(&mut self) -> Result<Document> {
        let (doc, consumed) = decode_document(&self.buf[self.pos..])?;
        self.pos += consumed;
        Ok(doc)
    }
}

/// Parse a request body for a known opcode. Unknown opcodes are a protocol
/// error the caller turns into an error reply.
pub fn parse_request(op_code: i32, body: &[u8]) -> Result<Request> {
    let mut cur = Cur::new(body);
    match op_code {
        OP_QUERY => {
            let flags = cur.read_u32()?;
            let full_collection_name = cur.read_cstring()?;
            let number_to_skip = cur.read_i32()?;
            let number_to_return = cur.read_i32()?;
            let query = cur.read_document()?;
            let projection = if cur.remaining() > 0 {
                Some(cur.read_document()?)
            } else {
                None
            };
            Ok(Request::Query(OpQuery {
                flags,
                full_collection_name,
                number_to_skip,
                number_to_return,
                query,
                projection,
            }))
        }
        OP_INSERT => {
            let flags = cur.read_u32()?;
            let full_collection_name = cur.read_cstring()?;
            let mut documents = Vec::new();
            while cur.remaining() > 0 {
                documents.push(cur.read_document()?);
            }
            Ok(Request::Insert(OpInsert {
                flags,
                full_collection_name,
                documents,
            }))
        }
        OP_UPDATE => {
            let _zero = cur.read_i32()?;
            let full_collection_name = cur.read_cstring()?;
            let flags = cur.read_u32()?;
            let selector = cur.read_document()?;
            let update = cur.read_document()?;
            Ok(Request::Update(OpUpdate {
                full_collection_name,
                flags,
                selector,
                update,
            }))
        }
        OP_DELETE => {
            let _zero = cur.read_i32()?;
            let full_collection_name = cur.read_cstring()?;
            let flags = cur.read_u32()?;
            let selector = cur.read_document()?;
            Ok(Request::Delete(OpDelete {
                full_collection_name,
                flags,
                selector,
            }))
        }
        OP_GET_MORE => {
            let _zero = cur.read_i32()?;
            let full_collection_name = cur.read_cstring()?;
            let number_to_return = cur.read_i32()?;
            let cursor_id = cur.read_i64()?;
            Ok(Request::GetMore(OpGetMore {
                full_collection_name,
                number_to_return,
                cursor_id,
            }))
        }
        OP_KILL_CURSORS => {
            let _zero = cur.read_i32()?;
            let count = cur.read_i32()?;
            if count < 0 {
                return Err(Error::Protocol(format!("negative cursor count {count}")));
            }
            let mut cursor_ids = Vec::with_capacity(count as usize);
            for _ in 0..count {
                cursor_ids.push(cur.read_i64()?);
            }
            Ok(Request::KillCursors(OpKillCursors { cursor_ids }))
        }
        OP_MSG => parse_op_msg(body).map(Request::Msg),
        other => Err(Error::Protocol(format!("unknown opcode {other}"))),
    }
}

fn parse_op_msg(body: &[u8]) -> Result<OpMsg> {
    let mut cur = Cur::new(body);
    let flag_bits = cur.read_u32()?;
    // A trailing CRC32C is tolerated when advertised; its value is ignored.
    let sections_end = if flag_bits & MSG_FLAG_CHECKSUM_PRESENT != 0 {
        body.len()
            .checked_sub(4)
            .ok_or_else(|| Error::Protocol("checksum flag without checksum bytes".into()))?
    } else {
        body.len()
    };

    let mut sections = Vec::new();
    while cur.pos < sections_end {
        match cur.read_u8()? {
            0 => sections.push(MsgSection::Body(cur.read_document()?)),
            1 => {
                let identifier = cur.read_cstring()?;
                let section_len = cur.read_i32()?;
                if section_len < 0 {
                    return Err(Error::Protocol(format!(
                        "negative section length {section_len}"
                    )));
                }
                let docs_end = cur.pos + section_len as usize;
                if docs_end > sections_end {
                    return Err(Error::Truncated {
                        needed: docs_end,
                        available: sections_end,
                    });
                }
                let mut documents = Vec::new();
                while cur.pos < docs_end {
                    documents.push(cur.read_document()?);
                }
                sections.push(MsgSection::Sequence {
                    identifier,
                    documents,
                });
            }
            kind => {
                return Err(Error::Protocol(format!("unknown section kind {kind}")));
            }
        }
    }
    Ok(OpMsg {
        flag_bits,
        sections,
    })
}

fn write_cstring(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

fn finish_frame(request_id: i32, response_to: i32, op_code: i32, body: Vec<u8>) -> Vec<u8> {
    let header = MessageHeader {
        message_length: (HEADER_LEN + body.len()) as i32,
        request_id,
        response_to,
        op_code,
    };
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    header.write_to(&mut out);
    out.extend_from_slice(&body);
    out
}

/// Build a full request frame around a typed body.
pub fn build_request(request_id: i32, request: &Request) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    match request {
        Request::Query(q) => {
            body.extend_from_slice(&q.flags.to_le_bytes());
            write_cstring(&mut body, &q.full_collection_name);
            body.extend_from_slice(&q.number_to_skip.to_le_bytes());
            body.extend_from_slice(&q.number_to_return.to_le_bytes());
            body.extend_from_slice(&encode_document(&q.query)?);
            if let Some(proj) = &q.projection {
                body.extend_from_slice(&encode_document(proj)?);
            }
        }
        Request::Insert(ins) => {
            body.extend_from_slice(&ins.flags.to_le_bytes());
            write_cstring(&mut body, &ins.full_collection_name);
            for doc in &ins.documents {
                body.extend_from_slice(&encode_document(doc)?);
            }
        }
        Request::Update(u) => {
            body.extend_from_slice(&0i32.to_le_bytes());
            write_cstring(&mut body, &u.full_collection_name);
            body.extend_from_slice(&u.flags.to_le_bytes());
            body.extend_from_slice(&encode_document(&u.selector)?);
            body.extend_from_slice(&encode_document(&u.update)?);
        }
        Request::Delete(d) => {
            body.extend_from_slice(&0i32.to_le_bytes());
            write_cstring(&mut body, &d.full_collection_name);
            body.extend_from_slice(&d.flags.to_le_bytes());
            body.extend_from_slice(&encode_document(&d.selector)?);
        }
        Request::GetMore(g) => {
            body.extend_from_slice(&0i32.to_le_bytes());
            write_cstring(&mut body, &g.full_collection_name);
            body.extend_from_slice(&g.number_to_return.to_le_bytes());
            body.extend_from_slice(&g.cursor_id.to_le_bytes());
        }
        Request::KillCursors(k) => {
            body.extend_from_slice(&0i32.to_le_bytes());
            body.extend_from_slice(&(k.cursor_ids.len() as i32).to_le_bytes());
            for id in &k.cursor_ids {
                body.extend_from_slice(&id.to_le_bytes());
            }
        }
        Request::Msg(msg) => {
            // Checksums are advertised-only; never emitted.
            let flags = msg.flag_bits & !MSG_FLAG_CHECKSUM_PRESENT;
            body.extend_from_slice(&flags.to_le_bytes());
            for section in &msg.sections {
                match section {
                    MsgSection::Body(doc) => {
                        body.push(0);
                        body.extend_from_slice(&encode_document(doc)?);
                    }
                    MsgSection::Sequence {
                        identifier,
                        documents,
                    } => {
                        body.push(1);
                        write_cstring(&mut body, identifier);
                        let mut docs_buf = Vec::new();
                        for doc in documents {
                            docs_buf.extend_from_slice(&encode_document(doc)?);
                        }
                        body.extend_from_slice(&(docs_buf.len() as i32).to_le_bytes());
                        body.extend_from_slice(&docs_buf);
                    }
                }
            }
        }
    }
    Ok(finish_frame(request_id, 0, request.op_code(), body))
}

/// Encode an MSG reply carrying a single kind-0 result document.
pub fn encode_op_msg(doc: &Document, response_to: i32, request_id: i32) -> Result<Vec<u8>> {
    let doc_bytes = encode_document(doc)?;
    let mut body = Vec::with_capacity(5 + doc_bytes.len());
    body.extend_from_slice(&0u32.to_le_bytes());
    body.push(0);
    body.extend_from_slice(&doc_bytes);
    Ok(finish_frame(request_id, response_to, OP_MSG, body))
}

/// Encode a legacy REPLY with the provided documents.
pub fn encode_op_reply(
    docs: &[Document],
    response_flags: u32,
    response_to: i32,
    request_id: i32,
) -> Result<Vec<u8>> {
    let cursor_id: i64 = 0;
    let starting_from: i32 = 0;
    let number_returned: i32 = docs.len() as i32;

    let mut body = Vec::new();
    body.extend_from_slice(&response_flags.to_le_bytes());
    body.extend_from_slice(&cursor_id.to_le_bytes());
    body.extend_from_slice(&starting_from.to_le_bytes());
    body.extend_from_slice(&number_returned.to_le_bytes());
    for d in docs {
        body.extend_from_slice(&encode_document(d)?);
    }
    Ok(finish_frame(request_id, response_to, OP_REPLY, body))
}

/// Parse a legacy REPLY body; the client side of the tests reads these.
pub fn parse_op_reply(body: &[u8]) -> Result<OpReply> {
    let mut cur = Cur::new(body);
    let response_flags = cur.read_u32()?;
    let cursor_id = cur.read_i64()?;
    let starting_from = cur.read_i32()?;
    let number_returned = cur.read_i32()?;
    let mut documents = Vec::new();
    for _ in 0..number_returned.max(0) {
        documents.push(cur.read_document()?);
    }
    Ok(OpReply {
        response_flags,
        cursor_id,
        starting_from,
        documents,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    fn roundtrip(req: Request) {
        let frame = build_request(7, &req).unwrap();
        let (header, _) = MessageHeader::parse(&frame).unwrap();
        assert_eq!(header.message_length as usize, frame.len());
        assert_eq!(header.request_id, 7);
        assert_eq!(header.op_code, req.op_code());
        let parsed = parse_request(header.op_code, &frame[HEADER_LEN..]).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn every_opcode_roundtrips() {
        roundtrip(Request::Query(OpQuery {
            flags: 0,
            full_collection_name: "db.coll".into(),
            number_to_skip: 2,
            number_to_return: 10,
            query: doc! { "x": 1 },
            projection: Some(doc! { "x": 1 }),
        }));
        roundtrip(Request::Insert(OpInsert {
            flags: 0,
            full_collection_name: "db.coll".into(),
            documents: vec![doc! { "a": 1 }, doc! { "b": 2 }],
        }));
        roundtrip(Request::Update(OpUpdate {
            full_collection_name: "db.coll".into(),
            flags: UPDATE_FLAG_MULTI,
            selector: doc! { "x": 1 },
            update: doc! { "$set": doc! { "y": 2 } },
        }));
        roundtrip(Request::Delete(OpDelete {
            full_collection_name: "db.coll".into(),
            flags: DELETE_FLAG_SINGLE_REMOVE,
            selector: doc! { "x": 1 },
        }));
        roundtrip(Request::GetMore(OpGetMore {
            full_collection_name: "db.coll".into(),
            number_to_return: 100,
            cursor_id: 0x0102_0304_0506_0708,
        }));
        roundtrip(Request::KillCursors(OpKillCursors {
            cursor_ids: vec![1, -9, i64::MAX],
        }));
        roundtrip(Request::Msg(OpMsg {
            flag_bits: 0,
            sections: vec![
                MsgSection::Body(doc! { "insert": "coll", "$db": "db" }),
                MsgSection::Sequence {
                    identifier: "documents".into(),
                    documents: vec![doc! { "a": 1 }, doc! { "a": 2 }],
                },
            ],
        }));
    }

    #[test]
    fn reply_correlates_to_request_id() {
        let frame = encode_op_reply(&[doc! { "ok": 1.0 }], 0, 42, 1).unwrap();
        let (header, _) = MessageHeader::parse(&frame).unwrap();
        assert_eq!(header.op_code, OP_REPLY);
        assert_eq!(header.response_to, 42);
        let reply = parse_op_reply(&frame[HEADER_LEN..]).unwrap();
        assert_eq!(reply.documents.len(), 1);
        assert_eq!(reply.cursor_id, 0);
    }

    #[test]
    fn msg_trailing_checksum_is_tolerated_and_ignored() {
        let msg = encode_op_msg(&doc! { "ping": 1 }, 0, 1).unwrap();
        let mut body = msg[HEADER_LEN..].to_vec();
        // Flip the checksum bit and append four garbage bytes.
        body[0] |= MSG_FLAG_CHECKSUM_PRESENT as u8;
        body.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        let parsed = parse_op_msg(&body).unwrap();
        assert_eq!(parsed.body().unwrap().get_i32("ping"), Some(1));
    }

    #[test]
    fn unknown_opcode_is_a_protocol_error() {
        let err = parse_request(2012, &[]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "{err:?}");
    }

    #[test]
    fn unknown_msg_section_kind_is_rejected() {
        let mut body = Vec::new();
        body.extend_from_slice(&0u32.to_le_bytes());
        body.push(9);
        let err = parse_op_msg(&body).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "{err:?}");
    }
}
