//! Self-describing binary document format: ordered documents, tagged values,
//! and the byte-level codec the wire protocol embeds.

pub mod decode;
pub mod encode;
pub mod oid;
pub mod value;

pub use decode::decode_document;
pub use encode::{document_size, encode_document};
pub use oid::ObjectId;
pub use value::{Document, Value, canonical_regex_options};

/// Element type tags.
pub mod tag {
    pub const DOUBLE: u8 = 0x01;
    pub const STRING: u8 = 0x02;
    pub const DOCUMENT: u8 = 0x03;
    pub const ARRAY: u8 = 0x04;
    pub const BINARY: u8 = 0x05;
    pub const UNDEFINED: u8 = 0x06;
    pub const OBJECT_ID: u8 = 0x07;
    pub const BOOLEAN: u8 = 0x08;
    pub const DATETIME: u8 = 0x09;
    pub const NULL: u8 = 0x0A;
    pub const REGEX: u8 = 0x0B;
    pub const CODE: u8 = 0x0D;
    pub const INT32: u8 = 0x10;
    pub const TIMESTAMP: u8 = 0x11;
    pub const INT64: u8 = 0x12;
    pub const MIN_KEY: u8 = 0xFF;
    pub const MAX_KEY: u8 = 0x7F;
}
