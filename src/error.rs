use std::result::Result as StdResult;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A declared length runs past the bytes actually available.
    #[error("truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unsupported element tag 0x{0:02x}")]
    UnsupportedTag(u8),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    Msg(String),
}

pub type Result<T> = StdResult<T, Error>;
