use std::fmt;

use crate::methods::Method;

#[derive(Debug)]
pub enum Error {
    BadSerdeJson(serde_json::Error),
    HexError(hex::FromHexError),
    BadHexU32(String),
    BadPrevHashLen(usize),
    /// The method name is not part of Stratum v1. Callers are expected to log
    /// and skip these frames rather than drop the connection.
    UnknownMethod(String),
    /// A well formed message arrived where another was expected.
    UnexpectedMessage(Box<Method>),
    InvalidJsonRpcMessageKind,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Error::*;
        match self {
            BadSerdeJson(e) => write!(f, "bad serde json: `{e:?}`"),
            HexError(e) => write!(f, "bad hex field: `{e:?}`"),
            BadHexU32(s) => write!(f, "bad hex u32: `{s}`"),
            BadPrevHashLen(l) => write!(f, "prev hash must be 32 bytes, got {l}"),
            UnknownMethod(m) => write!(f, "unknown stratum method: `{m}`"),
            UnexpectedMessage(m) => write!(f, "unexpected message: `{m:?}`"),
            InvalidJsonRpcMessageKind => write!(f, "invalid json rpc message kind"),
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::BadSerdeJson(e)
    }
}

impl From<hex::FromHexError> for Error {
    fn from(e: hex::FromHexError) -> Self {
        Error::HexError(e)
    }
}
