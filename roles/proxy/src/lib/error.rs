//! Error types for the proxy role.
//!
//! One enum covers every failure source; side-tagging wrappers (`Source`,
//! `Dest`, `HandshakeSource`, `HandshakeDest`) let callers tell which half of
//! a proxied session failed without losing the cause.

use std::fmt;

use crate::contracts::store::StoreError;

pub type ProxyResult<T> = core::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// Errors on bad CLI argument input.
    BadCliArgs(String),
    /// Errors on bad `config` TOML/env deserialize.
    BadConfigDeserialize(ext_config::ConfigError),
    /// Errors on semantically invalid configuration, fatal at startup.
    ConfigValidation(String),
    /// Errors on bad `TcpStream` connection.
    Io(std::io::Error),
    /// Errors on bad `serde_json` serialize/deserialize.
    BadSerdeJson(serde_json::Error),
    /// Sv1 protocol library error.
    V1Protocol(sv1_api::Error),
    /// A well-formed message arrived that the current phase does not allow.
    UnexpectedMessage(String),
    /// An operation was cancelled by its caller. Distinct from I/O deadline
    /// errors so shutdown is not reported as a network fault.
    Cancelled,
    /// The connection was closed, either by the peer or by an idle timer.
    ConnectionClosed,
    /// Peer closed the stream.
    Eof,
    /// A frame exceeded the 64 KiB line limit.
    FrameTooLong,
    /// A single write did not complete within the write timeout.
    WriteTimeout,
    /// The destination did not answer a request in time.
    ResponseTimeout(u64),
    /// The destination pool rejected our authorize.
    NotAuthorizedPool(String),
    /// The pool negotiated a different version rolling mask than the miner.
    VersionMaskMismatch { ours: String, theirs: String },
    /// No job received from the destination yet.
    NoJobAvailable,
    /// Autoread started twice or stopped while not running.
    AutoRead(&'static str),
    /// A mining-phase operation ran without an active destination.
    NoActiveDest,
    BadUrl(url::ParseError),
    /// Error on the miner side of a proxied session.
    Source(Box<Error>),
    /// Error on the pool side of a proxied session.
    Dest(Box<Error>),
    /// FirstConnect failed because of the miner.
    HandshakeSource(Box<Error>),
    /// FirstConnect failed because of the pool.
    HandshakeDest(Box<Error>),
    /// Destination change failed; the previous destination stays active.
    ChangeDest(Box<Error>),
    /// Contract store error.
    Store(StoreError),
    /// The contract was closed on chain; normal termination for watchers.
    ContractClosed,
    /// A contract watcher detected missing shares.
    NoShareSubmitted,
    /// A contract watcher detected sustained underdelivery.
    InaccurateHashrate,
    ChannelRecv(async_channel::RecvError),
}

impl Error {
    pub fn source_side(e: Error) -> Self {
        Error::Source(Box::new(e))
    }

    pub fn dest_side(e: Error) -> Self {
        Error::Dest(Box::new(e))
    }

    /// True when the root cause is a cancellation rather than a fault.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Source(e)
            | Error::Dest(e)
            | Error::HandshakeSource(e)
            | Error::HandshakeDest(e)
            | Error::ChangeDest(e) => e.is_cancelled(),
            _ => false,
        }
    }

    pub fn is_dest(&self) -> bool {
        matches!(self, Error::Dest(_) | Error::HandshakeDest(_))
    }

    pub fn is_source(&self) -> bool {
        matches!(self, Error::Source(_) | Error::HandshakeSource(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Error::*;
        match self {
            BadCliArgs(ref e) => write!(f, "bad CLI arg input: {e}"),
            BadConfigDeserialize(ref e) => write!(f, "bad config deserialize: `{e}`"),
            ConfigValidation(ref e) => write!(f, "invalid configuration: {e}"),
            Io(ref e) => write!(f, "I/O error: `{e}`"),
            BadSerdeJson(ref e) => write!(f, "bad serde json: `{e}`"),
            V1Protocol(ref e) => write!(f, "v1 protocol error: `{e}`"),
            UnexpectedMessage(ref m) => write!(f, "unexpected message: {m}"),
            Cancelled => write!(f, "operation cancelled"),
            ConnectionClosed => write!(f, "connection closed"),
            Eof => write!(f, "peer closed the stream"),
            FrameTooLong => write!(f, "line exceeds maximum frame length"),
            WriteTimeout => write!(f, "write timeout"),
            ResponseTimeout(id) => write!(f, "dest response timeout, msg id {id}"),
            NotAuthorizedPool(ref e) => write!(f, "not authorized in the pool: {e}"),
            VersionMaskMismatch { ours, theirs } => {
                write!(f, "pool returned different version rolling mask: ours {ours}, theirs {theirs}")
            }
            NoJobAvailable => write!(f, "no job available from destination"),
            AutoRead(ref s) => write!(f, "auto read: {s}"),
            NoActiveDest => write!(f, "no active destination"),
            BadUrl(ref e) => write!(f, "invalid url: `{e}`"),
            Source(ref e) => write!(f, "source connection error: {e}"),
            Dest(ref e) => write!(f, "destination connection error: {e}"),
            HandshakeSource(ref e) => write!(f, "failure during handshake with source: {e}"),
            HandshakeDest(ref e) => write!(f, "failure during handshake with destination: {e}"),
            ChangeDest(ref e) => write!(f, "destination change error: {e}"),
            Store(ref e) => write!(f, "contract store error: `{e}`"),
            ContractClosed => write!(f, "contract closed"),
            NoShareSubmitted => write!(f, "no share submitted within share timeout"),
            InaccurateHashrate => write!(f, "contract is not delivering accurate hashrate"),
            ChannelRecv(ref e) => write!(f, "channel receive error: `{e}`"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::BadSerdeJson(e)
    }
}

impl From<sv1_api::Error> for Error {
    fn from(e: sv1_api::Error) -> Self {
        Error::V1Protocol(e)
    }
}

impl From<ext_config::ConfigError> for Error {
    fn from(e: ext_config::ConfigError) -> Self {
        Error::BadConfigDeserialize(e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::BadUrl(e)
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Error::Store(e)
    }
}

impl From<async_channel::RecvError> for Error {
    fn from(e: async_channel::RecvError) -> Self {
        Error::ChannelRecv(e)
    }
}
