pub mod dest;
pub mod framed;
pub mod source;

pub use dest::{tcp_dest_factory, ConnDest, DestConnFactory, DestStats, RESPONSE_TIMEOUT};
pub use framed::{StratumConnection, MAX_LINE_LENGTH, WRITE_TIMEOUT};
pub use source::{ConnSource, SourceStats};
