//! Stratum v1 message types for roles speaking the JSON-RPC dialect used by
//! SHA-256 mining pools and miners: newline delimited frames, numeric ids,
//! `[code, message, data]` error members.
//!
//! [`json_rpc::Message`] is the wire level representation; the [`methods`]
//! module provides typed conversions for every method a proxy has to
//! understand (configure/subscribe/authorize/submit from the client, notify
//! and the set_* notifications from the server, plus typed views of the
//! configure and subscribe results).

pub mod error;
pub mod json_rpc;
pub mod methods;
pub mod utils;

pub use error::Error;
pub use json_rpc::Message;
pub use methods::{
    client_to_server, server_to_client, Client2Server, Method, MethodError, Server2Client,
};

/// Parses one newline-stripped frame into a wire message.
///
/// Unknown methods are only detected at the typed conversion layer, so this
/// fails solely on malformed JSON, which is fatal for a connection.
pub fn parse_message(line: &str) -> Result<Message, Error> {
    Ok(serde_json::from_str(line)?)
}

/// Serializes a message into a frame without the trailing newline.
pub fn serialize_message(msg: &Message) -> String {
    // `Message` contains no map with non string keys, serialization cannot fail
    serde_json::to_string(msg).expect("message is always serializable")
}
