use std::convert::{TryFrom, TryInto};

pub mod client_to_server;
pub mod server_to_client;

use crate::json_rpc::Message;

/// Errors encountered during conversion between valid json_rpc messages and
/// typed Sv1 messages.
#[derive(Debug)]
pub enum MethodError {
    /// The json_rpc message calls a method not defined by Sv1. Contains the
    /// called method.
    MethodNotFound(String),
    /// The json_rpc Response contains an error; it should just be reported.
    ResponseIsAnError(Box<crate::json_rpc::Response>),
    ParsingMethodError(ParsingMethodError),
    UnexpectedMethod(Method),
}

impl std::fmt::Display for MethodError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use MethodError::*;
        match self {
            MethodNotFound(m) => write!(f, "method not found: `{m}`"),
            ResponseIsAnError(r) => write!(f, "response is an error: `{r:?}`"),
            ParsingMethodError(e) => write!(f, "parsing method error: `{e:?}`"),
            UnexpectedMethod(m) => write!(f, "unexpected method: `{m:?}`"),
        }
    }
}

impl std::error::Error for MethodError {}

impl From<ParsingMethodError> for MethodError {
    fn from(pars_err: ParsingMethodError) -> Self {
        MethodError::ParsingMethodError(pars_err)
    }
}

impl From<crate::error::Error> for MethodError {
    fn from(e: crate::error::Error) -> Self {
        MethodError::ParsingMethodError(ParsingMethodError::BadField(e.to_string()))
    }
}

#[derive(Debug)]
pub enum ParsingMethodError {
    BadField(String),
    ValueNotAnArray(Box<serde_json::Value>),
    WrongArgs(Box<serde_json::Value>),
    ValueNotAString(Box<serde_json::Value>),
    ValueNotAFloat(Box<serde_json::Value>),
    ValueNotAnUnsigned(Box<serde_json::value::Number>),
    UnexpectedValue(Box<serde_json::Value>),
}

impl ParsingMethodError {
    pub fn not_array_from_value(v: serde_json::Value) -> Self {
        ParsingMethodError::ValueNotAnArray(Box::new(v))
    }

    pub fn not_string_from_value(v: serde_json::Value) -> Self {
        ParsingMethodError::ValueNotAString(Box::new(v))
    }

    pub fn not_float_from_value(v: serde_json::Value) -> Self {
        ParsingMethodError::ValueNotAFloat(Box::new(v))
    }

    pub fn not_unsigned_from_value(v: serde_json::value::Number) -> Self {
        ParsingMethodError::ValueNotAnUnsigned(Box::new(v))
    }

    pub fn wrong_args_from_value(v: serde_json::Value) -> Self {
        ParsingMethodError::WrongArgs(Box::new(v))
    }

    pub fn unexpected_value_from_value(v: serde_json::Value) -> Self {
        ParsingMethodError::UnexpectedValue(Box::new(v))
    }
}

#[derive(Debug)]
pub enum Method {
    Client2Server(Client2Server),
    Server2Client(Server2Client),
}

/// Typed requests a miner can send.
#[derive(Debug)]
pub enum Client2Server {
    Configure(client_to_server::Configure),
    Subscribe(client_to_server::Subscribe),
    Authorize(client_to_server::Authorize),
    ExtranonceSubscribe(client_to_server::ExtranonceSubscribe),
    Submit(client_to_server::Submit),
}

impl From<Client2Server> for Method {
    fn from(a: Client2Server) -> Self {
        Method::Client2Server(a)
    }
}

impl TryFrom<Message> for Client2Server {
    type Error = MethodError;

    fn try_from(msg: Message) -> Result<Self, Self::Error> {
        let method: Method = msg.try_into()?;
        match method {
            Method::Client2Server(c2s) => Ok(c2s),
            Method::Server2Client(a) => Err(MethodError::UnexpectedMethod(a.into())),
        }
    }
}

/// Typed notifications a pool can send. Responses are not part of this enum:
/// they are routed by message id to the request that produced them and
/// converted with the typed `*Result` views.
#[derive(Debug)]
pub enum Server2Client {
    Notify(server_to_client::Notify),
    SetDifficulty(server_to_client::SetDifficulty),
    SetExtranonce(server_to_client::SetExtranonce),
    SetVersionMask(server_to_client::SetVersionMask),
}

impl From<Server2Client> for Method {
    fn from(a: Server2Client) -> Self {
        Method::Server2Client(a)
    }
}

impl TryFrom<Message> for Server2Client {
    type Error = MethodError;

    fn try_from(msg: Message) -> Result<Self, Self::Error> {
        let method: Method = msg.try_into()?;
        match method {
            Method::Server2Client(s2c) => Ok(s2c),
            Method::Client2Server(a) => Err(MethodError::UnexpectedMethod(a.into())),
        }
    }
}

impl Method {
    fn from_request(msg: crate::json_rpc::StandardRequest) -> Result<Self, MethodError> {
        let method = match &msg.method[..] {
            "mining.configure" => Client2Server::Configure(msg.try_into()?),
            "mining.subscribe" => Client2Server::Subscribe(msg.try_into()?),
            "mining.authorize" => Client2Server::Authorize(msg.try_into()?),
            "mining.submit" => Client2Server::Submit(msg.try_into()?),
            "mining.extranonce.subscribe" => {
                Client2Server::ExtranonceSubscribe(client_to_server::ExtranonceSubscribe {
                    id: msg.id,
                })
            }
            _ => return Err(MethodError::MethodNotFound(msg.method)),
        };
        Ok(Method::Client2Server(method))
    }

    fn from_notification(msg: crate::json_rpc::Notification) -> Result<Self, MethodError> {
        let method = match &msg.method[..] {
            "mining.notify" => Server2Client::Notify(msg.try_into()?),
            "mining.set_difficulty" => Server2Client::SetDifficulty(msg.try_into()?),
            "mining.set_extranonce" => Server2Client::SetExtranonce(msg.try_into()?),
            "mining.set_version_mask" => Server2Client::SetVersionMask(msg.try_into()?),
            _ => return Err(MethodError::MethodNotFound(msg.method)),
        };
        Ok(Method::Server2Client(method))
    }
}

impl TryFrom<Message> for Method {
    type Error = MethodError;

    fn try_from(msg: Message) -> Result<Self, Self::Error> {
        match msg {
            Message::StandardRequest(msg) => Method::from_request(msg),
            Message::Notification(msg) => Method::from_notification(msg),
            // responses carry no method; they are routed to their request
            // by id before this conversion applies
            Message::Response(msg) => Err(MethodError::ResponseIsAnError(Box::new(msg))),
        }
    }
}
