//! Stratum v1 flavour of JSON-RPC: one message per newline-terminated frame.
//!
//! Unlike JSON-RPC 2.0 the error member is a three element array
//! `[code, message, data]` and notifications omit the id.
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(untagged)]
pub enum Message {
    StandardRequest(StandardRequest),
    Notification(Notification),
    Response(Response),
}

impl Message {
    pub fn is_response(&self) -> bool {
        matches!(self, Message::Response(_))
    }

    /// Message id for requests and responses, `None` for notifications.
    pub fn id(&self) -> Option<u64> {
        match self {
            Message::StandardRequest(r) => Some(r.id),
            Message::Response(r) => Some(r.id),
            Message::Notification(_) => None,
        }
    }

    pub fn error(&self) -> Option<StratumError> {
        match self {
            Message::Response(r) => r.error.clone(),
            _ => None,
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct StandardRequest {
    pub id: u64,
    pub method: String,
    #[serde(rename = "params")]
    pub parameters: Value,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Notification {
    pub method: String,
    #[serde(rename = "params")]
    pub parameters: Value,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Response {
    pub id: u64,
    #[serde(default)]
    pub error: Option<StratumError>,
    #[serde(default)]
    pub result: Value,
}

impl Response {
    pub fn ok(id: u64, result: Value) -> Self {
        Response {
            id,
            error: None,
            result,
        }
    }

    pub fn success(id: u64) -> Self {
        Self::ok(id, Value::Bool(true))
    }

    pub fn from_error(id: u64, error: StratumError) -> Self {
        Response {
            id,
            error: Some(error),
            result: Value::Null,
        }
    }

    pub fn job_not_found(id: u64) -> Self {
        Self::from_error(id, StratumError::job_not_found())
    }

    pub fn duplicate_share(id: u64) -> Self {
        Self::from_error(id, StratumError::duplicate_share())
    }

    pub fn low_difficulty(id: u64) -> Self {
        Self::from_error(id, StratumError::low_difficulty())
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// True iff the response carries a boolean `true` result.
    pub fn is_success(&self) -> bool {
        self.is_ok() && self.result.as_bool().unwrap_or(false)
    }
}

/// Stratum error member: `[code, message, data]`.
#[derive(Clone, Debug, PartialEq)]
pub struct StratumError {
    pub code: i32,
    pub message: String,
    pub data: Option<Value>,
}

pub const ERR_UNKNOWN: i32 = 20;
pub const ERR_JOB_NOT_FOUND: i32 = 21;
pub const ERR_DUPLICATE_SHARE: i32 = 22;
pub const ERR_LOW_DIFFICULTY: i32 = 23;
pub const ERR_UNAUTHORIZED: i32 = 24;
pub const ERR_NOT_SUBSCRIBED: i32 = 25;

impl StratumError {
    pub fn new(code: i32, message: &str) -> Self {
        StratumError {
            code,
            message: message.to_string(),
            data: None,
        }
    }

    pub fn job_not_found() -> Self {
        Self::new(ERR_JOB_NOT_FOUND, "Job not found")
    }

    pub fn duplicate_share() -> Self {
        Self::new(ERR_DUPLICATE_SHARE, "Duplicate share")
    }

    pub fn low_difficulty() -> Self {
        Self::new(ERR_LOW_DIFFICULTY, "Low difficulty share")
    }
}

impl Serialize for StratumError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        (self.code, &self.message, &self.data).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StratumError {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let (code, message, data) = <(i32, String, Option<Value>)>::deserialize(deserializer)?;
        Ok(StratumError {
            code,
            message,
            data,
        })
    }
}

impl From<Response> for Message {
    fn from(res: Response) -> Self {
        Message::Response(res)
    }
}

impl From<StandardRequest> for Message {
    fn from(sr: StandardRequest) -> Self {
        Message::StandardRequest(sr)
    }
}

impl From<Notification> for Message {
    fn from(n: Notification) -> Self {
        Message::Notification(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_notification_and_response() {
        let req: Message =
            serde_json::from_str(r#"{"id":1,"method":"mining.subscribe","params":[]}"#).unwrap();
        assert!(matches!(req, Message::StandardRequest(_)));

        let notif: Message =
            serde_json::from_str(r#"{"method":"mining.set_difficulty","params":[1000]}"#).unwrap();
        assert!(matches!(notif, Message::Notification(_)));

        let res: Message =
            serde_json::from_str(r#"{"id":1,"result":true,"error":null}"#).unwrap();
        assert!(matches!(res, Message::Response(_)));
    }

    #[test]
    fn stratum_error_roundtrips_as_array() {
        let msg = Message::from(Response::duplicate_share(4));
        let line = serde_json::to_string(&msg).unwrap();
        assert!(line.contains(r#"[22,"Duplicate share",null]"#));

        let back: Message = serde_json::from_str(&line).unwrap();
        assert_eq!(back.error().unwrap().code, ERR_DUPLICATE_SHARE);
    }
}
