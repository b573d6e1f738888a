//! Wire protocol between the controller and the bridge worker.
//!
//! Messages are single JSON objects, one per line, over the worker's
//! stdio. The worker announces itself with a [`Hello`] line; after that
//! every exchange is one [`Request`] line answered by exactly one
//! [`Response`] line carrying the same `id`. There is never more than one
//! request outstanding.

use common::BridgeError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Protocol revision carried in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Command name the session sends to ask the worker to exit.
pub const SHUTDOWN_COMMAND: &str = "shutdown";

/// First line a worker writes once its driver is loaded and usable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub ready: bool,
    pub version: u32,
}

impl Hello {
    pub fn ready() -> Self {
        Self {
            ready: true,
            version: PROTOCOL_VERSION,
        }
    }
}

/// A single command sent to the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub command: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    Error,
}

/// The worker's reply to one [`Request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub status: Status,
    /// Command result when `status` is `ok`.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    /// Error description when `status` is `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(id: u64, payload: Value) -> Self {
        Self {
            id,
            status: Status::Ok,
            payload,
            error: None,
        }
    }

    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            status: Status::Error,
            payload: Value::Null,
            error: Some(message.into()),
        }
    }
}

/// Serialize a message as one protocol line (no trailing newline).
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, BridgeError> {
    serde_json::to_string(message)
        .map_err(|e| BridgeError::Protocol(format!("failed to encode message: {e}")))
}

/// Parse one protocol line into a message.
pub fn decode_line<'a, T: Deserialize<'a>>(line: &'a str) -> Result<T, BridgeError> {
    serde_json::from_str(line.trim())
        .map_err(|e| BridgeError::Protocol(format!("malformed line {:?}: {e}", line.trim())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let mut params = Map::new();
        params.insert("freq".into(), Value::from(2250));
        let req = Request {
            id: 7,
            command: "set_burst".into(),
            params,
        };
        let line = encode_line(&req).unwrap();
        assert!(!line.contains('\n'));
        let back: Request = decode_line(&line).unwrap();
        assert_eq!(back.id, 7);
        assert_eq!(back.command, "set_burst");
        assert_eq!(back.params["freq"], Value::from(2250));
    }

    #[test]
    fn response_error_shape() {
        let resp = Response::error(3, "no such command");
        let line = encode_line(&resp).unwrap();
        let back: Response = decode_line(&line).unwrap();
        assert_eq!(back.status, Status::Error);
        assert_eq!(back.error.as_deref(), Some("no such command"));
        assert!(back.payload.is_null());
    }

    #[test]
    fn malformed_line_is_a_protocol_error() {
        let err = decode_line::<Response>("{not json").unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(_)));
    }

    #[test]
    fn params_default_to_empty() {
        let req: Request = decode_line(r#"{"id":1,"command":"arm"}"#).unwrap();
        assert!(req.params.is_empty());
    }
}
