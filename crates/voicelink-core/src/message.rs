//! Protocol messages.
//!
//! Every frame on the wire is one JSON object tagged by `type`. The payload
//! types live in [`crate::payload`]; this module provides the envelope and its
//! codec.

use crate::payload::{RequestData, ResponseData, ServerInfo};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier linking a request to its response or error.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    Text(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        Self::Number(n)
    }
}

/// Machine-readable reason carried by `error` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BadRequest,
    UnknownType,
    UnexpectedType,
    HandlerFailed,
    Unsupported,
    SpeakerRejected,
    /// A code this build does not know about.
    #[serde(other)]
    Unknown,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BadRequest => "BAD_REQUEST",
            Self::UnknownType => "UNKNOWN_TYPE",
            Self::UnexpectedType => "UNEXPECTED_TYPE",
            Self::HandlerFailed => "HANDLER_FAILED",
            Self::Unsupported => "UNSUPPORTED",
            Self::SpeakerRejected => "SPEAKER_REJECTED",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// A wire message.
///
/// `timestamp` is milliseconds since the Unix epoch and defaults to 0 when a
/// peer omits it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Request {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        data: RequestData,
        #[serde(default)]
        timestamp: u64,
    },
    Response {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        #[serde(default)]
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<ResponseData>,
        #[serde(default)]
        timestamp: u64,
    },
    Ping {
        #[serde(default)]
        timestamp: u64,
    },
    Pong {
        #[serde(default)]
        timestamp: u64,
    },
    Error {
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
        error: String,
        #[serde(rename = "errorCode", default, skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
        #[serde(default)]
        timestamp: u64,
    },
    Status {
        #[serde(default)]
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<ServerInfo>,
        #[serde(default)]
        timestamp: u64,
    },
}

const KNOWN_TYPES: [&str; 6] = ["request", "response", "ping", "pong", "error", "status"];

impl Message {
    pub fn request(request_id: RequestId, data: RequestData) -> Self {
        Self::Request {
            request_id,
            data,
            timestamp: now_millis(),
        }
    }

    pub fn response(request_id: RequestId, message: String, data: Option<ResponseData>) -> Self {
        Self::Response {
            request_id,
            message,
            data,
            timestamp: now_millis(),
        }
    }

    pub fn error(request_id: Option<RequestId>, code: ErrorCode, error: impl Into<String>) -> Self {
        Self::Error {
            request_id,
            error: error.into(),
            code: Some(code),
            timestamp: now_millis(),
        }
    }

    pub fn status(message: impl Into<String>, data: Option<ServerInfo>) -> Self {
        Self::Status {
            message: message.into(),
            data,
            timestamp: now_millis(),
        }
    }

    pub fn ping() -> Self {
        Self::Ping {
            timestamp: now_millis(),
        }
    }

    pub fn pong() -> Self {
        Self::Pong {
            timestamp: now_millis(),
        }
    }

    /// The wire `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request { .. } => "request",
            Self::Response { .. } => "response",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Error { .. } => "error",
            Self::Status { .. } => "status",
        }
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Self::Request { request_id, .. } | Self::Response { request_id, .. } => {
                Some(request_id)
            }
            Self::Error { request_id, .. } => request_id.as_ref(),
            _ => None,
        }
    }
}

/// Error decoding a wire message.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("message is not valid JSON: {0}")]
    Malformed(serde_json::Error),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("message has no type")]
    MissingType,
    #[error("Unknown message type: {kind}")]
    UnknownType {
        kind: String,
        request_id: Option<RequestId>,
    },
    #[error("invalid {kind} message: {source}")]
    InvalidShape {
        kind: String,
        source: serde_json::Error,
    },
    #[error("message of {size} bytes exceeds limit of {limit}")]
    Oversized { size: usize, limit: usize },
}

/// Encode a message as a JSON text frame.
pub fn encode(message: &Message) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

/// Decode a JSON text frame.
///
/// The `type` tag is checked before the body so an unknown type can still
/// report the `requestId` it carried.
pub fn decode(text: &str) -> Result<Message, DecodeError> {
    let value: Value = serde_json::from_str(text).map_err(DecodeError::Malformed)?;
    let Value::Object(fields) = &value else {
        return Err(DecodeError::NotAnObject);
    };
    let kind = match fields.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        _ => return Err(DecodeError::MissingType),
    };
    if !KNOWN_TYPES.contains(&kind.as_str()) {
        let request_id = fields
            .get("requestId")
            .and_then(|id| RequestId::deserialize(id).ok());
        return Err(DecodeError::UnknownType { kind, request_id });
    }
    serde_json::from_value(value).map_err(|source| DecodeError::InvalidShape { kind, source })
}

/// Like [`decode`], but rejects frames longer than `limit` bytes first.
pub fn decode_bounded(text: &str, limit: usize) -> Result<Message, DecodeError> {
    if text.len() > limit {
        return Err(DecodeError::Oversized {
            size: text.len(),
            limit,
        });
    }
    decode(text)
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
