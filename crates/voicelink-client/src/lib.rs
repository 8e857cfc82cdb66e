//! Client side of voicelink.
//!
//! A [`ConnectionManager`] keeps one WebSocket open to the best available
//! endpoint, correlates requests with their responses, probes the link with
//! pings, and reconnects with backoff when the link drops.

mod backoff;
mod connection;
mod events;
mod health;
mod tracker;

pub use backoff::Backoff;
pub use connection::ConnectionManager;
pub use events::ClientEvent;

use serde::Serialize;
use voicelink_core::{ConnectionState, Endpoint, ErrorCode, RequestId, ResponseData};

/// Error returned to callers of the connection manager.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,
    #[error("request {0} timed out")]
    RequestTimeout(RequestId),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("server error [{code}]: {message}")]
    Remote { code: ErrorCode, message: String },
    #[error("failed to encode request: {0}")]
    Encode(String),
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

/// A successful answer to a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub request_id: RequestId,
    /// Reply text (the model's answer for inference and voice requests).
    pub message: String,
    pub data: Option<ResponseData>,
    /// Server time in milliseconds since the epoch.
    pub timestamp: u64,
}

/// Counters kept by a connection manager.
///
/// Connection counters count individual endpoint handshakes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub requests_sent: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub last_error: Option<String>,
}

/// Snapshot of a connection manager, see
/// [`ConnectionManager::status`](crate::ConnectionManager::status).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub state: ConnectionState,
    pub endpoint: Option<Endpoint>,
    pub stats: ConnectionStats,
    /// Outstanding request ids, oldest first.
    pub pending_requests: Vec<RequestId>,
    /// Milliseconds since the epoch.
    pub timestamp: u64,
}

impl ConnectionStatus {
    pub fn to_json(&self) -> Result<String, ClientError> {
        serde_json::to_string_pretty(self).map_err(|e| ClientError::Encode(e.to_string()))
    }
}
