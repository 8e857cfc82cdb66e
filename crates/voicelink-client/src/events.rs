//! Lifecycle notifications.

use voicelink_core::{Endpoint, ErrorCode, ServerInfo};

/// Something observers of a connection manager may care about.
///
/// Delivered over a broadcast channel; see
/// [`ConnectionManager::subscribe`](crate::ConnectionManager::subscribe).
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected { endpoint: Endpoint },
    /// The link dropped or stopped answering pings; a reconnect follows.
    LinkLost { reason: String },
    ReconnectAttempt { attempt: u32, max: u32 },
    /// Reconnect budget exhausted.
    Failed,
    Disconnected,
    /// Greeting or other status message from the server.
    Status {
        message: String,
        info: Option<ServerInfo>,
    },
    /// An error message not tied to any outstanding request.
    ServerError {
        code: Option<ErrorCode>,
        message: String,
    },
    /// A frame that could not be decoded. The connection stays up.
    DecodeError { error: String },
}
