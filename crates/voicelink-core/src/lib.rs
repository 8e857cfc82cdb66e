//! Core types for voicelink.
//!
//! This crate provides the protocol primitives shared by client and server:
//! the wire envelope, the request/response payloads of the speech pipeline,
//! and the configuration structs both sides load at startup.

pub mod config;
mod message;
mod payload;

pub use config::{
    ClientConfig, ConfigError, Endpoint, HealthCheckConfig, RequestConfig, RetryConfig,
    ServerConfig, SocketConfig,
};
pub use message::{
    decode, decode_bounded, encode, now_millis, DecodeError, ErrorCode, Message, RequestId,
};
pub use payload::{
    Audio, InferenceRequest, RequestData, ResponseData, ServerInfo, SynthesisReply,
    SynthesisRequest, Turn, VoiceReply, VoiceRequest,
};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection lifecycle state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No socket, nothing in progress.
    Disconnected,
    /// Walking the endpoint list.
    Connecting,
    /// Socket established, receive loop running.
    Connected,
    /// Link lost, retrying with backoff.
    Reconnecting,
    /// Retry budget exhausted. Left only by an explicit connect.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}
