//! Request and response payloads of the speech pipeline.
//!
//! Payloads are untagged on the wire; each variant is recognized by the
//! fields it requires (`prompt`, `audio_data`, `text`).

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Raw audio bytes, carried as base64 text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Audio(pub Vec<u8>);

impl Audio {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl Serialize for Audio {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Audio {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(encoded)
            .map(Audio)
            .map_err(serde::de::Error::custom)
    }
}

/// One turn of prior conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: String,
    pub content: String,
}

/// Ask the language model for a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conversation_history: Vec<Turn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl InferenceRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            conversation_history: Vec::new(),
            max_tokens: None,
            temperature: None,
        }
    }
}

/// A full voice turn: recognize, answer, speak.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceRequest {
    pub audio_data: Audio,
}

/// Speak a piece of text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisRequest {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
}

/// Payload of a `request` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestData {
    Inference(InferenceRequest),
    Voice(VoiceRequest),
    Synthesis(SynthesisRequest),
}

impl RequestData {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Inference(_) => "inference",
            Self::Voice(_) => "voice",
            Self::Synthesis(_) => "synthesis",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceReply {
    pub asr_result: String,
    pub llm_response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_response: Option<Audio>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisReply {
    pub audio_response: Audio,
}

/// Structured part of a `response` message. The reply text itself travels in
/// the envelope's `message` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseData {
    Voice(VoiceReply),
    Synthesis(SynthesisReply),
}

/// Server self-description sent in the greeting `status` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}
