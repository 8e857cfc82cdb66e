//! The speech pipeline stages a server delegates to.
//!
//! The router only knows these traits; model loading and the actual
//! recognition, inference and synthesis live behind them.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use voicelink_core::{ErrorCode, Turn};

/// Failure of a request handler, reported to the peer as an `error` message.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HandlerError {
    /// The request is well formed but cannot be acted on (empty text, ...).
    #[error("{0}")]
    Invalid(String),
    #[error("{0}")]
    Failed(String),
    #[error("{0} is not available on this server")]
    Unsupported(&'static str),
    #[error("speaker verification rejected the audio")]
    Rejected,
}

impl HandlerError {
    pub fn failed(error: impl fmt::Display) -> Self {
        Self::Failed(error.to_string())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Invalid(_) => ErrorCode::BadRequest,
            Self::Failed(_) => ErrorCode::HandlerFailed,
            Self::Unsupported(_) => ErrorCode::Unsupported,
            Self::Rejected => ErrorCode::SpeakerRejected,
        }
    }
}

/// Produces the assistant's reply to a prompt.
#[async_trait]
pub trait Inference: Send + Sync {
    async fn infer(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        history: &[Turn],
    ) -> Result<String, HandlerError>;
}

/// Turns audio into a transcript.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    async fn recognize(&self, audio: &[u8]) -> Result<String, HandlerError>;
}

/// Turns text into audio.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice_id: Option<&str>) -> Result<Vec<u8>, HandlerError>;
}

/// Decides whether audio comes from an enrolled speaker.
#[async_trait]
pub trait SpeakerVerifier: Send + Sync {
    async fn verify(&self, audio: &[u8]) -> Result<bool, HandlerError>;
}

/// The stages a server was configured with. Only inference is mandatory.
#[derive(Clone)]
pub struct Collaborators {
    pub(crate) inference: Arc<dyn Inference>,
    pub(crate) recognizer: Option<Arc<dyn SpeechRecognizer>>,
    pub(crate) synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    pub(crate) verifier: Option<Arc<dyn SpeakerVerifier>>,
}

impl Collaborators {
    pub fn new(inference: impl Inference + 'static) -> Self {
        Self {
            inference: Arc::new(inference),
            recognizer: None,
            synthesizer: None,
            verifier: None,
        }
    }

    pub fn with_recognizer(mut self, recognizer: impl SpeechRecognizer + 'static) -> Self {
        self.recognizer = Some(Arc::new(recognizer));
        self
    }

    pub fn with_synthesizer(mut self, synthesizer: impl SpeechSynthesizer + 'static) -> Self {
        self.synthesizer = Some(Arc::new(synthesizer));
        self
    }

    pub fn with_verifier(mut self, verifier: impl SpeakerVerifier + 'static) -> Self {
        self.verifier = Some(Arc::new(verifier));
        self
    }

    /// Names advertised in the greeting.
    pub fn capabilities(&self) -> Vec<String> {
        let mut caps = vec!["inference".to_string()];
        if self.recognizer.is_some() {
            caps.push("voice".to_string());
        }
        if self.synthesizer.is_some() {
            caps.push("synthesis".to_string());
        }
        if self.verifier.is_some() {
            caps.push("speaker_verification".to_string());
        }
        caps
    }
}
