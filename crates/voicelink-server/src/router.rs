//! Maps inbound messages to replies.

use crate::collaborators::{Collaborators, HandlerError};
use voicelink_core::{
    decode_bounded, Audio, DecodeError, ErrorCode, Message, RequestData, ResponseData, ServerInfo,
    SocketConfig, SynthesisReply, VoiceReply,
};

/// Stateless dispatcher shared by every connection of a server.
///
/// Every request gets exactly one reply, a `response` or an `error` carrying
/// the request's id. Only client pongs go unanswered.
pub struct Router {
    collaborators: Collaborators,
    info: ServerInfo,
    max_message_size: usize,
}

impl Router {
    pub fn new(name: impl Into<String>, collaborators: Collaborators) -> Self {
        let info = ServerInfo {
            name: name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: collaborators.capabilities(),
        };
        Self {
            collaborators,
            info,
            max_message_size: SocketConfig::default().max_message_size,
        }
    }

    /// Frames longer than `limit` bytes are rejected without being parsed.
    pub fn with_message_limit(mut self, limit: usize) -> Self {
        self.max_message_size = limit;
        self
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    /// Status message sent to every client on accept.
    pub fn greeting(&self) -> Message {
        Message::status(format!("Connected to {}", self.info.name), Some(self.info.clone()))
    }

    /// Handle one text frame. `None` means nothing is sent back.
    pub async fn route(&self, text: &str) -> Option<Message> {
        match decode_bounded(text, self.max_message_size) {
            Ok(message) => self.handle(message).await,
            Err(DecodeError::UnknownType { kind, request_id }) => {
                let error = format!("Unknown message type: {kind}");
                tracing::warn!("{}", error);
                Some(Message::error(request_id, ErrorCode::UnknownType, error))
            }
            Err(e) => {
                tracing::warn!("Rejecting message: {}", e);
                Some(Message::error(None, ErrorCode::BadRequest, e.to_string()))
            }
        }
    }

    pub async fn handle(&self, message: Message) -> Option<Message> {
        match message {
            Message::Request { request_id, data, .. } => {
                let kind = data.kind();
                tracing::debug!("Handling {} request {}", kind, request_id);
                let reply = match self.dispatch(data).await {
                    Ok((text, data)) => Message::response(request_id, text, data),
                    Err(e) => {
                        tracing::warn!("{} request {} failed: {}", kind, request_id, e);
                        Message::error(Some(request_id), e.code(), e.to_string())
                    }
                };
                Some(reply)
            }
            Message::Ping { .. } => Some(Message::pong()),
            Message::Pong { .. } => None,
            other => {
                let kind = other.kind();
                tracing::warn!("Client sent a {} message", kind);
                Some(Message::error(
                    other.request_id().cloned(),
                    ErrorCode::UnexpectedType,
                    format!("Unexpected message type from client: {kind}"),
                ))
            }
        }
    }

    async fn dispatch(
        &self,
        data: RequestData,
    ) -> Result<(String, Option<ResponseData>), HandlerError> {
        match data {
            RequestData::Inference(request) => {
                if request.prompt.trim().is_empty() {
                    return Err(HandlerError::Invalid("prompt is empty".into()));
                }
                let reply = self
                    .collaborators
                    .inference
                    .infer(
                        &request.prompt,
                        request.system_prompt.as_deref(),
                        &request.conversation_history,
                    )
                    .await?;
                Ok((reply, None))
            }
            RequestData::Voice(request) => {
                let reply = self.voice_turn(request.audio_data.as_bytes()).await?;
                Ok((reply.llm_response.clone(), Some(ResponseData::Voice(reply))))
            }
            RequestData::Synthesis(request) => {
                if request.text.trim().is_empty() {
                    return Err(HandlerError::Invalid("text is empty".into()));
                }
                let synthesizer = self
                    .collaborators
                    .synthesizer
                    .as_ref()
                    .ok_or(HandlerError::Unsupported("speech synthesis"))?;
                let audio = synthesizer
                    .synthesize(&request.text, request.voice_id.as_deref())
                    .await?;
                let reply = SynthesisReply {
                    audio_response: Audio(audio),
                };
                Ok((request.text, Some(ResponseData::Synthesis(reply))))
            }
        }
    }

    /// Recognize, check the speaker, answer, and speak the answer if a
    /// synthesizer is available.
    async fn voice_turn(&self, audio: &[u8]) -> Result<VoiceReply, HandlerError> {
        let recognizer = self
            .collaborators
            .recognizer
            .as_ref()
            .ok_or(HandlerError::Unsupported("speech recognition"))?;
        if audio.is_empty() {
            return Err(HandlerError::Invalid("audio is empty".into()));
        }

        let transcript = recognizer.recognize(audio).await?;
        if let Some(verifier) = &self.collaborators.verifier {
            if !verifier.verify(audio).await? {
                return Err(HandlerError::Rejected);
            }
        }
        if transcript.trim().is_empty() {
            return Err(HandlerError::Failed("no speech recognized".into()));
        }

        let answer = self.collaborators.inference.infer(&transcript, None, &[]).await?;
        let audio_response = match &self.collaborators.synthesizer {
            Some(synthesizer) => Some(Audio(synthesizer.synthesize(&answer, None).await?)),
            None => None,
        };
        Ok(VoiceReply {
            asr_result: transcript,
            llm_response: answer,
            audio_response,
        })
    }
}
