//! Canned pipeline stages. Nothing here listens or thinks.

use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use voicelink_core::Turn;
use voicelink_server::{
    HandlerError, Inference, SpeakerVerifier, SpeechRecognizer, SpeechSynthesizer,
};

const TRANSCRIPTS: [&str; 5] = [
    "你好小千",
    "今天天气怎么样",
    "播放音乐",
    "设置闹钟",
    "告诉我一个笑话",
];

const REPLIES: [(&str, &str); 5] = [
    ("你好小千", "你好！我是小千，很高兴见到你！有什么可以帮助你的吗？"),
    ("今天天气怎么样", "今天天气不错呢！阳光明媚，适合出门走走。"),
    ("播放音乐", "好的，正在为你播放音乐！"),
    ("设置闹钟", "请告诉我需要设置什么时间的闹钟。"),
    ("告诉我一个笑话", "为什么程序员喜欢黑色？因为光线太亮会看不清代码！哈哈！"),
];

/// Pretend to work for a while.
async fn busy(millis: u64) {
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

pub struct CannedReplies;

#[async_trait]
impl Inference for CannedReplies {
    async fn infer(
        &self,
        prompt: &str,
        _: Option<&str>,
        history: &[Turn],
    ) -> Result<String, HandlerError> {
        busy(500).await;
        let reply = REPLIES
            .iter()
            .find(|(question, _)| *question == prompt.trim())
            .map(|(_, answer)| answer.to_string())
            .unwrap_or_else(|| format!("我收到了你的消息：“{prompt}”。这是一个智能回复，我会尽力帮助你！"));
        tracing::debug!("Replying to {:?} ({} earlier turns)", prompt, history.len());
        Ok(reply)
    }
}

pub struct CannedTranscripts;

#[async_trait]
impl SpeechRecognizer for CannedTranscripts {
    async fn recognize(&self, audio: &[u8]) -> Result<String, HandlerError> {
        busy(200).await;
        let pick = rand::rng().random_range(0..TRANSCRIPTS.len());
        tracing::debug!("Recognized {} bytes of audio", audio.len());
        Ok(TRANSCRIPTS[pick].to_string())
    }
}

/// "Audio" is the text behind a fixed marker.
pub struct MarkerAudio;

#[async_trait]
impl SpeechSynthesizer for MarkerAudio {
    async fn synthesize(
        &self,
        text: &str,
        voice_id: Option<&str>,
    ) -> Result<Vec<u8>, HandlerError> {
        busy(300).await;
        let mut audio = b"MOCK_TTS_AUDIO_DATA_".to_vec();
        if let Some(voice) = voice_id {
            audio.extend_from_slice(voice.as_bytes());
            audio.push(b'_');
        }
        audio.extend_from_slice(text.as_bytes());
        Ok(audio)
    }
}

/// Accepts every speaker.
pub struct AcceptAll;

#[async_trait]
impl SpeakerVerifier for AcceptAll {
    async fn verify(&self, _: &[u8]) -> Result<bool, HandlerError> {
        busy(300).await;
        Ok(true)
    }
}
