//! Speech recognition providers.
//!
//! Local providers are shared across sessions (their `transcribe` is
//! stateless); remote providers carry per-connection transport state and are
//! built once per session.

use async_trait::async_trait;

use crate::audio::{self, AudioFormat};
use crate::config::ProviderSettings;
use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceType {
    /// In-process, shareable by reference across sessions.
    Local,
    /// Remote per-session transport.
    NonStream,
}

#[async_trait]
pub trait Asr: Send + Sync {
    fn interface_type(&self) -> InterfaceType;

    /// Transcribe a finalized utterance. Frames are in the session's wire
    /// format. Empty text means the utterance is dropped.
    async fn transcribe(&self, frames: &[Vec<u8>], format: AudioFormat) -> Result<String>;
}

fn frames_to_wav(frames: &[Vec<u8>], format: AudioFormat) -> Result<Vec<u8>> {
    match format {
        AudioFormat::Opus => audio::opus_frames_to_wav_bytes(frames),
        AudioFormat::Pcm => {
            let pcm: Vec<i16> = frames
                .iter()
                .flat_map(|f| f.chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]])))
                .collect();
            let mut out = audio::wav_header(pcm.len());
            for sample in &pcm {
                out.extend_from_slice(&sample.to_le_bytes());
            }
            Ok(out)
        }
    }
}

/// OpenAI-compatible `/audio/transcriptions` adapter (multipart WAV upload).
pub struct OpenAiAsr {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiAsr {
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self> {
        let base_url = settings
            .base_url
            .clone()
            .ok_or_else(|| GatewayError::Configuration("ASR provider needs base_url".into()))?;
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone().unwrap_or_default(),
            model: settings.model_name.clone().unwrap_or_else(|| "whisper-1".to_string()),
        })
    }
}

#[async_trait]
impl Asr for OpenAiAsr {
    fn interface_type(&self) -> InterfaceType {
        InterfaceType::NonStream
    }

    async fn transcribe(&self, frames: &[Vec<u8>], format: AudioFormat) -> Result<String> {
        if frames.is_empty() {
            return Ok(String::new());
        }
        let wav = frames_to_wav(frames, format)?;
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| GatewayError::ProviderFatal(format!("multipart: {e}")))?;
        let form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .part("file", part);
        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(|e| GatewayError::ProviderTransient(format!("asr request: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status, body));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GatewayError::ProviderFatal(format!("asr response: {e}")))?;
        Ok(body
            .get("text")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_frames_build_valid_wav() {
        let frames = vec![vec![0u8; audio::FRAME_SAMPLES * 2]; 2];
        let wav = frames_to_wav(&frames, AudioFormat::Pcm).unwrap();
        assert_eq!(&wav[..4], b"RIFF");
        assert_eq!(wav.len(), 44 + audio::FRAME_SAMPLES * 2 * 2);
    }
}
