//! Speech synthesis providers.
//!
//! A provider turns one text segment into audio bytes (a WAV payload); the
//! TTS engine owns retries, framing and pacing on top of this contract.

use async_trait::async_trait;

use crate::config::ProviderSettings;
use crate::error::{GatewayError, Result};

#[async_trait]
pub trait TtsProvider: Send + Sync {
    /// The active voice name, used to key the wake-word response cache.
    fn voice(&self) -> &str;

    /// Synthesize one segment. Returns a complete WAV payload
    /// (16 kHz mono 16-bit).
    async fn text_to_speak(&self, text: &str) -> Result<Vec<u8>>;
}

/// OpenAI-compatible `/audio/speech` adapter.
pub struct OpenAiTts {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    voice: String,
}

impl OpenAiTts {
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self> {
        let base_url = settings
            .base_url
            .clone()
            .ok_or_else(|| GatewayError::Configuration("TTS provider needs base_url".into()))?;
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone().unwrap_or_default(),
            model: settings.model_name.clone().unwrap_or_else(|| "tts-1".to_string()),
            voice: settings.voice.clone().unwrap_or_else(|| "default".to_string()),
        })
    }
}

#[async_trait]
impl TtsProvider for OpenAiTts {
    fn voice(&self) -> &str {
        &self.voice
    }

    async fn text_to_speak(&self, text: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&serde_json::json!({
                "model": self.model,
                "input": text,
                "voice": self.voice,
                "response_format": "wav",
                "sample_rate": crate::audio::SAMPLE_RATE,
            }))
            .send()
            .await
            .map_err(|e| GatewayError::ProviderTransient(format!("tts request: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status, body));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| GatewayError::ProviderTransient(format!("tts body: {e}")))?;
        if bytes.is_empty() {
            return Err(GatewayError::Tts("empty synthesis payload".into()));
        }
        Ok(bytes.to_vec())
    }
}

/// Placeholder used when a device is unbound: every synthesis attempt fails
/// softly so the session stays up without producing speech.
pub struct SilentTts;

#[async_trait]
impl TtsProvider for SilentTts {
    fn voice(&self) -> &str {
        "default"
    }

    async fn text_to_speak(&self, _text: &str) -> Result<Vec<u8>> {
        Err(GatewayError::Tts("no tts provider configured".into()))
    }
}
