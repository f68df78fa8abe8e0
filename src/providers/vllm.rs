//! Vision model adapter backing the `/mcp/vision/explain` side channel.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::ProviderSettings;
use crate::error::{GatewayError, Result};

#[async_trait]
pub trait Vllm: Send + Sync {
    async fn explain(&self, question: &str, image_base64: &str, media_type: &str)
        -> Result<String>;
}

/// OpenAI-compatible multimodal chat completion with a data-URI image part.
pub struct OpenAiVllm {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiVllm {
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self> {
        let base_url = settings
            .base_url
            .clone()
            .ok_or_else(|| GatewayError::Configuration("VLLM provider needs base_url".into()))?;
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone().unwrap_or_default(),
            model: settings
                .model_name
                .clone()
                .ok_or_else(|| GatewayError::Configuration("VLLM provider needs model_name".into()))?,
        })
    }
}

#[async_trait]
impl Vllm for OpenAiVllm {
    async fn explain(
        &self,
        question: &str,
        image_base64: &str,
        media_type: &str,
    ) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": question },
                    { "type": "image_url",
                      "image_url": { "url": format!("data:{media_type};base64,{image_base64}") } }
                ]
            }],
            "max_tokens": 512,
        });
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::ProviderTransient(format!("vllm request: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status, body));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::ProviderFatal(format!("vllm response: {e}")))?;
        Ok(body
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }
}
