//! Dialogue memory backends: `nomem`, `mem_local_short` (summarize on
//! close), and a remote vector store.
//!
//! `save_memory` runs on a detached task during close with a soft deadline;
//! every implementation must tolerate being cancelled mid-flight.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::ProviderSettings;
use crate::dialogue::{Message, Role};
use crate::error::{GatewayError, Result};
use crate::manage_api::ManageApiClient;
use crate::providers::llm::Llm;
use std::sync::Arc;

#[async_trait]
pub trait Memory: Send + Sync {
    /// Context for the current query, or `None` when nothing is stored.
    async fn query_memory(&self, query: &str) -> Result<Option<String>>;

    /// Persist whatever this backend keeps from the finished dialogue.
    async fn save_memory(&self, dialogue: &[Message]) -> Result<()>;
}

/// No-op backend.
pub struct NoMemory;

#[async_trait]
impl Memory for NoMemory {
    async fn query_memory(&self, _query: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn save_memory(&self, _dialogue: &[Message]) -> Result<()> {
        Ok(())
    }
}

const SUMMARY_PROMPT: &str = "あなたは会話要約アシスタントです。以下の会話から、\
ユーザーについて覚えておくべき事実・好み・予定だけを箇条書きで簡潔にまとめてください。\
挨拶や雑談は省いてください。";

/// Summarize-on-close memory. The running summary is kept in memory, seeded
/// from the management API (remote-config mode) or a local per-device file.
pub struct LocalShortMemory {
    llm: Arc<dyn Llm>,
    role_id: String,
    manage_api: Option<ManageApiClient>,
    summary: Mutex<Option<String>>,
}

impl LocalShortMemory {
    pub fn new(
        llm: Arc<dyn Llm>,
        role_id: &str,
        seed_summary: Option<String>,
        manage_api: Option<ManageApiClient>,
    ) -> Self {
        let seeded = seed_summary.or_else(|| {
            std::fs::read_to_string(Self::file_path(role_id)).ok().filter(|s| !s.is_empty())
        });
        Self {
            llm,
            role_id: role_id.to_string(),
            manage_api,
            summary: Mutex::new(seeded),
        }
    }

    fn file_path(role_id: &str) -> std::path::PathBuf {
        std::path::PathBuf::from("data/memory").join(format!("{}.txt", role_id.replace(':', "_")))
    }

    fn transcript(dialogue: &[Message]) -> String {
        dialogue
            .iter()
            .filter(|m| matches!(m.role, Role::User | Role::Assistant) && !m.content.is_empty())
            .map(|m| {
                let who = if m.role == Role::User { "ユーザー" } else { "アシスタント" };
                format!("{who}: {}", m.content)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl Memory for LocalShortMemory {
    async fn query_memory(&self, _query: &str) -> Result<Option<String>> {
        Ok(self.summary.lock().await.clone())
    }

    async fn save_memory(&self, dialogue: &[Message]) -> Result<()> {
        let transcript = Self::transcript(dialogue);
        if transcript.is_empty() {
            return Ok(());
        }
        let summary = self.llm.response_no_stream(SUMMARY_PROMPT, &transcript).await?;
        if summary.is_empty() {
            return Ok(());
        }
        *self.summary.lock().await = Some(summary.clone());
        match &self.manage_api {
            Some(api) => {
                if let Err(e) = api.save_mem_local_short(&self.role_id, &summary).await {
                    warn!("summary upload failed: {e}");
                }
            }
            None => {
                let path = Self::file_path(&self.role_id);
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if let Err(e) = std::fs::write(&path, &summary) {
                    warn!("summary write failed: {e}");
                }
            }
        }
        info!("saved summary memory for {}", self.role_id);
        Ok(())
    }
}

/// Remote vector memory: `query` retrieves top-k snippets, `save` ingests
/// the transcript.
pub struct RemoteVectorMemory {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    role_id: String,
}

impl RemoteVectorMemory {
    pub fn from_settings(settings: &ProviderSettings, role_id: &str) -> Result<Self> {
        let base_url = settings
            .base_url
            .clone()
            .ok_or_else(|| GatewayError::Configuration("Memory provider needs base_url".into()))?;
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone().unwrap_or_default(),
            role_id: role_id.to_string(),
        })
    }
}

#[async_trait]
impl Memory for RemoteVectorMemory {
    async fn query_memory(&self, query: &str) -> Result<Option<String>> {
        let response = self
            .client
            .post(format!("{}/search", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&serde_json::json!({
                "query": query,
                "user_id": self.role_id,
                "limit": 5,
            }))
            .send()
            .await
            .map_err(|e| GatewayError::ProviderTransient(format!("memory search: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status, body));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::ProviderFatal(format!("memory response: {e}")))?;
        let snippets: Vec<String> = body
            .get("results")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.get("memory").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if snippets.is_empty() {
            Ok(None)
        } else {
            Ok(Some(snippets.join("\n")))
        }
    }

    async fn save_memory(&self, dialogue: &[Message]) -> Result<()> {
        let messages: Vec<Value> = dialogue
            .iter()
            .filter(|m| matches!(m.role, Role::User | Role::Assistant) && !m.content.is_empty())
            .map(|m| {
                serde_json::json!({
                    "role": if m.role == Role::User { "user" } else { "assistant" },
                    "content": m.content,
                })
            })
            .collect();
        if messages.is_empty() {
            return Ok(());
        }
        let response = self
            .client
            .post(format!("{}/add", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&serde_json::json!({ "messages": messages, "user_id": self.role_id }))
            .send()
            .await
            .map_err(|e| GatewayError::ProviderTransient(format!("memory add: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status, body));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_skips_system_and_tool_messages() {
        let dialogue = vec![
            Message::system("persona"),
            Message::user("犬を飼い始めたよ"),
            Message::tool_result("id", "raw"),
            Message::assistant("いいですね！"),
        ];
        let t = LocalShortMemory::transcript(&dialogue);
        assert!(t.contains("ユーザー: 犬を飼い始めたよ"));
        assert!(t.contains("アシスタント: いいですね！"));
        assert!(!t.contains("persona"));
        assert!(!t.contains("raw"));
    }

    #[tokio::test]
    async fn nomem_is_a_no_op() {
        let m = NoMemory;
        assert!(m.query_memory("q").await.unwrap().is_none());
        assert!(m.save_memory(&[]).await.is_ok());
    }
}
