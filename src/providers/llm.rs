//! Streaming LLM client for OpenAI-compatible chat-completion endpoints.
//!
//! Hand-parses SSE over `reqwest::bytes_stream` and forwards deltas through
//! a channel so the chat loop can segment text into the TTS queue as it
//! arrives. Function-calling mode accumulates tool-call fragments the same
//! way plain text streams.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::ProviderSettings;
use crate::dialogue::Message;
use crate::error::{GatewayError, Result};

/// Tool definition for OpenAI-compatible function calling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub r#type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// One streamed delta from the model.
#[derive(Debug, Clone)]
pub enum LlmEvent {
    Text(String),
    /// Fragment of a tool call; id/name arrive on the first fragment,
    /// arguments accumulate across fragments.
    ToolCallDelta {
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
}

#[async_trait]
pub trait Llm: Send + Sync {
    /// Plain streaming turn.
    async fn response(&self, session_id: &str, messages: Vec<Message>)
        -> Result<mpsc::Receiver<LlmEvent>>;

    /// Function-calling streaming turn.
    async fn response_with_functions(
        &self,
        session_id: &str,
        messages: Vec<Message>,
        functions: Vec<ToolDefinition>,
    ) -> Result<mpsc::Receiver<LlmEvent>>;

    /// One-shot non-streaming completion (wake-word refresh, summaries).
    async fn response_no_stream(&self, system_prompt: &str, user_prompt: &str) -> Result<String>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'a str>,
}

pub struct OpenAiLlm {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiLlm {
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self> {
        let base_url = settings
            .base_url
            .clone()
            .ok_or_else(|| GatewayError::Configuration("LLM provider needs base_url".into()))?;
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone().unwrap_or_default(),
            model: settings
                .model_name
                .clone()
                .ok_or_else(|| GatewayError::Configuration("LLM provider needs model_name".into()))?,
        })
    }

    async fn send(&self, request: &ChatRequest<'_>) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(request)
            .send()
            .await
            .map_err(|e| GatewayError::ProviderTransient(format!("llm request: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status, body));
        }
        Ok(response)
    }

    async fn stream(
        &self,
        session_id: &str,
        messages: Vec<Message>,
        functions: Option<Vec<ToolDefinition>>,
    ) -> Result<mpsc::Receiver<LlmEvent>> {
        let request = ChatRequest {
            model: &self.model,
            messages: &messages,
            stream: Some(true),
            tools: functions.as_deref(),
            tool_choice: functions.as_ref().map(|_| "auto"),
        };
        let response = self.send(&request).await?;
        debug!("llm stream opened for session {session_id}");

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!("llm stream read error: {e}");
                        break;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buffer.find("\n\n") {
                    let sse_event = buffer[..pos].to_string();
                    buffer = buffer[pos + 2..].to_string();
                    for line in sse_event.lines() {
                        let Some(data) = line.strip_prefix("data: ") else { continue };
                        if data == "[DONE]" {
                            return;
                        }
                        for event in parse_delta(data) {
                            if tx.send(event).await.is_err() {
                                // Receiver dropped: barge-in or closed turn.
                                return;
                            }
                        }
                    }
                }
            }
        });
        Ok(rx)
    }
}

/// Parse one SSE data payload into zero or more events.
fn parse_delta(data: &str) -> Vec<LlmEvent> {
    let Ok(value) = serde_json::from_str::<Value>(data) else {
        return Vec::new();
    };
    let Some(delta) = value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(|c| c.get("delta"))
    else {
        return Vec::new();
    };
    let mut events = Vec::new();
    if let Some(content) = delta.get("content").and_then(Value::as_str) {
        if !content.is_empty() {
            events.push(LlmEvent::Text(content.to_string()));
        }
    }
    if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            let id = call.get("id").and_then(Value::as_str).map(str::to_string);
            let function = call.get("function");
            let name = function
                .and_then(|f| f.get("name"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let arguments = function
                .and_then(|f| f.get("arguments"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            events.push(LlmEvent::ToolCallDelta { id, name, arguments });
        }
    }
    events
}

#[async_trait]
impl Llm for OpenAiLlm {
    async fn response(
        &self,
        session_id: &str,
        messages: Vec<Message>,
    ) -> Result<mpsc::Receiver<LlmEvent>> {
        self.stream(session_id, messages, None).await
    }

    async fn response_with_functions(
        &self,
        session_id: &str,
        messages: Vec<Message>,
        functions: Vec<ToolDefinition>,
    ) -> Result<mpsc::Receiver<LlmEvent>> {
        self.stream(session_id, messages, Some(functions)).await
    }

    async fn response_no_stream(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let messages = vec![Message::system(system_prompt), Message::user(user_prompt)];
        let request = ChatRequest {
            model: &self.model,
            messages: &messages,
            stream: None,
            tools: None,
            tool_choice: None,
        };
        let response = self.send(&request).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::ProviderFatal(format!("llm response body: {e}")))?;
        let content = body
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(content.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_delta() {
        let events =
            parse_delta(r#"{"choices":[{"delta":{"content":"こん"},"finish_reason":null}]}"#);
        assert!(matches!(&events[..], [LlmEvent::Text(t)] if t == "こん"));
    }

    #[test]
    fn parses_tool_call_fragments() {
        let first = parse_delta(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"get_time","arguments":""}}]}}]}"#,
        );
        match &first[..] {
            [LlmEvent::ToolCallDelta { id, name, arguments }] => {
                assert_eq!(id.as_deref(), Some("call_1"));
                assert_eq!(name.as_deref(), Some("get_time"));
                assert!(arguments.is_empty());
            }
            other => panic!("unexpected events: {other:?}"),
        }
        let cont = parse_delta(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"lang\""}}]}}]}"#,
        );
        match &cont[..] {
            [LlmEvent::ToolCallDelta { id, name, arguments }] => {
                assert!(id.is_none() && name.is_none());
                assert_eq!(arguments, "{\"lang\"");
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn ignores_garbage() {
        assert!(parse_delta("not json").is_empty());
        assert!(parse_delta(r#"{"choices":[]}"#).is_empty());
    }
}
