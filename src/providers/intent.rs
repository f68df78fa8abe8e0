//! Intent detection.
//!
//! `nointent` does nothing, `function_call` delegates to the LLM's native
//! tool calling (the router skips detection), and `intent_llm` asks a
//! (possibly dedicated) LLM to emit a `function_call` JSON object, with
//! `continue_chat` as the fall-through sentinel.

use std::sync::Arc;

use async_trait::async_trait;

use crate::dialogue::{Message, Role};
use crate::error::Result;
use crate::providers::llm::Llm;
use crate::utils::extract_json_from_string;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntentKind {
    #[default]
    NoIntent,
    FunctionCall,
    IntentLlm,
}

impl IntentKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "function_call" => IntentKind::FunctionCall,
            "intent_llm" => IntentKind::IntentLlm,
            _ => IntentKind::NoIntent,
        }
    }
}

pub const CONTINUE_CHAT: &str = "continue_chat";

#[async_trait]
pub trait Intent: Send + Sync {
    /// Returns a JSON object string, `{"function_call": {...}}` when a tool
    /// should run, `{"function_call": {"name": "continue_chat"}}` otherwise.
    async fn detect_intent(&self, dialogue: &[Message], text: &str) -> Result<String>;

    /// Turn a tool result into a spoken reply for the intent-routed path.
    async fn reply_result(&self, tool_text: &str, original_query: &str) -> Result<String>;
}

pub struct LlmIntent {
    llm: Arc<dyn Llm>,
    functions: Vec<String>,
}

impl LlmIntent {
    pub fn new(llm: Arc<dyn Llm>, functions: Vec<String>) -> Self {
        Self { llm, functions }
    }

    fn detect_prompt(&self) -> String {
        format!(
            "あなたは音声アシスタントの意図分類器です。直近の会話とユーザーの発話から、\
             呼び出すべき関数を判定してください。利用可能な関数: {}。\
             必ず次の形式のJSONのみを返してください: \
             {{\"function_call\": {{\"name\": \"<関数名>\", \"arguments\": {{...}}}}}}。\
             どの関数にも該当しない場合は name に \"{}\" を指定してください。",
            self.functions.join(", "),
            CONTINUE_CHAT
        )
    }
}

fn recent_turns(dialogue: &[Message], limit: usize) -> String {
    dialogue
        .iter()
        .filter(|m| matches!(m.role, Role::User | Role::Assistant) && !m.content.is_empty())
        .rev()
        .take(limit)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .map(|m| {
            let who = if m.role == Role::User { "user" } else { "assistant" };
            format!("{who}: {}", m.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl Intent for LlmIntent {
    async fn detect_intent(&self, dialogue: &[Message], text: &str) -> Result<String> {
        let user_prompt = format!(
            "会話履歴:\n{}\n\nユーザーの発話: {}",
            recent_turns(dialogue, 6),
            text
        );
        let raw = self.llm.response_no_stream(&self.detect_prompt(), &user_prompt).await?;
        // Models wrap JSON in prose or fences often enough that the
        // extraction helper is the canonical parse path.
        let json = extract_json_from_string(&raw)
            .map(str::to_string)
            .unwrap_or_else(|| format!(r#"{{"function_call": {{"name": "{CONTINUE_CHAT}"}}}}"#));
        Ok(json)
    }

    async fn reply_result(&self, tool_text: &str, original_query: &str) -> Result<String> {
        let prompt = format!(
            "ユーザーの質問「{original_query}」に対してツールが次の情報を返しました:\n{tool_text}\n\
             この情報をもとに、話し言葉で簡潔に答えてください。"
        );
        self.llm.response_no_stream("あなたは親切な音声アシスタントです。", &prompt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parsing() {
        assert_eq!(IntentKind::parse("function_call"), IntentKind::FunctionCall);
        assert_eq!(IntentKind::parse("intent_llm"), IntentKind::IntentLlm);
        assert_eq!(IntentKind::parse("nointent"), IntentKind::NoIntent);
        assert_eq!(IntentKind::parse("whatever"), IntentKind::NoIntent);
    }

    #[test]
    fn recent_turns_keeps_order_and_limit() {
        let dialogue = vec![
            Message::system("s"),
            Message::user("a"),
            Message::assistant("b"),
            Message::user("c"),
        ];
        let text = recent_turns(&dialogue, 2);
        assert_eq!(text, "assistant: b\nuser: c");
    }
}
