//! Ordered message log for one session.
//!
//! Invariants: exactly one system message, always first; a `tool` message is
//! always preceded by an assistant message carrying the matching tool-call id.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// Arguments as a JSON string, the shape function-calling APIs use.
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
}

impl ToolCall {
    pub fn function(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            call_type: "function".to_string(),
            function: FunctionCall { name: name.into(), arguments: arguments.into() },
            index: Some(0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into(), tool_calls: None, tool_call_id: None }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into(), tool_calls: None, tool_call_id: None }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into(), tool_calls: None, tool_call_id: None }
    }

    pub fn assistant_tool_call(call: ToolCall) -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            tool_calls: Some(vec![call]),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

#[derive(Debug, Default)]
pub struct Dialogue {
    messages: Vec<Message>,
}

impl Dialogue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Replace the system message in place, inserting one if absent.
    pub fn update_system_message(&mut self, prompt: &str) {
        match self.messages.iter_mut().find(|m| m.role == Role::System) {
            Some(system) => system.content = prompt.to_string(),
            None => self.messages.insert(0, Message::system(prompt)),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The prompt envelope sent to the LLM: system prompt (with retrieved
    /// memory appended when present) followed by the dialogue so far.
    pub fn llm_messages(&self, memory: Option<&str>) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.messages.len());
        for message in &self.messages {
            if message.role == Role::System {
                let mut system = message.clone();
                if let Some(memory) = memory {
                    if !memory.is_empty() {
                        system.content =
                            format!("{}\n\n関連する記憶:\n{}", system.content, memory);
                    }
                }
                out.push(system);
            } else {
                out.push(message.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn well_formed(dialogue: &Dialogue) -> bool {
        let messages = dialogue.messages();
        messages.iter().enumerate().all(|(i, m)| {
            if m.role != Role::Tool {
                return true;
            }
            let Some(id) = &m.tool_call_id else { return false };
            i > 0
                && messages[i - 1].role == Role::Assistant
                && messages[i - 1]
                    .tool_calls
                    .as_ref()
                    .is_some_and(|calls| calls.iter().any(|c| &c.id == id))
        })
    }

    #[test]
    fn system_message_is_replaced_not_duplicated() {
        let mut d = Dialogue::new();
        d.update_system_message("ペルソナA");
        d.put(Message::user("こんにちは"));
        d.update_system_message("ペルソナB");
        assert_eq!(d.messages().iter().filter(|m| m.role == Role::System).count(), 1);
        assert_eq!(d.messages()[0].content, "ペルソナB");
    }

    #[test]
    fn tool_messages_follow_their_call() {
        let mut d = Dialogue::new();
        d.update_system_message("s");
        d.put(Message::user("時間を教えて"));
        let call = ToolCall::function("call_1", "get_time", "{}");
        d.put(Message::assistant_tool_call(call));
        d.put(Message::tool_result("call_1", "12:00"));
        assert!(well_formed(&d));

        let mut bad = Dialogue::new();
        bad.update_system_message("s");
        bad.put(Message::tool_result("missing", "x"));
        assert!(!well_formed(&bad));
    }

    #[test]
    fn memory_is_appended_to_system_prompt() {
        let mut d = Dialogue::new();
        d.update_system_message("あなたはアシスタントです");
        d.put(Message::user("q"));
        let msgs = d.llm_messages(Some("ユーザーは犬を飼っている"));
        assert!(msgs[0].content.contains("関連する記憶"));
        assert!(msgs[0].content.contains("犬"));
        // Without memory the system prompt is untouched.
        let plain = d.llm_messages(None);
        assert_eq!(plain[0].content, "あなたはアシスタントです");
    }
}
