//! Tool registry and invocation types.
//!
//! Server plugins register once at process startup; MCP and IoT tools are
//! registered per connection after the device reports them. Duplicate names
//! are rejected at registration time.

pub mod builtin;
pub mod handler;
pub mod iot;
pub mod mcp;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use serde_json::Value;

use crate::error::{GatewayError, Result};
use crate::providers::llm::{FunctionDefinition, ToolDefinition};
use crate::session::ConnectionHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolType {
    /// Mutates session control state (exit, volume, ...).
    SystemCtl,
    /// Replaces the system prompt.
    ChangeSysPrompt,
    /// Plain handler whose result feeds back into the turn.
    Wait,
    /// Device-side IoT command.
    IotCtl,
    /// Device-hosted MCP tool.
    McpClientTool,
}

/// Outcome of a tool invocation, driving the turn policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolResult {
    /// Speak this text and end the turn.
    Response(String),
    /// Feed this text back to the LLM as a tool message and re-run once.
    ReqLlm(String),
    /// Tool name did not resolve; spoken as an apology.
    NotFound(String),
    /// Handler failed; spoken as an apology.
    Error(String),
    /// No user-visible side effect.
    None,
}

/// A function call assembled from streamed fragments (or intent routing).
#[derive(Debug, Clone)]
pub struct FunctionCallData {
    pub name: String,
    pub id: String,
    /// Arguments as a JSON string.
    pub arguments: String,
}

pub type ToolHandlerFn = Arc<
    dyn Fn(Arc<ConnectionHandler>, Value) -> BoxFuture<'static, Result<ToolResult>>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub tool_type: ToolType,
    pub handler: ToolHandlerFn,
}

impl ToolDescriptor {
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            r#type: "function".to_string(),
            function: FunctionDefinition {
                name: self.name.clone(),
                description: self.description.clone(),
                parameters: self.parameters.clone(),
            },
        }
    }
}

static REGISTRY: Lazy<RwLock<HashMap<String, Arc<ToolDescriptor>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

pub fn register_tool(descriptor: ToolDescriptor) -> Result<()> {
    let mut registry = REGISTRY.write().unwrap();
    if registry.contains_key(&descriptor.name) {
        return Err(GatewayError::Tool(format!(
            "tool '{}' is already registered",
            descriptor.name
        )));
    }
    registry.insert(descriptor.name.clone(), Arc::new(descriptor));
    Ok(())
}

pub fn lookup_tool(name: &str) -> Option<Arc<ToolDescriptor>> {
    REGISTRY.read().unwrap().get(name).cloned()
}

pub fn registered_definitions() -> Vec<ToolDefinition> {
    REGISTRY.read().unwrap().values().map(|d| d.definition()).collect()
}

pub fn registered_names() -> Vec<String> {
    REGISTRY.read().unwrap().keys().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_descriptor(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: "test".to_string(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
            tool_type: ToolType::Wait,
            handler: Arc::new(|_conn, _args| -> BoxFuture<'static, Result<ToolResult>> {
                Box::pin(async { Ok(ToolResult::None) })
            }),
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let name = format!("dup-{}", uuid::Uuid::new_v4());
        register_tool(noop_descriptor(&name)).unwrap();
        assert!(register_tool(noop_descriptor(&name)).is_err());
        assert!(lookup_tool(&name).is_some());
    }
}
