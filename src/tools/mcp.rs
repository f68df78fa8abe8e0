//! Device-side MCP tools, carried over the primary socket.
//!
//! After the client announces `features.mcp=true` the server initiates a
//! JSON-RPC-style exchange wrapped in `{type:"mcp", payload:...}` frames:
//! `initialize`, then `tools/list`, then `tools/call` on demand. Responses
//! arrive asynchronously and are correlated by request id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::providers::llm::{FunctionDefinition, ToolDefinition};
use crate::session::ConnectionHandler;

const CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct McpTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

enum Pending {
    Initialize,
    ToolsList,
    Call(oneshot::Sender<Value>),
}

#[derive(Default)]
pub struct McpClient {
    tools: RwLock<HashMap<String, McpTool>>,
    pending: Mutex<HashMap<i64, Pending>>,
    next_id: AtomicI64,
    ready: AtomicBool,
}

impl McpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.read().unwrap().contains_key(name)
    }

    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .read()
            .unwrap()
            .values()
            .map(|t| ToolDefinition {
                r#type: "function".to_string(),
                function: FunctionDefinition {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.input_schema.clone(),
                },
            })
            .collect()
    }

    async fn send_request(
        &self,
        conn: &Arc<ConnectionHandler>,
        method: &str,
        params: Value,
        pending: Pending,
    ) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.pending.lock().unwrap().insert(id, pending);
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        conn.send_json(json!({ "type": "mcp", "payload": payload })).await;
        id
    }

    /// Kick off the handshake; the rest is driven by inbound responses.
    pub async fn start(self: &Arc<Self>, conn: &Arc<ConnectionHandler>) {
        self.send_request(
            conn,
            "initialize",
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": {
                    "name": "xiaozhi-gateway",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
            Pending::Initialize,
        )
        .await;
    }

    /// Route one inbound `{type:"mcp"}` payload.
    pub async fn handle_payload(self: &Arc<Self>, conn: &Arc<ConnectionHandler>, payload: &Value) {
        let Some(id) = payload.get("id").and_then(Value::as_i64) else {
            debug!("mcp notification: {}", payload.get("method").and_then(serde_json::Value::as_str).unwrap_or("?"));
            return;
        };
        let pending = self.pending.lock().unwrap().remove(&id);
        let Some(pending) = pending else {
            warn!("mcp response with unknown id {id}");
            return;
        };
        if let Some(error) = payload.get("error") {
            warn!("mcp request {id} failed: {error}");
            if let Pending::Call(sender) = pending {
                let _ = sender.send(json!({ "isError": true, "error": error.clone() }));
            }
            return;
        }
        let result = payload.get("result").cloned().unwrap_or(Value::Null);
        match pending {
            Pending::Initialize => {
                info!(
                    "mcp initialized, device capabilities: {}",
                    result.get("capabilities").cloned().unwrap_or(serde_json::Value::Null)
                );
                self.ready.store(true, Ordering::SeqCst);
                self.send_request(conn, "tools/list", json!({}), Pending::ToolsList).await;
            }
            Pending::ToolsList => {
                let mut registered = 0usize;
                if let Some(tools) = result.get("tools").and_then(Value::as_array) {
                    let mut table = self.tools.write().unwrap();
                    for tool in tools {
                        let Some(name) = tool.get("name").and_then(Value::as_str) else {
                            continue;
                        };
                        table.insert(
                            name.to_string(),
                            McpTool {
                                name: name.to_string(),
                                description: tool
                                    .get("description")
                                    .and_then(Value::as_str)
                                    .unwrap_or_default()
                                    .to_string(),
                                input_schema: tool
                                    .get("inputSchema")
                                    .cloned()
                                    .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                            },
                        );
                        registered += 1;
                    }
                }
                info!("registered {registered} mcp tools from device");
            }
            Pending::Call(sender) => {
                let _ = sender.send(result);
            }
        }
    }

    /// Invoke a device tool and wait for the correlated response.
    pub async fn call_tool(
        self: &Arc<Self>,
        conn: &Arc<ConnectionHandler>,
        name: &str,
        arguments_json: &str,
    ) -> Result<String> {
        if !self.has_tool(name) {
            return Err(GatewayError::Tool(format!("mcp tool '{name}' not registered")));
        }
        let arguments: Value =
            serde_json::from_str(arguments_json).unwrap_or_else(|_| json!({}));
        let (tx, rx) = oneshot::channel();
        self.send_request(
            conn,
            "tools/call",
            json!({ "name": name, "arguments": arguments }),
            Pending::Call(tx),
        )
        .await;
        let result = tokio::time::timeout(CALL_TIMEOUT, rx)
            .await
            .map_err(|_| GatewayError::Tool(format!("mcp tool '{name}' timed out")))?
            .map_err(|_| GatewayError::Cancelled)?;
        if result.get("isError").and_then(Value::as_bool).unwrap_or(false) {
            return Err(GatewayError::Tool(format!(
                "mcp tool '{name}' returned an error: {}",
                result.get("error").cloned().unwrap_or(Value::Null)
            )));
        }
        // MCP content is a list of typed parts; text parts carry the answer.
        let text = result
            .get("content")
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|p| p.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();
        Ok(text)
    }

    /// Drop outstanding calls; their waiters observe a cancellation.
    pub fn cleanup(&self) {
        self.pending.lock().unwrap().clear();
        self.ready.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_definitions_reflect_registered_tools() {
        let client = McpClient::new();
        client.tools.write().unwrap().insert(
            "self.camera.take_photo".to_string(),
            McpTool {
                name: "self.camera.take_photo".to_string(),
                description: "写真を撮ります".to_string(),
                input_schema: json!({"type": "object", "properties": {}}),
            },
        );
        assert!(client.has_tool("self.camera.take_photo"));
        let defs = client.tool_definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].function.name, "self.camera.take_photo");
    }
}
