//! Unified tool dispatch: one entry point routing a function call to the
//! server-plugin registry, the device's MCP tools, or its IoT descriptors.
//! First match wins, in that order.

use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info};

use crate::session::ConnectionHandler;
use crate::tools::iot::IotManager;
use crate::tools::mcp::McpClient;
use crate::tools::{lookup_tool, registered_definitions, FunctionCallData, ToolResult};
use crate::providers::llm::ToolDefinition;

pub struct UnifiedToolHandler {
    pub mcp: Arc<McpClient>,
    pub iot: Arc<IotManager>,
}

impl UnifiedToolHandler {
    pub fn new() -> Self {
        Self { mcp: Arc::new(McpClient::new()), iot: Arc::new(IotManager::new()) }
    }

    /// Everything the LLM may call right now: startup plugins plus whatever
    /// this device has announced.
    pub fn get_functions(&self) -> Vec<ToolDefinition> {
        let mut defs = registered_definitions();
        defs.extend(self.mcp.tool_definitions());
        defs.extend(self.iot.tool_definitions());
        defs
    }

    pub async fn handle_function_call(
        &self,
        conn: &Arc<ConnectionHandler>,
        call: &FunctionCallData,
    ) -> ToolResult {
        info!("dispatching tool call {} ({})", call.name, call.id);

        if let Some(descriptor) = lookup_tool(&call.name) {
            let args: Value =
                serde_json::from_str(&call.arguments).unwrap_or_else(|_| Value::Object(Default::default()));
            return match (descriptor.handler)(conn.clone(), args).await {
                Ok(result) => result,
                Err(e) => {
                    error!("tool '{}' failed: {e}", call.name);
                    ToolResult::Error(format!("{}の実行に失敗しました", call.name))
                }
            };
        }

        if self.mcp.has_tool(&call.name) {
            return match self.mcp.call_tool(conn, &call.name, &call.arguments).await {
                Ok(text) => ToolResult::ReqLlm(text),
                Err(e) => {
                    error!("mcp tool '{}' failed: {e}", call.name);
                    ToolResult::Error("デバイスの操作に失敗しました".to_string())
                }
            };
        }

        if self.iot.has_tool(&call.name) {
            return match self.iot.invoke(conn, &call.name, &call.arguments).await {
                Ok(text) => ToolResult::Response(text),
                Err(e) => {
                    error!("iot tool '{}' failed: {e}", call.name);
                    ToolResult::Error("デバイスの操作に失敗しました".to_string())
                }
            };
        }

        ToolResult::NotFound(format!("{}という機能はまだ使えません", call.name))
    }

    pub fn cleanup(&self) {
        self.mcp.cleanup();
    }
}

impl Default for UnifiedToolHandler {
    fn default() -> Self {
        Self::new()
    }
}
