//! Device-advertised IoT appliances.
//!
//! Descriptors arrive once per connection, states whenever they change.
//! Each descriptor method becomes a callable tool named
//! `<descriptor>_<method>`; invoking one emits a `{type:"iot", commands}`
//! envelope back to the device.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::{GatewayError, Result};
use crate::providers::llm::{FunctionDefinition, ToolDefinition};
use crate::session::ConnectionHandler;

#[derive(Debug, Clone, Deserialize)]
pub struct IotDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub properties: Value,
    #[serde(default)]
    pub methods: Value,
}

#[derive(Default)]
pub struct IotManager {
    descriptors: RwLock<HashMap<String, IotDescriptor>>,
    states: RwLock<HashMap<String, Value>>,
}

fn tool_name(descriptor: &str, method: &str) -> String {
    format!("{}_{}", descriptor.to_lowercase(), method.to_lowercase())
}

impl IotManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_descriptors(&self, descriptors: &Value) {
        let Some(items) = descriptors.as_array() else { return };
        let mut table = self.descriptors.write().unwrap();
        for item in items {
            match serde_json::from_value::<IotDescriptor>(item.clone()) {
                Ok(descriptor) => {
                    info!("iot descriptor registered: {}", descriptor.name);
                    table.insert(descriptor.name.clone(), descriptor);
                }
                Err(e) => warn!("bad iot descriptor: {e}"),
            }
        }
    }

    pub fn handle_states(&self, states: &Value) {
        let Some(items) = states.as_array() else { return };
        let mut table = self.states.write().unwrap();
        for item in items {
            if let Some(name) = item.get("name").and_then(Value::as_str) {
                table.insert(name.to_string(), item.get("state").cloned().unwrap_or(Value::Null));
            }
        }
    }

    pub fn get_state(&self, name: &str) -> Option<Value> {
        self.states.read().unwrap().get(name).cloned()
    }

    /// Resolve a tool name back to its descriptor + method.
    fn resolve(&self, name: &str) -> Option<(String, String)> {
        let descriptors = self.descriptors.read().unwrap();
        for descriptor in descriptors.values() {
            if let Some(methods) = descriptor.methods.as_object() {
                for method in methods.keys() {
                    if tool_name(&descriptor.name, method) == name {
                        return Some((descriptor.name.clone(), method.clone()));
                    }
                }
            }
        }
        None
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let descriptors = self.descriptors.read().unwrap();
        let mut defs = Vec::new();
        for descriptor in descriptors.values() {
            let Some(methods) = descriptor.methods.as_object() else { continue };
            for (method, spec) in methods {
                let description = spec
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{} の {method}", descriptor.description));
                let parameters = spec
                    .get("parameters")
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}}));
                defs.push(ToolDefinition {
                    r#type: "function".to_string(),
                    function: FunctionDefinition {
                        name: tool_name(&descriptor.name, method),
                        description,
                        parameters,
                    },
                });
            }
        }
        defs
    }

    /// Dispatch a command envelope to the device. The device answers with a
    /// state report, so the spoken confirmation is immediate.
    pub async fn invoke(
        &self,
        conn: &Arc<ConnectionHandler>,
        name: &str,
        arguments_json: &str,
    ) -> Result<String> {
        let (descriptor, method) = self
            .resolve(name)
            .ok_or_else(|| GatewayError::Tool(format!("iot tool '{name}' not registered")))?;
        let parameters: Value =
            serde_json::from_str(arguments_json).unwrap_or_else(|_| json!({}));
        conn.send_json(json!({
            "type": "iot",
            "commands": [{
                "name": descriptor,
                "method": method,
                "parameters": parameters,
            }]
        }))
        .await;
        Ok(format!("{descriptor}に{method}を送信しました"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lamp_descriptors() -> Value {
        json!([{
            "name": "Lamp",
            "description": "リビングのランプ",
            "properties": { "power": { "type": "boolean" } },
            "methods": {
                "TurnOn": { "description": "ランプをつける", "parameters": {"type": "object", "properties": {}} },
                "TurnOff": { "description": "ランプを消す" }
            }
        }])
    }

    #[test]
    fn descriptors_become_tools() {
        let manager = IotManager::new();
        manager.handle_descriptors(&lamp_descriptors());
        assert!(manager.has_tool("lamp_turnon"));
        assert!(manager.has_tool("lamp_turnoff"));
        assert!(!manager.has_tool("lamp_explode"));
        let defs = manager.tool_definitions();
        assert_eq!(defs.len(), 2);
    }

    #[test]
    fn states_are_tracked() {
        let manager = IotManager::new();
        manager.handle_states(&json!([{ "name": "Lamp", "state": { "power": true } }]));
        assert_eq!(manager.get_state("Lamp").unwrap()["power"], true);
        assert!(manager.get_state("Fan").is_none());
    }
}
