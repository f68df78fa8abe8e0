//! Layered gateway configuration.
//!
//! Three layers, later wins: built-in defaults, the project `config.toml`,
//! and the operator override `data/config.toml`. When `manager-api.url` is
//! set, the merged local config is replaced by the management API's server
//! config at startup (and again on `update_config`), keeping only the local
//! `server` and `manager-api` sections.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GatewayError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";
pub const OVERRIDE_CONFIG_PATH: &str = "data/config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    pub token: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SocketAuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub allowed_devices: Vec<String>,
    #[serde(default)]
    pub tokens: Vec<AuthToken>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_ip")]
    pub ip: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Advertised websocket URL returned by the OTA endpoint. Defaults to
    /// `ws://<ip>:<port>/xiaozhi/v1/`.
    #[serde(default)]
    pub websocket: Option<String>,
    /// Advertised vision-explain URL returned by the OTA endpoint.
    #[serde(default)]
    pub vision_explain: Option<String>,
    /// HS256 secret for side-channel JWTs.
    #[serde(default)]
    pub auth_key: Option<String>,
    #[serde(default)]
    pub auth: SocketAuthConfig,
}

fn default_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_http_port() -> u16 {
    8003
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip: default_ip(),
            port: default_port(),
            http_port: default_http_port(),
            websocket: None,
            vision_explain: None,
            auth_key: None,
            auth: SocketAuthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManagerApiConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default = "default_api_timeout")]
    pub timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
}

fn default_api_timeout() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    6
}
fn default_retry_delay() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndPromptConfig {
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default)]
    pub prompt: Option<String>,
}

impl Default for EndPromptConfig {
    fn default() -> Self {
        Self { enable: true, prompt: None }
    }
}

fn default_true() -> bool {
    true
}

/// One provider entry inside a module table (`[LLM.mainllm]` etc.).
/// Vendor-specific knobs land in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
    /// Dedicated LLM name for memory summarization / intent detection.
    #[serde(default)]
    pub llm: Option<String>,
    #[serde(default)]
    pub threshold: Option<f32>,
    #[serde(default)]
    pub functions: Option<Vec<String>>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default, rename = "manager-api")]
    pub manager_api: ManagerApiConfig,
    /// Chosen provider name per module type (VAD/ASR/LLM/TTS/Memory/Intent/VLLM).
    #[serde(default)]
    pub selected_module: HashMap<String, String>,
    #[serde(default)]
    pub prompt: Option<String>,
    /// Seed summary for `mem_local_short`, delivered by the private config.
    #[serde(default, rename = "summaryMemory")]
    pub summary_memory: Option<String>,
    /// Welcome object sent on `hello`, extended with the session id.
    #[serde(default)]
    pub xiaozhi: Value,
    #[serde(default)]
    pub wakeup_words: Vec<String>,
    #[serde(default)]
    pub exit_commands: Vec<String>,
    #[serde(default = "default_true")]
    pub enable_greeting: bool,
    #[serde(default)]
    pub enable_wakeup_words_response_cache: bool,
    #[serde(default = "default_no_voice_time")]
    pub close_connection_no_voice_time: u64,
    #[serde(default = "default_tts_timeout")]
    pub tts_timeout: u64,
    #[serde(default)]
    pub enable_stop_tts_notify: bool,
    #[serde(default)]
    pub stop_tts_notify_voice: Option<String>,
    #[serde(default)]
    pub end_prompt: EndPromptConfig,
    #[serde(default = "default_assets_dir")]
    pub assets_dir: PathBuf,
    #[serde(default = "default_true")]
    pub delete_audio: bool,
    /// True when this config came from the management API.
    #[serde(default)]
    pub read_config_from_api: bool,
    /// Daily character quota for the device (0 = unlimited), from the
    /// private per-device config.
    #[serde(default)]
    pub device_max_output_size: u64,
    /// 0 = no history reporting, 2 = text+audio, other non-zero = text-only.
    #[serde(default)]
    pub chat_history_conf: u8,
    #[serde(default)]
    pub plugins: HashMap<String, Value>,
    #[serde(default, rename = "VAD")]
    pub vad: HashMap<String, ProviderSettings>,
    #[serde(default, rename = "ASR")]
    pub asr: HashMap<String, ProviderSettings>,
    #[serde(default, rename = "LLM")]
    pub llm: HashMap<String, ProviderSettings>,
    #[serde(default, rename = "TTS")]
    pub tts: HashMap<String, ProviderSettings>,
    #[serde(default, rename = "Memory")]
    pub memory: HashMap<String, ProviderSettings>,
    #[serde(default, rename = "Intent")]
    pub intent: HashMap<String, ProviderSettings>,
    #[serde(default, rename = "VLLM")]
    pub vllm: HashMap<String, ProviderSettings>,
}

fn default_no_voice_time() -> u64 {
    120
}
fn default_tts_timeout() -> u64 {
    10
}
fn default_assets_dir() -> PathBuf {
    PathBuf::from("config/assets")
}

impl Config {
    /// Load and merge the local layers. Missing files are tolerated; a
    /// present-but-invalid file is a fatal configuration error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let default_path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let mut merged = read_toml_as_json(default_path)?.unwrap_or(Value::Object(Default::default()));
        if let Some(overlay) = read_toml_as_json(Path::new(OVERRIDE_CONFIG_PATH))? {
            merge_json(&mut merged, &overlay);
        }
        Config::from_value(merged)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| GatewayError::Configuration(format!("invalid config: {e}")))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Overlay a JSON fragment (remote server config or per-device private
    /// config) on top of this config.
    pub fn overlaid(&self, overlay: &Value) -> Result<Self> {
        let mut base = self.to_value();
        merge_json(&mut base, overlay);
        Config::from_value(base)
    }

    /// Fatal startup checks: placeholder secrets, auth without tokens.
    pub fn validate(&self) -> Result<()> {
        if !self.manager_api.url.is_empty() {
            if self.manager_api.secret.is_empty() {
                return Err(GatewayError::Configuration(
                    "manager-api.secret is empty".into(),
                ));
            }
            if self.manager_api.secret.contains("你")
                || self.manager_api.secret.contains("your-secret")
            {
                return Err(GatewayError::Configuration(
                    "manager-api.secret still holds the placeholder value".into(),
                ));
            }
        }
        if self.server.auth.enabled
            && self.server.auth.tokens.is_empty()
            && self.server.auth.allowed_devices.is_empty()
        {
            return Err(GatewayError::Configuration(
                "server.auth is enabled but has neither tokens nor allowed_devices".into(),
            ));
        }
        Ok(())
    }

    pub fn selected(&self, module: &str) -> Option<&str> {
        self.selected_module.get(module).map(String::as_str)
    }

    fn module_table(&self, module: &str) -> Option<&HashMap<String, ProviderSettings>> {
        match module {
            "VAD" => Some(&self.vad),
            "ASR" => Some(&self.asr),
            "LLM" => Some(&self.llm),
            "TTS" => Some(&self.tts),
            "Memory" => Some(&self.memory),
            "Intent" => Some(&self.intent),
            "VLLM" => Some(&self.vllm),
            _ => None,
        }
    }

    /// The provider entry chosen by `selected_module` for a module type.
    pub fn selected_provider(&self, module: &str) -> Option<(&str, &ProviderSettings)> {
        let name = self.selected(module)?;
        let settings = self.module_table(module)?.get(name)?;
        Some((name, settings))
    }

    pub fn provider(&self, module: &str, name: &str) -> Option<&ProviderSettings> {
        self.module_table(module)?.get(name)
    }

    /// The type string driving provider instantiation; falls back to the
    /// entry name when `type` is omitted.
    pub fn provider_kind(&self, module: &str) -> Option<String> {
        let (name, settings) = self.selected_provider(module)?;
        if settings.kind.is_empty() {
            Some(name.to_string())
        } else {
            Some(settings.kind.clone())
        }
    }

    pub fn asset_path(&self, file: &str) -> PathBuf {
        self.assets_dir.join(file)
    }

    pub fn advertised_websocket_url(&self) -> String {
        self.server.websocket.clone().unwrap_or_else(|| {
            format!("ws://{}:{}/xiaozhi/v1/", self.server.ip, self.server.port)
        })
    }

    pub fn advertised_vision_url(&self) -> String {
        self.server.vision_explain.clone().unwrap_or_else(|| {
            format!("http://{}:{}/mcp/vision/explain", self.server.ip, self.server.http_port)
        })
    }
}

/// Whether the shared VAD singleton must be rebuilt for a new config: the
/// selected name changed, or its settings changed.
pub fn check_vad_update(current: &Config, new: &Config) -> bool {
    module_changed(current, new, "VAD")
}

pub fn check_asr_update(current: &Config, new: &Config) -> bool {
    module_changed(current, new, "ASR")
}

fn module_changed(current: &Config, new: &Config, module: &str) -> bool {
    if new.selected(module).is_none() {
        return false;
    }
    if current.selected(module) != new.selected(module) {
        return true;
    }
    let current_settings =
        current.selected_provider(module).map(|(_, s)| serde_json::to_value(s).ok());
    let new_settings = new.selected_provider(module).map(|(_, s)| serde_json::to_value(s).ok());
    current_settings != new_settings
}

/// Recursive merge: objects merge key-wise, everything else is replaced.
pub fn merge_json(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

fn read_toml_as_json(path: &Path) -> Result<Option<Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|e| GatewayError::Configuration(format!("read {}: {e}", path.display())))?;
    let value: toml::Value = toml::from_str(&raw)
        .map_err(|e| GatewayError::Configuration(format!("parse {}: {e}", path.display())))?;
    let json = serde_json::to_value(value)
        .map_err(|e| GatewayError::Configuration(format!("convert {}: {e}", path.display())))?;
    Ok(Some(json))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        let raw = r#"
            [server]
            port = 8000

            [selected_module]
            VAD = "energy"
            ASR = "remote_asr"
            LLM = "mainllm"

            [VAD.energy]
            type = "energy"
            threshold = 250.0

            [ASR.remote_asr]
            type = "openai"
            base_url = "http://asr.local/v1"

            [LLM.mainllm]
            type = "openai"
            model_name = "qwen"
            api_key = "k"
        "#;
        let toml_value: toml::Value = toml::from_str(raw).unwrap();
        Config::from_value(serde_json::to_value(toml_value).unwrap()).unwrap()
    }

    #[test]
    fn overlay_wins_recursively() {
        let config = sample();
        let overlay = serde_json::json!({
            "LLM": {"mainllm": {"model_name": "qwen-plus"}},
            "prompt": "新しいペルソナ"
        });
        let merged = config.overlaid(&overlay).unwrap();
        assert_eq!(
            merged.provider("LLM", "mainllm").unwrap().model_name.as_deref(),
            Some("qwen-plus")
        );
        // Untouched keys survive the overlay.
        assert_eq!(merged.provider("LLM", "mainllm").unwrap().api_key.as_deref(), Some("k"));
        assert_eq!(merged.prompt.as_deref(), Some("新しいペルソナ"));
    }

    #[test]
    fn vad_update_detected_on_type_change() {
        let current = sample();
        let mut new = sample();
        assert!(!check_vad_update(&current, &new));
        new.selected_module.insert("VAD".into(), "other".into());
        assert!(check_vad_update(&current, &new));

        let mut same_name = sample();
        same_name.vad.get_mut("energy").unwrap().threshold = Some(400.0);
        assert!(check_vad_update(&current, &same_name));
    }

    #[test]
    fn placeholder_secret_is_fatal() {
        let mut config = sample();
        config.manager_api.url = "http://api.local".into();
        config.manager_api.secret = "你的secret".into();
        assert!(matches!(config.validate(), Err(GatewayError::Configuration(_))));
        config.manager_api.secret = "real-secret".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn provider_kind_falls_back_to_entry_name() {
        let mut config = sample();
        config.vad.get_mut("energy").unwrap().kind = String::new();
        assert_eq!(config.provider_kind("VAD").as_deref(), Some("energy"));
        assert_eq!(config.provider_kind("LLM").as_deref(), Some("openai"));
    }
}
