//! Management API client.
//!
//! Bearer-secret HTTP client with fixed-delay retries on transient faults.
//! Business error codes 10041/10042 map onto the device-not-found and
//! device-bind flows; everything else surfaces as a provider error.

use std::collections::HashMap;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::ManagerApiConfig;
use crate::error::{GatewayError, Result};

const CODE_DEVICE_NOT_FOUND: i64 = 10041;
const CODE_DEVICE_BIND: i64 = 10042;

#[derive(Clone)]
pub struct ManageApiClient {
    client: reqwest::Client,
    base_url: String,
    max_retries: u32,
    retry_delay: Duration,
}

impl ManageApiClient {
    pub fn new(config: &ManagerApiConfig) -> Result<Self> {
        if config.url.is_empty() || config.secret.is_empty() {
            return Err(GatewayError::Configuration(
                "manager-api needs both url and secret".into(),
            ));
        }
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::AUTHORIZATION,
            format!("Bearer {}", config.secret)
                .parse()
                .map_err(|_| GatewayError::Configuration("manager-api.secret is not a valid header value".into()))?,
        );
        headers.insert(reqwest::header::ACCEPT, "application/json".parse().unwrap());
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout))
            .user_agent(format!("xiaozhi-gateway/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GatewayError::Configuration(format!("build http client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            retry_delay: Duration::from_secs(config.retry_delay),
        })
    }

    async fn request_once(&self, method: reqwest::Method, endpoint: &str, body: Option<&Value>) -> Result<Value> {
        let url = format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'));
        let mut req = self.client.request(method, &url);
        if let Some(body) = body {
            req = req.json(body);
        }
        let response = req
            .send()
            .await
            .map_err(|e| GatewayError::ProviderTransient(format!("{url}: {e}")))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::ProviderTransient(format!("{url}: read body: {e}")))?;
        if !status.is_success() {
            return Err(GatewayError::from_status(status, text));
        }
        let result: Value = serde_json::from_str(&text)
            .map_err(|e| GatewayError::ProviderFatal(format!("{url}: bad json: {e}")))?;
        match result.get("code").and_then(Value::as_i64) {
            Some(0) => Ok(result.get("data").cloned().unwrap_or(Value::Null)),
            Some(CODE_DEVICE_NOT_FOUND) => Err(GatewayError::DeviceNotFound(
                result.get("msg").and_then(Value::as_str).unwrap_or_default().to_string(),
            )),
            Some(CODE_DEVICE_BIND) => Err(GatewayError::DeviceBind {
                bind_code: result.get("msg").and_then(Value::as_str).unwrap_or_default().to_string(),
            }),
            other => Err(GatewayError::ProviderFatal(format!(
                "api error code {:?}: {}",
                other,
                result.get("msg").and_then(Value::as_str).unwrap_or("unknown")
            ))),
        }
    }

    /// Retry on transient faults only; business errors pass straight through.
    async fn execute(&self, method: reqwest::Method, endpoint: &str, body: Option<Value>) -> Result<Value> {
        let mut attempt = 0u32;
        loop {
            match self.request_once(method.clone(), endpoint, body.as_ref()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        "{} {} failed ({e}), retry {attempt}/{} in {:?}",
                        method, endpoint, self.max_retries, self.retry_delay
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Full server config, tagged so sessions know reporting is live.
    pub async fn get_server_config(&self) -> Result<Value> {
        let mut data = self.execute(reqwest::Method::POST, "/config/server-base", None).await?;
        if let Value::Object(map) = &mut data {
            map.insert("read_config_from_api".to_string(), Value::Bool(true));
        }
        Ok(data)
    }

    /// Per-device private config overlay.
    pub async fn get_agent_models(
        &self,
        device_id: &str,
        client_id: &str,
        selected_module: &HashMap<String, String>,
    ) -> Result<Value> {
        self.execute(
            reqwest::Method::POST,
            "/config/agent-models",
            Some(json!({
                "macAddress": device_id,
                "clientId": client_id,
                "selectedModule": selected_module,
            })),
        )
        .await
    }

    /// Persist a summary memory for a device. Failures are logged, not fatal.
    pub async fn save_mem_local_short(&self, device_id: &str, summary: &str) -> Result<()> {
        self.execute(
            reqwest::Method::PUT,
            &format!("/agent/saveMemory/{device_id}"),
            Some(json!({ "summaryMemory": summary })),
        )
        .await
        .map(|_| ())
    }

    /// Ship one chat-history item. `audio_wav` is complete WAV bytes;
    /// empty and absent are treated identically.
    pub async fn report_chat(
        &self,
        device_id: &str,
        session_id: &str,
        chat_type: u8,
        content: &str,
        audio_wav: Option<&[u8]>,
        report_time: i64,
    ) -> Result<()> {
        if content.is_empty() {
            return Ok(());
        }
        let audio_b64 = audio_wav.filter(|a| !a.is_empty()).map(|a| BASE64.encode(a));
        debug!(
            "report chat_type={chat_type} device={device_id} audio={}",
            audio_b64.as_ref().map(|a| a.len()).unwrap_or(0)
        );
        self.execute(
            reqwest::Method::POST,
            "/agent/chat-history/report",
            Some(json!({
                "macAddress": device_id,
                "sessionId": session_id,
                "chatType": chat_type,
                "content": content,
                "reportTime": report_time,
                "audioBase64": audio_b64,
            })),
        )
        .await
        .map(|_| ())
    }
}
