//! WebSocket server front-end: the accept loop, the shared-module cache and
//! the lock-guarded config hot-reload.
//!
//! In-flight sessions keep the provider bundle they were built with; only
//! sessions accepted after `update_config` see the new one.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::auth::AuthGuard;
use crate::config::{check_asr_update, check_vad_update, Config};
use crate::error::{GatewayError, Result};
use crate::manage_api::ManageApiClient;
use crate::providers::{self, SharedModules};
use crate::session::{self, SessionContext};

const MISSING_DEVICE_ID_HINT: &str =
    "ポートは正常です。接続をテストする場合は device-id を付けて接続してください。";

pub struct WebSocketServer {
    /// The file-loaded local config; `server` and `manager-api` sections
    /// always win over remote payloads.
    local_config: Config,
    config: RwLock<Arc<Config>>,
    modules: RwLock<SharedModules>,
    auth: RwLock<Arc<AuthGuard>>,
    pub manage_api: Option<ManageApiClient>,
}

impl WebSocketServer {
    pub fn new(local_config: Config, effective: Config) -> Result<Arc<Self>> {
        let manage_api = if effective.manager_api.url.is_empty() {
            None
        } else {
            Some(ManageApiClient::new(&effective.manager_api)?)
        };
        let modules = providers::initialize_modules(&effective)?;
        let auth = Arc::new(AuthGuard::new(&effective.server.auth));
        Ok(Arc::new(Self {
            local_config,
            config: RwLock::new(Arc::new(effective)),
            modules: RwLock::new(modules),
            auth: RwLock::new(auth),
            manage_api,
        }))
    }

    pub async fn current_config(&self) -> Arc<Config> {
        self.config.read().await.clone()
    }

    async fn snapshot(&self) -> (Arc<Config>, SharedModules, Arc<AuthGuard>) {
        // Session construction reads under the same locks the reload writes,
        // so a session never sees a half-swapped bundle.
        let config = self.config.read().await.clone();
        let modules = self.modules.read().await.clone();
        let auth = self.auth.read().await.clone();
        (config, modules, auth)
    }

    /// Re-fetch the remote config, rebuild only the changed shared
    /// singletons, and swap atomically.
    pub async fn update_config(&self) -> Result<()> {
        let Some(api) = &self.manage_api else {
            return Err(GatewayError::Configuration(
                "update_config requires manager-api".into(),
            ));
        };
        let mut config_guard = self.config.write().await;

        let remote = api.get_server_config().await?;
        let new_config = effective_from_remote(&self.local_config, remote)?;
        let current = config_guard.clone();

        let update_vad = check_vad_update(&current, &new_config);
        let update_asr = check_asr_update(&current, &new_config);
        info!("config reload: rebuild vad={update_vad} asr={update_asr}");

        let old_modules = self.modules.read().await.clone();
        let modules = SharedModules {
            vad: if update_vad { providers::create_vad(&new_config)? } else { old_modules.vad },
            asr: if update_asr { providers::create_asr(&new_config)? } else { old_modules.asr },
            llm: providers::create_llm(&new_config)?,
        };

        *self.modules.write().await = modules;
        *self.auth.write().await = Arc::new(AuthGuard::new(&new_config.server.auth));
        *config_guard = Arc::new(new_config);
        info!("config reload complete");
        Ok(())
    }

    /// Bind and serve the device socket until the token fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let config = self.current_config().await;
        let addr: SocketAddr = format!("{}:{}", config.server.ip, config.server.port)
            .parse()
            .map_err(|e| GatewayError::Configuration(format!("bad server address: {e}")))?;

        let app = Router::new()
            .route("/xiaozhi/v1/", get(ws_handler))
            .fallback(|| async { "Server is running\n" })
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone());

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::Configuration(format!("bind {addr}: {e}")))?;
        info!("device socket listening on ws://{addr}/xiaozhi/v1/");

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .map_err(|e| GatewayError::ProviderFatal(format!("server: {e}")))?;
        Ok(())
    }
}

/// Build the effective config from a remote payload, keeping the local
/// `server` and `manager-api` sections authoritative.
pub fn effective_from_remote(local: &Config, remote: serde_json::Value) -> Result<Config> {
    let mut config = Config::from_value(remote)?;
    config.server = local.server.clone();
    config.manager_api = local.manager_api.clone();
    config.read_config_from_api = true;
    Ok(config)
}

fn header_or_query<'a>(
    headers: &'a HeaderMap,
    params: &'a HashMap<String, String>,
    name: &str,
) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| params.get(name).cloned())
}

async fn ws_handler(
    State(server): State<Arc<WebSocketServer>>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    // `device-id` may come as a header or a query parameter.
    let Some(device_id) = header_or_query(&headers, &params, "device-id") else {
        return (StatusCode::OK, MISSING_DEVICE_ID_HINT).into_response();
    };
    let client_id =
        header_or_query(&headers, &params, "client-id").unwrap_or_else(|| device_id.clone());

    let (config, modules, auth) = server.snapshot().await;
    let authorization = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if let Err(e) = auth.authenticate(&device_id, authorization.as_deref()) {
        // Details are logged inside the guard; the client only sees the
        // refused upgrade.
        error!("rejecting {addr}: {e}");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let ctx = SessionContext {
        config,
        modules,
        server: Arc::downgrade(&server),
        manage_api: server.manage_api.clone(),
    };
    ws.on_upgrade(move |socket| {
        session::handle_socket(socket, ctx, device_id, client_id, addr.ip().to_string())
    })
}
