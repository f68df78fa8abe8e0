//! Xiaozhi Gateway - voice interaction server for edge speakers

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use xiaozhi_gateway::config::Config;
use xiaozhi_gateway::server::{self, WebSocketServer};
use xiaozhi_gateway::{http_api, manage_api, tools};

#[derive(Parser)]
#[command(name = "xiaozhi-gateway", version, about)]
struct Args {
    /// Path to the base config file (default: config.toml)
    #[arg(long, env = "XIAOZHI_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let local_config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = local_config.validate() {
        error!("{e}");
        std::process::exit(1);
    }

    // Remote-config mode replaces the local provider tables wholesale.
    let effective = if local_config.manager_api.url.is_empty() {
        local_config.clone()
    } else {
        let api = manage_api::ManageApiClient::new(&local_config.manager_api)?;
        let remote = api.get_server_config().await?;
        server::effective_from_remote(&local_config, remote)?
    };

    tools::builtin::register_builtin_tools()?;

    let ws_server = WebSocketServer::new(local_config, effective)?;
    let config = ws_server.current_config().await;

    println!("OTA URL:       http://{}:{}/xiaozhi/ota/", config.server.ip, config.server.http_port);
    println!("Vision URL:    {}", config.advertised_vision_url());
    println!("WebSocket URL: {}", config.advertised_websocket_url());

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let http = tokio::spawn(http_api::run(ws_server.clone(), cancel.clone()));
    let result = ws_server.run(cancel.clone()).await;
    cancel.cancel();
    let _ = http.await;

    match result {
        Ok(()) => {
            info!("shutdown complete");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
