//! HTTP side channel on its own port: the OTA firmware-pointer endpoint and
//! the vision-explanation endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Multipart, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::auth::{mint_vision_token, validate_vision_token};
use crate::error::{GatewayError, Result};
use crate::providers;
use crate::server::WebSocketServer;

const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

pub async fn run(server: Arc<WebSocketServer>, cancel: CancellationToken) -> Result<()> {
    let config = server.current_config().await;
    let addr: SocketAddr = format!("{}:{}", config.server.ip, config.server.http_port)
        .parse()
        .map_err(|e| GatewayError::Configuration(format!("bad http address: {e}")))?;

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    let app = Router::new()
        .route("/xiaozhi/ota/", get(ota_get).post(ota_post))
        .route("/mcp/vision/explain", get(vision_get).post(vision_post))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(server);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::Configuration(format!("bind {addr}: {e}")))?;
    info!("http side channel listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| GatewayError::ProviderFatal(format!("http server: {e}")))?;
    Ok(())
}

async fn ota_get(State(server): State<Arc<WebSocketServer>>) -> Response {
    let config = server.current_config().await;
    format!(
        "OTA interface is running, websocket address: {}",
        config.advertised_websocket_url()
    )
    .into_response()
}

/// Firmware metadata plus the device-reachable socket URL. A device-id is
/// required; the response also carries a fresh vision JWT when minting is
/// configured.
async fn ota_post(
    State(server): State<Arc<WebSocketServer>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let config = server.current_config().await;
    let Some(device_id) = headers.get("device-id").and_then(|v| v.to_str().ok()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "message": "device-id header is required" })),
        )
            .into_response();
    };
    let report: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
    let current_version = report
        .get("application")
        .and_then(|a| a.get("version"))
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    info!("ota check from {device_id}, firmware {current_version}");

    let mut response = json!({
        "server_time": {
            "timestamp": Utc::now().timestamp_millis(),
            "timezone_offset": chrono::Local::now().offset().local_minus_utc() / 60,
        },
        "firmware": {
            // The gateway does not host images; devices keep what they run.
            "version": current_version,
            "url": "",
        },
        "websocket": {
            "url": config.advertised_websocket_url(),
        },
    });
    if let Some(auth_key) = &config.server.auth_key {
        match mint_vision_token(auth_key, device_id) {
            Ok(token) => {
                response["vision"] = json!({
                    "url": config.advertised_vision_url(),
                    "token": token,
                });
            }
            Err(e) => warn!("vision token minting failed: {e}"),
        }
    }
    Json(response).into_response()
}

fn vision_error(message: &str) -> Response {
    Json(json!({ "success": false, "message": message })).into_response()
}

async fn vision_get() -> Response {
    "MCP Vision interface is running".into_response()
}

/// Multipart `{question, image}` explained by the vision model. The bearer
/// JWT's device-id claim must match the `Device-Id` header.
async fn vision_post(
    State(server): State<Arc<WebSocketServer>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let config = server.current_config().await;
    let Some(auth_key) = &config.server.auth_key else {
        return vision_error("vision endpoint is not configured");
    };
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();
    let claims = match validate_vision_token(auth_key, token) {
        Ok(claims) => claims,
        Err(e) => {
            warn!("vision auth failed: {e}");
            return (StatusCode::UNAUTHORIZED, vision_error("invalid token")).into_response();
        }
    };
    let device_id = headers
        .get("device-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if device_id.is_empty() || device_id != claims.device_id {
        return (StatusCode::UNAUTHORIZED, vision_error("device-id mismatch")).into_response();
    }

    let mut question = String::new();
    let mut image: Vec<u8> = Vec::new();
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                let name = field.name().map(str::to_string);
                match name.as_deref() {
                    Some("question") => question = field.text().await.unwrap_or_default(),
                    Some("image") => match field.bytes().await {
                        Ok(bytes) => image = bytes.to_vec(),
                        Err(e) => return vision_error(&format!("image read failed: {e}")),
                    },
                    _ => {}
                }
            }
            Ok(None) => break,
            Err(e) => return vision_error(&format!("bad multipart body: {e}")),
        }
    }
    if question.is_empty() {
        return vision_error("question field is required");
    }
    if image.is_empty() {
        return vision_error("image field is required");
    }
    if image.len() > MAX_IMAGE_BYTES {
        return vision_error("image exceeds the 5 MiB limit");
    }
    let Some(media_type) = sniff_image_type(&image) else {
        return vision_error("unsupported image format");
    };

    let vllm = match providers::create_vllm(&config) {
        Ok(vllm) => vllm,
        Err(e) => {
            error!("vllm init failed: {e}");
            return vision_error("vision model is not configured");
        }
    };
    use base64::Engine as _;
    let image_b64 = base64::engine::general_purpose::STANDARD.encode(&image);
    match vllm.explain(&question, &image_b64, media_type).await {
        Ok(answer) => {
            Json(json!({ "success": true, "action": "RESPONSE", "response": answer }))
                .into_response()
        }
        Err(e) => {
            error!("vision explain failed: {e}");
            vision_error("vision analysis failed")
        }
    }
}

/// Magic-byte sniffing for the accepted image containers.
fn sniff_image_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.len() < 12 {
        return None;
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        Some("image/png")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if bytes.starts_with(b"BM") {
        Some("image/bmp")
    } else if bytes.starts_with(&[0x49, 0x49, 0x2A, 0x00]) || bytes.starts_with(&[0x4D, 0x4D, 0x00, 0x2A])
    {
        Some("image/tiff")
    } else if bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_known_formats() {
        let mut png = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        png.extend_from_slice(&[0; 8]);
        assert_eq!(sniff_image_type(&png), Some("image/png"));

        let mut webp = b"RIFF".to_vec();
        webp.extend_from_slice(&[0; 4]);
        webp.extend_from_slice(b"WEBP");
        assert_eq!(sniff_image_type(&webp), Some("image/webp"));

        let mut jpeg = vec![0xFF, 0xD8, 0xFF, 0xE0];
        jpeg.extend_from_slice(&[0; 12]);
        assert_eq!(sniff_image_type(&jpeg), Some("image/jpeg"));

        assert_eq!(sniff_image_type(b"plain text here"), None);
        assert_eq!(sniff_image_type(b"short"), None);
    }
}
