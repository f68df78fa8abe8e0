//! Inbound text-frame routing: hello, abort, listen, iot, mcp, server.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::audio::AudioFormat;
use crate::session::{audio, send, ConnectionHandler, ListenMode};
use crate::utils::{filter_sensitive_info, remove_punctuation_and_length, truncate_safe};

pub async fn handle_text_message(conn: &Arc<ConnectionHandler>, raw: &str) {
    let Ok(message) = serde_json::from_str::<Value>(raw) else {
        // Non-JSON text frames are echoed back (device-side probes).
        conn.send_text(raw.to_string()).await;
        return;
    };
    if message.is_number() {
        // Bare-integer heartbeat: echo verbatim.
        debug!("heartbeat frame: {raw}");
        conn.send_json(message).await;
        return;
    }
    match message.get("type").and_then(Value::as_str) {
        Some("hello") => handle_hello(conn, &message).await,
        Some("abort") => {
            info!("abort frame received");
            conn.abort().await;
        }
        Some("listen") => handle_listen(conn, &message).await,
        Some("iot") => {
            info!("iot frame: {}", truncate_safe(raw, 120));
            if let Some(descriptors) = message.get("descriptors") {
                conn.tool_handler.iot.handle_descriptors(descriptors);
            }
            if let Some(states) = message.get("states") {
                conn.tool_handler.iot.handle_states(states);
            }
        }
        Some("mcp") => {
            debug!("mcp frame: {}", truncate_safe(raw, 120));
            if let Some(payload) = message.get("payload") {
                conn.tool_handler.mcp.handle_payload(conn, payload).await;
            }
        }
        Some("server") => handle_server(conn, &message).await,
        other => {
            error!("unknown message type {:?}: {}", other, truncate_safe(raw, 120));
        }
    }
}

async fn handle_hello(conn: &Arc<ConnectionHandler>, message: &Value) {
    info!("hello received from {}", conn.device_id);
    let audio_params = message.get("audio_params");
    if let Some(format) = audio_params
        .and_then(|p| p.get("format"))
        .and_then(Value::as_str)
    {
        info!("negotiated audio format: {format}");
        conn.set_audio_format(AudioFormat::parse(format));
    }
    if let Some(features) = message.get("features") {
        info!("client features: {features}");
        *conn.features.lock().unwrap() = Some(features.clone());
        if features.get("mcp").and_then(Value::as_bool).unwrap_or(false) {
            info!("client supports mcp, starting handshake");
            let mcp = conn.tool_handler.mcp.clone();
            let conn = conn.clone();
            tokio::spawn(async move { mcp.start(&conn).await });
        }
    }
    let welcome = conn.welcome_message(audio_params);
    conn.send_json(welcome).await;
}

async fn handle_listen(conn: &Arc<ConnectionHandler>, message: &Value) {
    if let Some(mode) = message.get("mode").and_then(Value::as_str) {
        *conn.listen_mode.lock().unwrap() = ListenMode::parse(mode);
        debug!("listen mode: {mode}");
    }
    match message.get("state").and_then(Value::as_str) {
        Some("start") => {
            conn.client_have_voice.store(true, std::sync::atomic::Ordering::SeqCst);
            conn.client_voice_stop.store(false, std::sync::atomic::Ordering::SeqCst);
        }
        Some("stop") => {
            conn.client_have_voice.store(true, std::sync::atomic::Ordering::SeqCst);
            conn.client_voice_stop.store(true, std::sync::atomic::Ordering::SeqCst);
            // Manual framing: an empty frame nudges the intake loop to
            // finalize the buffered utterance.
            conn.ingest_audio_frame(Vec::new()).await;
        }
        Some("detect") => {
            conn.client_have_voice.store(false, std::sync::atomic::Ordering::SeqCst);
            audio::clear_asr_buffer(conn).await;
            if let Some(original_text) = message.get("text").and_then(Value::as_str) {
                handle_detect_text(conn, original_text).await;
            }
        }
        other => warn!("listen frame with unknown state {other:?}"),
    }
}

/// `listen{state:"detect", text}`: pre-transcribed text, usually the device's
/// on-box wake-word engine.
async fn handle_detect_text(conn: &Arc<ConnectionHandler>, original_text: &str) {
    let (_, filtered_text) = remove_punctuation_and_length(original_text);
    let is_wakeup_word = conn.config.wakeup_words.iter().any(|w| w == &filtered_text);

    if is_wakeup_word && !conn.config.enable_greeting {
        // Wake word with greeting disabled: acknowledge without replying.
        send::send_stt_message(conn, original_text).await;
        send::send_tts_message(conn, "stop", None).await;
        conn.clear_speak_status();
        return;
    }
    if is_wakeup_word {
        conn.set_just_woken_up(true);
        crate::session::report::enqueue_asr_report(conn, "こんにちは", &[]).await;
        audio::start_to_chat(conn, "こんにちは".to_string()).await;
    } else {
        crate::session::report::enqueue_asr_report(conn, original_text, &[]).await;
        audio::start_to_chat(conn, original_text.to_string()).await;
    }
}

async fn handle_server(conn: &Arc<ConnectionHandler>, message: &Value) {
    info!("server frame: {}", filter_sensitive_info(message));
    // Admin actions only exist in remote-config mode.
    if !conn.read_config_from_api {
        return;
    }
    let post_secret = message
        .get("content")
        .and_then(|c| c.get("secret"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if post_secret != conn.config.manager_api.secret {
        conn.send_json(json!({
            "type": "server",
            "status": "error",
            "message": "サーバーキーの検証に失敗しました",
        }))
        .await;
        return;
    }
    match message.get("action").and_then(Value::as_str) {
        Some("update_config") => {
            let Some(server) = conn.server.upgrade() else {
                conn.send_json(json!({
                    "type": "server",
                    "status": "error",
                    "message": "サーバーインスタンスを取得できません",
                    "content": { "action": "update_config" },
                }))
                .await;
                return;
            };
            let (status, msg) = match server.update_config().await {
                Ok(()) => ("success", "設定の更新に成功しました".to_string()),
                Err(e) => {
                    error!("update_config failed: {e}");
                    ("error", "サーバー設定の更新に失敗しました".to_string())
                }
            };
            conn.send_json(json!({
                "type": "server",
                "status": status,
                "message": msg,
                "content": { "action": "update_config" },
            }))
            .await;
        }
        Some("restart") => conn.handle_restart().await,
        other => warn!("server frame with unknown action {other:?}"),
    }
}
