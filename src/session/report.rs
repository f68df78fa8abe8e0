//! Chat-history reporting: a per-session background worker ships user and
//! assistant utterances (optionally with audio re-encoded to WAV) to the
//! management API. Failures are logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::audio;
use crate::session::ConnectionHandler;

pub const KIND_USER: u8 = 1;
pub const KIND_ASSISTANT: u8 = 2;

#[derive(Debug, Clone)]
pub struct ReportItem {
    pub kind: u8,
    pub text: String,
    /// Opus frames; empty and absent mean the same thing (no audio).
    pub audio: Option<Vec<Vec<u8>>>,
    pub timestamp: i64,
}

fn reporting_enabled(conn: &ConnectionHandler) -> bool {
    conn.read_config_from_api && !conn.need_bind && conn.chat_history_conf != 0
}

/// Attach audio only when `chat_history_conf == 2`.
fn audio_for_report(conn: &ConnectionHandler, frames: &[Vec<u8>]) -> Option<Vec<Vec<u8>>> {
    if conn.chat_history_conf == 2 && !frames.is_empty() {
        Some(frames.to_vec())
    } else {
        None
    }
}

pub async fn enqueue_asr_report(conn: &Arc<ConnectionHandler>, text: &str, frames: &[Vec<u8>]) {
    if !reporting_enabled(conn) || text.is_empty() {
        return;
    }
    conn.report_queue
        .push(ReportItem {
            kind: KIND_USER,
            text: text.to_string(),
            audio: audio_for_report(conn, frames),
            timestamp: Utc::now().timestamp(),
        })
        .await;
}

pub async fn enqueue_tts_report(conn: &Arc<ConnectionHandler>, text: &str, frames: &[Vec<u8>]) {
    if !reporting_enabled(conn) || text.is_empty() {
        return;
    }
    conn.report_queue
        .push(ReportItem {
            kind: KIND_ASSISTANT,
            text: text.to_string(),
            audio: audio_for_report(conn, frames),
            timestamp: Utc::now().timestamp(),
        })
        .await;
}

/// Spawn the report worker; a no-op when reporting is gated off.
pub fn spawn_report_worker(conn: Arc<ConnectionHandler>) {
    if !reporting_enabled(&conn) {
        return;
    }
    let Some(api) = conn.manage_api.clone() else { return };
    tokio::spawn(async move {
        debug!("report worker started for {}", conn.device_id);
        while !conn.cancel.is_cancelled() {
            let Some(item) = conn.report_queue.pop_timeout(Duration::from_secs(1)).await else {
                continue;
            };
            let wav = match &item.audio {
                Some(frames) if !frames.is_empty() => match audio::opus_frames_to_wav_bytes(frames)
                {
                    Ok(wav) => Some(wav),
                    Err(e) => {
                        warn!("report audio re-encode failed: {e}");
                        None
                    }
                },
                _ => None,
            };
            if let Err(e) = api
                .report_chat(
                    &conn.device_id,
                    &conn.session_id,
                    item.kind,
                    &item.text,
                    wav.as_deref(),
                    item.timestamp,
                )
                .await
            {
                warn!("chat history report failed: {e}");
            }
        }
        debug!("report worker stopped");
    });
}
