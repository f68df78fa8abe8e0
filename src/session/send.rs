//! Outbound control frames and the paced audio writer.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::audio::{self, FRAME_DURATION_MS};
use crate::error::Result;
use crate::session::ConnectionHandler;
use crate::tts::{AudioItem, SentenceType};
use crate::utils::{analyze_emotion, emotion_emoji, strip_punctuation_and_emoji};

/// Frames sent immediately at the start of an utterance before pacing kicks
/// in ("fast start").
const PRE_BUFFER_FRAMES: usize = 3;

/// Deliver one finished sentence: emotion frame, sentence markers, paced
/// audio, and the end-of-utterance bookkeeping.
pub async fn send_audio_message(conn: &Arc<ConnectionHandler>, item: &AudioItem) -> Result<()> {
    debug!("sending audio item: {:?} '{}'", item.sentence_type, item.text.as_deref().unwrap_or(""));

    if let Some(text) = &item.text {
        let emotion = analyze_emotion(text);
        conn.send_json(json!({
            "type": "llm",
            "text": emotion_emoji(emotion),
            "emotion": emotion,
            "session_id": conn.session_id,
        }))
        .await;
    }

    let pre_buffer = if conn.tts.audio_first_sentence.load(Ordering::SeqCst) && item.text.is_some()
    {
        info!("first audio segment of utterance: {}", item.text.as_deref().unwrap_or(""));
        conn.tts.audio_first_sentence.store(false, Ordering::SeqCst);
        true
    } else {
        false
    };

    send_tts_message(conn, "sentence_start", item.text.as_deref()).await;
    send_audio(conn, &item.frames, pre_buffer).await;
    send_tts_message(conn, "sentence_end", item.text.as_deref()).await;

    if item.sentence_type == SentenceType::Last && conn.llm_finished() {
        send_tts_message(conn, "stop", None).await;
        conn.clear_speak_status();
        if conn.close_after_chat() {
            conn.close().await;
        }
    }
    Ok(())
}

/// Paced frame delivery: each frame is scheduled at
/// `start + index * frame_duration`; the pre-buffer goes out immediately.
pub async fn send_audio(conn: &Arc<ConnectionHandler>, frames: &[Vec<u8>], pre_buffer: bool) {
    if frames.is_empty() {
        return;
    }
    let pre_buffer_frames = if pre_buffer { PRE_BUFFER_FRAMES.min(frames.len()) } else { 0 };
    for frame in &frames[..pre_buffer_frames] {
        conn.send_frame(frame.clone()).await;
    }

    let start = Instant::now();
    let mut play_position_ms: u64 = 0;
    for frame in &frames[pre_buffer_frames..] {
        if conn.is_aborted() || conn.cancel.is_cancelled() {
            break;
        }
        // The device is hearing us; this counts as session activity.
        conn.update_activity();

        let expected = start + Duration::from_millis(play_position_ms);
        let now = Instant::now();
        if expected > now {
            tokio::time::sleep(expected - now).await;
        }
        conn.send_frame(frame.clone()).await;
        play_position_ms += FRAME_DURATION_MS;
    }
}

/// `{type:"tts"}` control frame; `stop` also plays the optional chime and
/// clears the speaking flag.
pub async fn send_tts_message(conn: &Arc<ConnectionHandler>, state: &str, text: Option<&str>) {
    let mut message = json!({
        "type": "tts",
        "state": state,
        "session_id": conn.session_id,
    });
    if let Some(text) = text {
        message["text"] = json!(text);
    }

    if state == "stop" {
        if conn.config.enable_stop_tts_notify {
            if let Some(notify) = &conn.config.stop_tts_notify_voice {
                if let Ok(frames) =
                    audio::wav_file_to_frames(std::path::Path::new(notify), conn.audio_format())
                {
                    send_audio(conn, &frames, true).await;
                }
            }
        }
        conn.clear_speak_status();
    }

    conn.send_json(message).await;
}

/// `{type:"stt"}` echo of the recognized text, marking the turn as speaking.
pub async fn send_stt_message(conn: &Arc<ConnectionHandler>, text: &str) {
    if let Some(end_prompt) = &conn.config.end_prompt.prompt {
        if end_prompt == text {
            // The farewell prompt is internal; open the TTS stream silently.
            send_tts_message(conn, "start", None).await;
            return;
        }
    }
    let stt_text = strip_punctuation_and_emoji(text);
    conn.send_json(json!({
        "type": "stt",
        "text": stt_text,
        "session_id": conn.session_id,
    }))
    .await;
    conn.set_speaking(true);
    send_tts_message(conn, "start", None).await;
}
