//! ASR coordination: VAD-gated frame intake, utterance finalization and the
//! entry into a chat turn, plus the idle-farewell, quota and device-bind
//! flows that gate it.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::audio as codec;
use crate::providers::vad::VadState;
use crate::session::{intent, send, ConnectionHandler, ListenMode};
use crate::tts::{AudioItem, SentenceType};

/// Pre-voice rolling buffer depth (frames kept before speech starts).
const PRE_VOICE_FRAMES: usize = 10;
/// Consecutive silent frames (60 ms each) that end an utterance.
const SILENCE_FRAMES_FOR_EOS: u32 = 15;
/// Anything shorter is treated as a spurious trigger and dropped.
const MIN_UTTERANCE_FRAMES: usize = 15;
/// VAD suppression window after a wake-word reply.
const VAD_RESUME_DELAY: Duration = Duration::from_secs(1);

struct IntakeState {
    vad: VadState,
    silent_frames: u32,
}

/// Spawn the per-session intake task draining binary frames.
pub fn spawn_asr_intake(conn: Arc<ConnectionHandler>, mut frames: mpsc::Receiver<Vec<u8>>) {
    tokio::spawn(async move {
        let vad = match VadState::new() {
            Ok(vad) => vad,
            Err(e) => {
                error!("vad state init failed, audio intake disabled: {e}");
                return;
            }
        };
        let mut state = IntakeState { vad, silent_frames: 0 };
        loop {
            tokio::select! {
                _ = conn.cancel.cancelled() => break,
                frame = frames.recv() => {
                    let Some(frame) = frame else { break };
                    handle_audio_frame(&conn, &mut state, frame).await;
                }
            }
        }
        debug!("asr intake stopped");
    });
}

pub async fn clear_asr_buffer(conn: &Arc<ConnectionHandler>) {
    conn.asr_audio.lock().await.clear();
}

async fn handle_audio_frame(conn: &Arc<ConnectionHandler>, state: &mut IntakeState, frame: Vec<u8>) {
    // The empty frame is the manual-stop nudge from the text handler.
    if frame.is_empty() {
        if conn.client_voice_stop.load(Ordering::SeqCst) {
            finalize_utterance(conn, state).await;
        }
        return;
    }

    let mut have_voice = match conn.listen_mode() {
        ListenMode::Auto => match conn.vad.is_vad(&mut state.vad, &frame, conn.audio_format()) {
            Ok(have_voice) => have_voice,
            Err(e) => {
                warn!("vad failed on frame: {e}");
                false
            }
        },
        ListenMode::Manual => conn.client_have_voice.load(Ordering::SeqCst),
    };

    // Right after a wake-word reply the device hears itself; ignore VAD for
    // a beat, then resume.
    if have_voice && conn.is_just_woken_up() {
        have_voice = false;
        clear_asr_buffer(conn).await;
        let conn = conn.clone();
        tokio::spawn(async move {
            tokio::time::sleep(VAD_RESUME_DELAY).await;
            conn.set_just_woken_up(false);
        });
        return;
    }

    if have_voice && conn.is_speaking() {
        conn.abort().await;
    }

    no_voice_close_connect(conn, have_voice).await;

    let mut buffer = conn.asr_audio.lock().await;
    buffer.push(frame);
    if conn.listen_mode() == ListenMode::Auto {
        if have_voice {
            conn.client_have_voice.store(true, Ordering::SeqCst);
            state.silent_frames = 0;
        } else if conn.client_have_voice.load(Ordering::SeqCst) {
            state.silent_frames += 1;
            if state.silent_frames >= SILENCE_FRAMES_FOR_EOS {
                conn.client_voice_stop.store(true, Ordering::SeqCst);
            }
        } else {
            // No speech yet: keep a short pre-voice window only.
            let len = buffer.len();
            if len > PRE_VOICE_FRAMES {
                buffer.drain(..len - PRE_VOICE_FRAMES);
            }
        }
    }
    drop(buffer);

    if conn.client_voice_stop.load(Ordering::SeqCst) {
        finalize_utterance(conn, state).await;
    }
}

async fn finalize_utterance(conn: &Arc<ConnectionHandler>, state: &mut IntakeState) {
    let frames: Vec<Vec<u8>> = std::mem::take(&mut *conn.asr_audio.lock().await);
    reset_vad_states(conn, state);
    if frames.len() <= MIN_UTTERANCE_FRAMES {
        debug!("utterance too short ({} frames), dropped", frames.len());
        return;
    }
    info!("utterance finalized: {} frames", frames.len());
    let text = match conn.asr.transcribe(&frames, conn.audio_format()).await {
        Ok(text) => text,
        Err(e) => {
            error!("transcription failed: {e}");
            return;
        }
    };
    if text.is_empty() {
        debug!("empty transcription, dropped");
        return;
    }
    info!("transcription: {text}");
    crate::session::report::enqueue_asr_report(conn, &text, &frames).await;
    start_to_chat(conn, text).await;
}

fn reset_vad_states(conn: &Arc<ConnectionHandler>, state: &mut IntakeState) {
    conn.client_have_voice.store(false, Ordering::SeqCst);
    conn.client_voice_stop.store(false, Ordering::SeqCst);
    state.vad.reset();
    state.silent_frames = 0;
    debug!("vad state reset");
}

/// Route a finalized utterance into the pipeline.
pub async fn start_to_chat(conn: &Arc<ConnectionHandler>, text: String) {
    if conn.need_bind {
        check_bind_device(conn).await;
        return;
    }

    if conn.max_output_size > 0
        && crate::output_counter::check_device_output_limit(&conn.device_id, conn.max_output_size)
    {
        max_output_reached(conn).await;
        return;
    }

    if conn.is_speaking() {
        conn.abort().await;
    }

    // The intent layer may short-circuit the whole turn.
    if intent::handle_user_intent(conn, &text).await {
        return;
    }

    send::send_stt_message(conn, &text).await;
    let conn = conn.clone();
    tokio::spawn(async move { conn.chat(text, 0).await });
}

/// First-stage idle handling: synthesize a farewell, then close after the
/// turn. The watchdog (second stage) force-closes later.
async fn no_voice_close_connect(conn: &Arc<ConnectionHandler>, have_voice: bool) {
    if have_voice {
        conn.update_activity();
        return;
    }
    let last = conn.last_activity();
    if last == 0 {
        return;
    }
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let idle_ms = now.saturating_sub(last);
    if conn.close_after_chat() || idle_ms <= conn.config.close_connection_no_voice_time * 1000 {
        return;
    }
    if !conn.config.end_prompt.enable {
        info!("idle limit reached, closing without farewell");
        conn.close().await;
        return;
    }
    let prompt = conn.config.end_prompt.prompt.clone().unwrap_or_else(|| {
        "「時間はあっという間に過ぎていくね」という言葉で、名残惜しい気持ちを込めてこの会話を締めくくってください。"
            .to_string()
    });
    info!("idle limit reached, speaking farewell");
    conn.chat_and_close(prompt).await;
}

/// Daily quota exhausted: apologize with the pre-canned WAV and close.
pub(crate) async fn max_output_reached(conn: &Arc<ConnectionHandler>) {
    let text =
        "すみません、今日はもうお話できる時間を使い切ってしまいました。また明日お話しましょう。約束ですよ！";
    send::send_stt_message(conn, text).await;
    let path = conn.config.asset_path("max_output_size.wav");
    match codec::wav_file_to_frames(&path, conn.audio_format()) {
        Ok(frames) => {
            conn.tts
                .audio_queue
                .push(AudioItem {
                    sentence_type: SentenceType::Last,
                    frames,
                    text: Some(text.to_string()),
                })
                .await;
        }
        Err(e) => error!("quota wav unavailable: {e}"),
    }
    conn.set_close_after_chat(true);
}

/// Unbound device: speak the bind code and play its digit prompts. The
/// session stays open, but no LLM turn ever runs.
async fn check_bind_device(conn: &Arc<ConnectionHandler>) {
    let Some(bind_code) = &conn.bind_code else {
        let text = "このデバイスのバージョン情報が見つかりませんでした。OTAアドレスを設定してから、ファームウェアを再コンパイルしてください。";
        send::send_stt_message(conn, text).await;
        if let Ok(frames) =
            codec::wav_file_to_frames(&conn.config.asset_path("bind_not_found.wav"), conn.audio_format())
        {
            conn.tts
                .audio_queue
                .push(AudioItem {
                    sentence_type: SentenceType::Last,
                    frames,
                    text: Some(text.to_string()),
                })
                .await;
        }
        return;
    };
    if bind_code.len() != 6 || !bind_code.chars().all(|c| c.is_ascii_digit()) {
        error!("malformed bind code: {bind_code}");
        send::send_stt_message(conn, "バインドコードの形式が正しくありません。設定を確認してください。")
            .await;
        return;
    }
    let text = format!("コントロールパネルにログインし、{bind_code}を入力してデバイスをバインドしてください。");
    send::send_stt_message(conn, &text).await;

    match codec::wav_file_to_frames(&conn.config.asset_path("bind_code.wav"), conn.audio_format()) {
        Ok(frames) => {
            conn.tts
                .audio_queue
                .push(AudioItem {
                    sentence_type: SentenceType::First,
                    frames,
                    text: Some(text.clone()),
                })
                .await;
        }
        Err(e) => error!("bind prompt wav unavailable: {e}"),
    }
    for digit in bind_code.chars() {
        let path = conn.config.asset_path(&format!("bind_code/{digit}.wav"));
        match codec::wav_file_to_frames(&path, conn.audio_format()) {
            Ok(frames) => {
                conn.tts
                    .audio_queue
                    .push(AudioItem { sentence_type: SentenceType::Middle, frames, text: None })
                    .await;
            }
            Err(e) => {
                error!("digit wav {digit} unavailable: {e}");
                continue;
            }
        }
    }
    conn.tts
        .audio_queue
        .push(AudioItem { sentence_type: SentenceType::Last, frames: Vec::new(), text: None })
        .await;
}
