//! Wake-word handling with a persisted per-voice response cache.
//!
//! A cached WAV is played immediately so the device answers without a full
//! LLM+TTS roundtrip; a single-flight background task regenerates the
//! response when the cache entry has gone stale.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use once_cell::sync::Lazy;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::audio::{self, AudioFormat};
use crate::dialogue::Message;
use crate::session::{send, ConnectionHandler};
use crate::tts::{AudioItem, SentenceType};

const CACHE_FILE: &str = "data/wakeup_cache.json";
/// Entries older than this are refreshed after being played.
const REFRESH_AFTER_SECS: i64 = 5;

const WAKEUP_VARIANTS: &[&str] = &["こんにちは", "やあ", "ねえ、こんにちは", "ハイ"];

const DEFAULT_RESPONSE_TEXT: &str =
    "こんにちは、私はシャオジーです。あなたの声が聞けてうれしいです。最近何をしていますか？";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakeupResponse {
    pub file_path: PathBuf,
    pub text: String,
    /// Unix seconds of the last regeneration.
    pub time: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WakeupCache {
    responses: HashMap<String, WakeupResponse>,
}

static CACHE: Lazy<StdMutex<WakeupCache>> = Lazy::new(|| StdMutex::new(load_cache()));

/// Single-flight guard for the background regeneration.
static REFRESH_LOCK: Lazy<tokio::sync::Mutex<()>> = Lazy::new(|| tokio::sync::Mutex::new(()));

fn load_cache() -> WakeupCache {
    match std::fs::read_to_string(CACHE_FILE) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => WakeupCache::default(),
    }
}

fn persist_cache(cache: &WakeupCache) {
    if let Some(parent) = PathBuf::from(CACHE_FILE).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Ok(raw) = serde_json::to_string(cache) {
        let tmp = format!("{CACHE_FILE}.tmp");
        if std::fs::write(&tmp, raw).and_then(|_| std::fs::rename(&tmp, CACHE_FILE)).is_err() {
            warn!("failed to persist wakeup cache");
        }
    }
}

fn get_response(voice: &str) -> Option<WakeupResponse> {
    CACHE.lock().unwrap().responses.get(voice).cloned()
}

fn update_response(voice: &str, file_path: PathBuf, text: String) {
    let mut cache = CACHE.lock().unwrap();
    cache.responses.insert(
        voice.to_string(),
        WakeupResponse { file_path, text, time: chrono::Utc::now().timestamp() },
    );
    persist_cache(&cache);
}

/// Wake-word fast path. Returns true when the utterance was handled.
pub async fn check_wakeup_words(conn: &Arc<ConnectionHandler>, filtered_text: &str) -> bool {
    if !conn.config.enable_wakeup_words_response_cache {
        return false;
    }
    if !conn.config.wakeup_words.iter().any(|w| w == filtered_text) {
        return false;
    }

    conn.set_just_woken_up(true);
    send::send_stt_message(conn, filtered_text).await;

    let voice = conn.tts.voice().to_string();
    let response = get_response(&voice).unwrap_or_else(|| WakeupResponse {
        file_path: conn.config.asset_path("wakeup_words.wav"),
        text: DEFAULT_RESPONSE_TEXT.to_string(),
        time: 0,
    });

    conn.set_abort(false);
    match audio::wav_file_to_frames(&response.file_path, conn.audio_format()) {
        Ok(frames) => {
            info!("playing cached wakeup response: {}", response.text);
            conn.tts.audio_first_sentence.store(true, std::sync::atomic::Ordering::SeqCst);
            let _ = send::send_audio_message(
                conn,
                &AudioItem {
                    sentence_type: SentenceType::First,
                    frames,
                    text: Some(response.text.clone()),
                },
            )
            .await;
            let _ = send::send_audio_message(
                conn,
                &AudioItem { sentence_type: SentenceType::Last, frames: Vec::new(), text: None },
            )
            .await;
            conn.dialogue.lock().await.put(Message::assistant(&response.text));
        }
        Err(e) => warn!("wakeup response wav unusable ({e}), regenerating"),
    }

    if chrono::Utc::now().timestamp() - response.time > REFRESH_AFTER_SECS {
        spawn_refresh(conn.clone(), voice);
    }
    true
}

/// Regenerate the cached response through the LLM + TTS, at most one flight
/// at a time across the process.
fn spawn_refresh(conn: Arc<ConnectionHandler>, voice: String) {
    tokio::spawn(async move {
        let Ok(_guard) = REFRESH_LOCK.try_lock() else {
            return;
        };
        let index = rand::rng().random_range(0..WAKEUP_VARIANTS.len());
        let wakeup_word = WAKEUP_VARIANTS[index];
        let question = format!(
            "ユーザーがいま「{wakeup_word}」と話しかけています。20〜30語で応答してください。\
             設定された役柄の口調を守り、ロボットのように話さないでください。\
             絵文字は使わず、応答の文章だけを返してください。"
        );
        let system_prompt = conn.config.prompt.clone().unwrap_or_default();
        let result = match conn.llm.response_no_stream(&system_prompt, &question).await {
            Ok(result) if !result.is_empty() => result,
            Ok(_) => return,
            Err(e) => {
                warn!("wakeup response generation failed: {e}");
                return;
            }
        };
        // Synthesize in Opus regardless of the session format: the cache
        // stores a normalized 16 kHz WAV.
        let frames = match conn.tts.to_tts(&result, AudioFormat::Opus).await {
            Ok(frames) if !frames.is_empty() => frames,
            _ => return,
        };
        let wav = match audio::opus_frames_to_wav_bytes(&frames) {
            Ok(wav) => wav,
            Err(e) => {
                error!("wakeup wav assembly failed: {e}");
                return;
            }
        };
        let dir = conn.config.asset_path("wakeup_words");
        if let Err(e) = std::fs::create_dir_all(&dir) {
            error!("wakeup cache dir: {e}");
            return;
        }
        let file_path = dir.join(format!("{}.wav", voice.replace(['/', '\\'], "_")));
        if let Err(e) = std::fs::write(&file_path, wav) {
            error!("wakeup cache write: {e}");
            return;
        }
        update_response(&voice, file_path, result);
        info!("wakeup response refreshed for voice {voice}");
    });
}
