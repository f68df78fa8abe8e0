//! TTS engine: turns streamed text chunks into paced audio.
//!
//! Two queues per session. The text worker segments chunks into speakable
//! sentences and synthesizes them (with retries); the audio worker hands
//! finished sentences to the paced socket writer and runs the side effects
//! (history report, daily quota accounting).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audio;
use crate::error::{GatewayError, Result};
use crate::providers::tts::TtsProvider;
use crate::queue::TaskQueue;
use crate::session::{report, send, ConnectionHandler};
use crate::utils::clean_markdown;

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_SYNTHESIS_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentenceType {
    First,
    Middle,
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    /// Control marker, no payload.
    Action,
    Text,
    File,
}

/// One element of the text queue. A `sentence_id` groups the contiguous run
/// `First Middle* Last` of a single utterance.
#[derive(Debug, Clone)]
pub struct TtsMessage {
    pub sentence_id: String,
    pub sentence_type: SentenceType,
    pub content_type: ContentType,
    pub text: Option<String>,
    pub file: Option<PathBuf>,
}

/// One element of the audio queue: frames ready for the paced writer.
#[derive(Debug, Clone)]
pub struct AudioItem {
    pub sentence_type: SentenceType,
    pub frames: Vec<Vec<u8>>,
    pub text: Option<String>,
}

/// Terminators for the first sentence of an utterance: a wide set including
/// pause punctuation, trading sentence length for time-to-first-audio.
const FIRST_SENTENCE_TERMINATORS: &[char] =
    &['、', ',', '，', '～', '~', '。', '！', '!', '？', '?', '；', ';', '：', ':'];
/// Later sentences wait for a strong terminator.
const TERMINATORS: &[char] = &['。', '！', '!', '？', '?', '；', ';', '：', ':'];

/// Rolling segmentation state, reset only by a FIRST marker.
#[derive(Debug)]
pub struct SegmentBuffer {
    buffer: String,
    processed: usize,
    is_first_sentence: bool,
}

impl SegmentBuffer {
    pub fn new() -> Self {
        Self { buffer: String::new(), processed: 0, is_first_sentence: true }
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.processed = 0;
        self.is_first_sentence = true;
    }

    /// Append a chunk and pull out every completed segment.
    pub fn push_text(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut segments = Vec::new();
        while let Some(segment) = self.next_segment() {
            if !segment.is_empty() {
                segments.push(segment);
            }
        }
        segments
    }

    fn next_segment(&mut self) -> Option<String> {
        let current = &self.buffer[self.processed..];
        let terminators =
            if self.is_first_sentence { FIRST_SENTENCE_TERMINATORS } else { TERMINATORS };
        // The earliest terminator position closes the shortest viable
        // segment, keeping synthesis latency low.
        let mut best: Option<(usize, char)> = None;
        for &p in terminators {
            if let Some(pos) = current.rfind(p) {
                if best.map_or(true, |(b, _)| pos < b) {
                    best = Some((pos, p));
                }
            }
        }
        let (pos, p) = best?;
        let end = pos + p.len_utf8();
        let raw = &current[..end];
        let segment = crate::utils::strip_punctuation_and_emoji(raw);
        self.processed += end;
        self.is_first_sentence = false;
        Some(segment)
    }

    /// Flush residual unprocessed text as a final segment.
    pub fn flush(&mut self) -> Option<String> {
        let remaining = &self.buffer[self.processed..];
        let segment = crate::utils::strip_punctuation_and_emoji(remaining);
        self.processed = self.buffer.len();
        self.is_first_sentence = true;
        if segment.is_empty() {
            None
        } else {
            Some(segment)
        }
    }
}

pub struct TtsEngine {
    provider: Arc<dyn TtsProvider>,
    pub text_queue: TaskQueue<TtsMessage>,
    pub audio_queue: TaskQueue<AudioItem>,
    /// Whether the next audio item opens an utterance (enables pre-buffer).
    pub audio_first_sentence: AtomicBool,
    synthesis_timeout: Duration,
}

impl TtsEngine {
    pub fn new(provider: Arc<dyn TtsProvider>, synthesis_timeout_secs: u64) -> Self {
        Self {
            provider,
            text_queue: TaskQueue::new(),
            audio_queue: TaskQueue::new(),
            audio_first_sentence: AtomicBool::new(true),
            synthesis_timeout: Duration::from_secs(synthesis_timeout_secs),
        }
    }

    pub fn voice(&self) -> &str {
        self.provider.voice()
    }

    pub async fn clear_queues(&self) {
        let texts = self.text_queue.clear().await;
        let audios = self.audio_queue.clear().await;
        debug!("cleared tts queues ({texts} text, {audios} audio items)");
    }

    /// Spawn the per-session workers.
    pub fn open_audio_channels(self: &Arc<Self>, conn: Arc<ConnectionHandler>) {
        let engine = self.clone();
        let text_conn = conn.clone();
        tokio::spawn(async move { engine.text_worker(text_conn).await });
        let engine = self.clone();
        tokio::spawn(async move { engine.audio_worker(conn).await });
    }

    /// Enqueue one complete sentence as its own FIRST..LAST run, reusing the
    /// turn's sentence id when one is active.
    pub async fn tts_one_sentence(
        &self,
        conn: &ConnectionHandler,
        content_type: ContentType,
        text: Option<String>,
        file: Option<PathBuf>,
    ) {
        let sentence_id = conn.current_sentence_id().unwrap_or_else(|| {
            let fresh = Uuid::new_v4().simple().to_string();
            conn.set_sentence_id(Some(fresh.clone()));
            fresh
        });
        self.text_queue
            .push(TtsMessage {
                sentence_id: sentence_id.clone(),
                sentence_type: SentenceType::First,
                content_type: ContentType::Action,
                text: None,
                file: None,
            })
            .await;
        self.text_queue
            .push(TtsMessage {
                sentence_id: sentence_id.clone(),
                sentence_type: SentenceType::Middle,
                content_type,
                text,
                file,
            })
            .await;
        self.text_queue
            .push(TtsMessage {
                sentence_id,
                sentence_type: SentenceType::Last,
                content_type: ContentType::Action,
                text: None,
                file: None,
            })
            .await;
    }

    /// Synthesize one segment with bounded retries. Returns wire frames in
    /// the session's negotiated format.
    pub async fn to_tts(&self, text: &str, format: audio::AudioFormat) -> Result<Vec<Vec<u8>>> {
        let cleaned = clean_markdown(text);
        if cleaned.is_empty() {
            return Ok(Vec::new());
        }
        let mut last_error = GatewayError::Tts("synthesis never attempted".into());
        for attempt in 1..=MAX_SYNTHESIS_ATTEMPTS {
            match tokio::time::timeout(self.synthesis_timeout, self.provider.text_to_speak(&cleaned))
                .await
            {
                Ok(Ok(bytes)) => match audio::wav_bytes_to_frames(&bytes, format) {
                    Ok(frames) => {
                        if attempt > 1 {
                            info!("synthesis succeeded after {attempt} attempts: {cleaned}");
                        }
                        return Ok(frames);
                    }
                    Err(e) => last_error = e,
                },
                Ok(Err(e)) => {
                    warn!("synthesis attempt {attempt} failed for '{cleaned}': {e}");
                    last_error = e;
                }
                Err(_) => {
                    warn!("synthesis attempt {attempt} timed out for '{cleaned}'");
                    last_error = GatewayError::Tts("synthesis timed out".into());
                }
            }
        }
        Err(GatewayError::Tts(format!("gave up on '{cleaned}': {last_error}")))
    }

    /// Text worker: consume TTSMessages, segment, synthesize, enqueue audio.
    async fn text_worker(self: Arc<Self>, conn: Arc<ConnectionHandler>) {
        let mut segments = SegmentBuffer::new();
        // The first audio item after a FIRST marker opens the utterance.
        let mut first_pending = false;
        while !conn.cancel.is_cancelled() {
            let Some(message) = self.text_queue.pop_timeout(POLL_INTERVAL).await else {
                continue;
            };
            if conn.is_aborted() {
                debug!("abort observed, dropping tts text item");
                continue;
            }
            match message.sentence_type {
                SentenceType::First => {
                    segments.reset();
                    first_pending = true;
                    self.audio_first_sentence.store(true, Ordering::SeqCst);
                }
                _ => match message.content_type {
                    ContentType::Text => {
                        if let Some(text) = &message.text {
                            for segment in segments.push_text(text) {
                                self.synthesize_segment(&conn, &mut first_pending, &segment).await;
                            }
                        }
                    }
                    ContentType::File => {
                        self.flush_remaining(&conn, &mut segments, &mut first_pending).await;
                        if let Some(path) = &message.file {
                            match audio::wav_file_to_frames(path, conn.audio_format()) {
                                Ok(frames) => {
                                    let sentence_type = if std::mem::take(&mut first_pending) {
                                        SentenceType::First
                                    } else {
                                        SentenceType::Middle
                                    };
                                    self.audio_queue
                                        .push(AudioItem {
                                            sentence_type,
                                            frames,
                                            text: message.text.clone(),
                                        })
                                        .await
                                }
                                Err(e) => error!("audio file {} unusable: {e}", path.display()),
                            }
                        }
                    }
                    ContentType::Action => {}
                },
            }
            if message.sentence_type == SentenceType::Last {
                self.flush_remaining(&conn, &mut segments, &mut first_pending).await;
                self.audio_queue
                    .push(AudioItem {
                        sentence_type: SentenceType::Last,
                        frames: Vec::new(),
                        text: message.text.clone(),
                    })
                    .await;
            }
        }
        debug!("tts text worker stopped");
    }

    async fn flush_remaining(
        &self,
        conn: &Arc<ConnectionHandler>,
        segments: &mut SegmentBuffer,
        first_pending: &mut bool,
    ) {
        if let Some(segment) = segments.flush() {
            self.synthesize_segment(conn, first_pending, &segment).await;
        }
    }

    async fn synthesize_segment(
        &self,
        conn: &Arc<ConnectionHandler>,
        first_pending: &mut bool,
        segment: &str,
    ) {
        match self.to_tts(segment, conn.audio_format()).await {
            Ok(frames) if frames.is_empty() => {}
            Ok(frames) => {
                let sentence_type = if std::mem::take(first_pending) {
                    SentenceType::First
                } else {
                    SentenceType::Middle
                };
                self.audio_queue
                    .push(AudioItem {
                        sentence_type,
                        frames,
                        text: Some(segment.to_string()),
                    })
                    .await;
            }
            // The sentence is dropped, but the turn (and the dialogue entry
            // written by the chat loop) go on.
            Err(e) => error!("dropping sentence after synthesis failure: {e}"),
        }
    }

    /// Audio worker: hand finished sentences to the paced writer and run the
    /// per-sentence side effects.
    async fn audio_worker(self: Arc<Self>, conn: Arc<ConnectionHandler>) {
        while !conn.cancel.is_cancelled() {
            let Some(item) = self.audio_queue.pop_timeout(POLL_INTERVAL).await else {
                continue;
            };
            if let Err(e) = send::send_audio_message(&conn, &item).await {
                error!("audio send failed: {e}");
                continue;
            }
            if let Some(text) = &item.text {
                if conn.max_output_size > 0 {
                    crate::output_counter::add_device_output(
                        &conn.device_id,
                        text.chars().count() as u64,
                    );
                    // Quota can run out mid-turn; the canned apology plays
                    // and the session closes after it.
                    if crate::output_counter::check_device_output_limit(
                        &conn.device_id,
                        conn.max_output_size,
                    ) && !conn.close_after_chat()
                    {
                        crate::session::audio::max_output_reached(&conn).await;
                    }
                }
                report::enqueue_tts_report(&conn, text, &item.frames).await;
            }
        }
        debug!("tts audio worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strong_terminators_split_in_order() {
        let mut buffer = SegmentBuffer::new();
        buffer.is_first_sentence = false;
        let mut out = buffer.push_text("A。B!C");
        if let Some(tail) = buffer.flush() {
            out.push(tail);
        }
        assert_eq!(out, vec!["A", "B", "C"]);
    }

    #[test]
    fn first_sentence_splits_on_comma() {
        let mut buffer = SegmentBuffer::new();
        let mut out = buffer.push_text("A, B。C");
        if let Some(tail) = buffer.flush() {
            out.push(tail);
        }
        assert_eq!(out, vec!["A", "B", "C"]);
    }

    #[test]
    fn comma_does_not_split_after_first_sentence() {
        let mut buffer = SegmentBuffer::new();
        assert_eq!(buffer.push_text("はい、"), vec!["はい"]);
        // Second sentence: the comma no longer terminates.
        assert!(buffer.push_text("それでは、続きを").is_empty());
        assert_eq!(buffer.push_text("話します。"), vec!["それでは、続きを話します"]);
    }

    #[test]
    fn streaming_chunks_accumulate() {
        let mut buffer = SegmentBuffer::new();
        assert!(buffer.push_text("今日はいい").is_empty());
        assert_eq!(buffer.push_text("天気ですね。"), vec!["今日はいい天気ですね"]);
        assert!(buffer.flush().is_none());
    }

    #[test]
    fn reset_restores_first_sentence_mode() {
        let mut buffer = SegmentBuffer::new();
        buffer.push_text("一つ目。");
        buffer.reset();
        // After reset the wide terminator set applies again.
        assert_eq!(buffer.push_text("短く、"), vec!["短く"]);
    }
}
