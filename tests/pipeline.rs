//! Integration tests across the pipeline pieces:
//! - sentence segmentation laws
//! - dialogue well-formedness through a tool roundtrip
//! - queue drain semantics backing barge-in
//! - audio codec boundary laws
//! - config overlay and reload diffing

use std::time::Duration;

use xiaozhi_gateway::audio::{
    decode_frames_to_pcm, encode_pcm_to_frames, wav_header, FRAME_SAMPLES,
};
use xiaozhi_gateway::config::{check_asr_update, check_vad_update, Config};
use xiaozhi_gateway::dialogue::{Dialogue, Message, Role, ToolCall};
use xiaozhi_gateway::queue::TaskQueue;
use xiaozhi_gateway::tts::SegmentBuffer;
use xiaozhi_gateway::utils::extract_json_from_string;

// =====================================================================
// SEGMENTATION
// =====================================================================

fn segment_all(input: &str, first_sentence: bool) -> Vec<String> {
    let mut buffer = SegmentBuffer::new();
    if !first_sentence {
        // Consume a throwaway first sentence so the strong set applies.
        let consumed = buffer.push_text("x。");
        assert_eq!(consumed, vec!["x"]);
    }
    let mut out = buffer.push_text(input);
    if let Some(tail) = buffer.flush() {
        out.push(tail);
    }
    out
}

#[test]
fn test_strong_terminator_segmentation() {
    assert_eq!(segment_all("A。B!C", false), vec!["A", "B", "C"]);
}

#[test]
fn test_first_sentence_wide_terminators() {
    assert_eq!(segment_all("A, B。C", true), vec!["A", "B", "C"]);
}

#[test]
fn test_streamed_chunks_segment_at_boundaries() {
    let mut buffer = SegmentBuffer::new();
    let mut segments = Vec::new();
    for chunk in ["今日は", "いい天気", "ですね。", "散歩に", "行きましょう。"] {
        segments.extend(buffer.push_text(chunk));
    }
    if let Some(tail) = buffer.flush() {
        segments.push(tail);
    }
    assert_eq!(segments, vec!["今日はいい天気ですね", "散歩に行きましょう"]);
}

#[test]
fn test_emoji_and_markdown_are_stripped_from_segments() {
    let segments = segment_all("**こんにちは**🙂。", true);
    // Markdown is removed later by synthesis; segmentation strips emoji and
    // the terminator itself.
    assert_eq!(segments, vec!["**こんにちは**"]);
}

// =====================================================================
// DIALOGUE
// =====================================================================

fn assert_well_formed(dialogue: &Dialogue) {
    let messages = dialogue.messages();
    assert_eq!(
        messages.iter().filter(|m| m.role == Role::System).count(),
        1,
        "exactly one system message"
    );
    assert_eq!(messages[0].role, Role::System, "system message first");
    for (i, message) in messages.iter().enumerate() {
        if message.role == Role::Tool {
            let id = message.tool_call_id.as_ref().expect("tool message carries id");
            let prev = &messages[i - 1];
            assert_eq!(prev.role, Role::Assistant);
            assert!(prev
                .tool_calls
                .as_ref()
                .expect("assistant before tool carries calls")
                .iter()
                .any(|c| &c.id == id));
        }
    }
}

#[test]
fn test_tool_roundtrip_dialogue_shape() {
    // The message sequence `chat` produces for an E4-style turn.
    let mut dialogue = Dialogue::new();
    dialogue.update_system_message("あなたはアシスタントです");
    dialogue.put(Message::user("今日は何日？"));
    dialogue.put(Message::assistant_tool_call(ToolCall::function(
        "call_7",
        "get_time",
        r#"{"lang":"ja_JP"}"#,
    )));
    dialogue.put(Message::tool_result("call_7", "現在の日付: 2025-01-15、現在の時刻: 09:30:00、水曜日"));
    dialogue.put(Message::assistant("今日は1月15日、水曜日ですよ。"));
    assert_well_formed(&dialogue);
}

#[test]
fn test_persona_change_replaces_system() {
    let mut dialogue = Dialogue::new();
    dialogue.update_system_message("ペルソナA");
    dialogue.put(Message::user("こんにちは"));
    dialogue.put(Message::assistant("どうも"));
    dialogue.update_system_message("ペルソナB");
    assert_well_formed(&dialogue);
    assert_eq!(dialogue.messages()[0].content, "ペルソナB");
    assert_eq!(dialogue.len(), 3);
}

// =====================================================================
// QUEUES (barge-in semantics)
// =====================================================================

#[tokio::test]
async fn test_queue_clear_is_immediate_and_complete() {
    let queue: TaskQueue<u32> = TaskQueue::new();
    for i in 0..100 {
        queue.push(i).await;
    }
    assert_eq!(queue.clear().await, 100);
    // After a drain, the consumer times out within one poll interval.
    let popped = queue.pop_timeout(Duration::from_millis(50)).await;
    assert_eq!(popped, None);
}

#[tokio::test]
async fn test_queue_items_after_clear_flow_again() {
    let queue: TaskQueue<&str> = TaskQueue::new();
    queue.push("stale").await;
    queue.clear().await;
    queue.push("fresh").await;
    assert_eq!(queue.pop_timeout(Duration::from_millis(50)).await, Some("fresh"));
}

// =====================================================================
// AUDIO CODEC
// =====================================================================

#[test]
fn test_opus_round_trip_duration() {
    let pcm: Vec<i16> = (0..FRAME_SAMPLES * 5)
        .map(|i| ((i as f32 * 0.02).sin() * 10_000.0) as i16)
        .collect();
    let frames = encode_pcm_to_frames(&pcm).unwrap();
    assert_eq!(frames.len(), 5);
    let decoded = decode_frames_to_pcm(&frames).unwrap();
    // Duration is preserved exactly, bytes need not be.
    assert_eq!(decoded.len(), pcm.len());
}

#[test]
fn test_wav_header_laws() {
    for n in [0usize, 1, 960, 48_000] {
        let header = wav_header(n);
        let riff = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
        let data = u32::from_le_bytes(header[40..44].try_into().unwrap()) as usize;
        assert_eq!(data, 2 * n);
        assert_eq!(riff, 36 + 2 * n);
    }
}

// =====================================================================
// CONFIG
// =====================================================================

fn config_with(vad_kind: &str, asr_url: &str) -> Config {
    let raw = format!(
        r#"
        [selected_module]
        VAD = "v"
        ASR = "a"

        [VAD.v]
        type = "{vad_kind}"

        [ASR.a]
        type = "openai"
        base_url = "{asr_url}"
        "#
    );
    let toml_value: toml::Value = toml::from_str(&raw).unwrap();
    Config::from_value(serde_json::to_value(toml_value).unwrap()).unwrap()
}

#[test]
fn test_reload_diff_detects_only_changed_modules() {
    let current = config_with("energy", "http://asr-1/v1");
    let unchanged = config_with("energy", "http://asr-1/v1");
    assert!(!check_vad_update(&current, &unchanged));
    assert!(!check_asr_update(&current, &unchanged));

    let asr_moved = config_with("energy", "http://asr-2/v1");
    assert!(!check_vad_update(&current, &asr_moved));
    assert!(check_asr_update(&current, &asr_moved));
}

#[test]
fn test_private_overlay_keeps_unrelated_sections() {
    let base = config_with("energy", "http://asr-1/v1");
    let merged = base
        .overlaid(&serde_json::json!({
            "prompt": "新しい役柄",
            "device_max_output_size": 500,
            "chat_history_conf": 2,
        }))
        .unwrap();
    assert_eq!(merged.prompt.as_deref(), Some("新しい役柄"));
    assert_eq!(merged.device_max_output_size, 500);
    assert_eq!(merged.chat_history_conf, 2);
    assert_eq!(
        merged.provider("ASR", "a").unwrap().base_url.as_deref(),
        Some("http://asr-1/v1")
    );
}

// =====================================================================
// INLINE TOOL-CALL REPAIR
// =====================================================================

#[test]
fn test_inline_tool_call_repair_path() {
    let streamed = "<tool_call>{\"name\": \"get_time\", \"arguments\": {}}</tool_call>";
    let json = extract_json_from_string(streamed).unwrap();
    let value: serde_json::Value = serde_json::from_str(json).unwrap();
    assert_eq!(value["name"], "get_time");
    // Arguments normalize to an object even when empty.
    assert!(value["arguments"].is_object());
}
