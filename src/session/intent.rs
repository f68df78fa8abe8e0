//! Intent router: decides whether a transcribed utterance short-circuits the
//! LLM turn. Order: exact exit command, wake word, then (outside
//! function-call mode) the LLM intent detector.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::providers::intent::{IntentKind, CONTINUE_CHAT};
use crate::session::{send, wakeup, ConnectionHandler};
use crate::tools::{FunctionCallData, ToolResult};
use crate::tts::ContentType;
use crate::utils::remove_punctuation_and_length;

/// Returns true when the utterance was fully handled here.
pub async fn handle_user_intent(conn: &Arc<ConnectionHandler>, text: &str) -> bool {
    let (len, filtered_text) = remove_punctuation_and_length(text);
    if len > 0 && len <= conn.max_cmd_length && check_direct_exit(conn, &filtered_text).await {
        return true;
    }
    if wakeup::check_wakeup_words(conn, &filtered_text).await {
        return true;
    }
    if conn.intent_type == IntentKind::FunctionCall {
        // The LLM's native tool calling handles intent; nothing to do here.
        return false;
    }
    let Some(intent) = &conn.intent else { return false };
    let dialogue = conn.dialogue.lock().await.messages().to_vec();
    let intent_result = match intent.detect_intent(&dialogue, text).await {
        Ok(result) => result,
        Err(e) => {
            error!("intent detection failed: {e}");
            return false;
        }
    };
    process_intent_result(conn, &intent_result, text).await
}

async fn check_direct_exit(conn: &Arc<ConnectionHandler>, filtered_text: &str) -> bool {
    for cmd in &conn.config.exit_commands {
        if filtered_text == cmd {
            info!("exit command recognized: {filtered_text}");
            send::send_stt_message(conn, filtered_text).await;
            conn.close().await;
            return true;
        }
    }
    false
}

/// Execute a `function_call` result from the detector, converting the tool
/// result with the same policy as the LLM turn.
async fn process_intent_result(
    conn: &Arc<ConnectionHandler>,
    intent_result: &str,
    original_text: &str,
) -> bool {
    let Ok(intent_data) = serde_json::from_str::<Value>(intent_result) else {
        error!("intent result is not json: {intent_result}");
        return false;
    };
    let Some(function_call) = intent_data.get("function_call") else {
        return false;
    };
    let Some(function_name) = function_call.get("name").and_then(Value::as_str) else {
        return false;
    };
    if function_name == CONTINUE_CHAT {
        return false;
    }
    debug!("intent routed to function: {function_name}");

    let arguments = match function_call.get("arguments") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "{}".to_string(),
        Some(other) => other.to_string(),
    };
    let call = FunctionCallData {
        name: function_name.to_string(),
        id: Uuid::new_v4().simple().to_string(),
        arguments,
    };

    send::send_stt_message(conn, original_text).await;
    conn.set_abort(false);

    let conn = conn.clone();
    let original_text = original_text.to_string();
    tokio::spawn(async move {
        conn.dialogue
            .lock()
            .await
            .put(crate::dialogue::Message::user(&original_text));
        let result = conn.tool_handler.handle_function_call(&conn, &call).await;
        match result {
            ToolResult::Response(text) => speak_txt(&conn, &text).await,
            ToolResult::ReqLlm(text) => {
                {
                    let mut dialogue = conn.dialogue.lock().await;
                    dialogue.put(crate::dialogue::Message::assistant_tool_call(
                        crate::dialogue::ToolCall::function(&call.id, &call.name, &call.arguments),
                    ));
                    dialogue.put(crate::dialogue::Message::tool_result(&call.id, &text));
                }
                let reply = match &conn.intent {
                    Some(intent) => intent
                        .reply_result(&text, &original_text)
                        .await
                        .ok()
                        .filter(|r| !r.is_empty())
                        .unwrap_or(text),
                    None => text,
                };
                speak_txt(&conn, &reply).await;
            }
            ToolResult::NotFound(text) | ToolResult::Error(text) => speak_txt(&conn, &text).await,
            ToolResult::None => {}
        }
    });
    true
}

async fn speak_txt(conn: &Arc<ConnectionHandler>, text: &str) {
    conn.tts
        .tts_one_sentence(conn, ContentType::Text, Some(text.to_string()), None)
        .await;
    conn.dialogue.lock().await.put(crate::dialogue::Message::assistant(text));
}
