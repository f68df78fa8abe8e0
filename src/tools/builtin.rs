//! Server plugins registered at process startup.

use std::sync::Arc;

use chrono::{Datelike, Local};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::info;

use crate::error::Result;
use crate::tools::{register_tool, ToolDescriptor, ToolResult, ToolType};

const WEEKDAYS_JA: [&str; 7] =
    ["月曜日", "火曜日", "水曜日", "木曜日", "金曜日", "土曜日", "日曜日"];

fn current_time_text() -> String {
    let now = Local::now();
    let weekday = WEEKDAYS_JA[now.weekday().num_days_from_monday() as usize];
    format!(
        "現在の日付: {}、現在の時刻: {}、{}",
        now.format("%Y-%m-%d"),
        now.format("%H:%M:%S"),
        weekday
    )
}

/// Personas selectable through `change_role`.
const ROLES: &[(&str, &str)] = &[
    (
        "アシスタント",
        "あなたは丁寧で頼りになる音声アシスタントです。簡潔に話し言葉で答えてください。",
    ),
    (
        "英語の先生",
        "あなたは優しい英語の先生です。簡単な英語と日本語を交えて、発音や表現を教えてください。",
    ),
    (
        "ともだち",
        "あなたは気さくな友達です。タメ口で、短くテンポよく返事をしてください。",
    ),
];

pub fn register_builtin_tools() -> Result<()> {
    register_tool(ToolDescriptor {
        name: "get_time".to_string(),
        description: "今日の日付または現在の時刻情報を取得します".to_string(),
        parameters: json!({"type": "object", "properties": {}, "required": []}),
        tool_type: ToolType::Wait,
        handler: Arc::new(|_conn, _args| -> BoxFuture<'static, Result<ToolResult>> {
            Box::pin(async { Ok(ToolResult::ReqLlm(current_time_text())) })
        }),
    })?;

    register_tool(ToolDescriptor {
        name: "handle_exit_intent".to_string(),
        description: "ユーザーが会話を終えたいとき（さようなら、バイバイ、もう終わり等）に呼び出します"
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "say_goodbye": {
                    "type": "string",
                    "description": "ユーザーへの別れの言葉"
                }
            },
            "required": []
        }),
        tool_type: ToolType::SystemCtl,
        handler: Arc::new(|conn, args: Value| -> BoxFuture<'static, Result<ToolResult>> {
            Box::pin(async move {
                let goodbye = args
                    .get("say_goodbye")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .unwrap_or("またお話しましょう。さようなら！")
                    .to_string();
                conn.set_close_after_chat(true);
                info!("exit intent accepted, closing after this turn");
                Ok(ToolResult::Response(goodbye))
            })
        }),
    })?;

    register_tool(ToolDescriptor {
        name: "change_role".to_string(),
        description: format!(
            "アシスタントの役柄を切り替えます。選択肢: {}",
            ROLES.iter().map(|(n, _)| *n).collect::<Vec<_>>().join("、")
        ),
        parameters: json!({
            "type": "object",
            "properties": {
                "role_name": {
                    "type": "string",
                    "description": "切り替える役柄の名前"
                }
            },
            "required": ["role_name"]
        }),
        tool_type: ToolType::ChangeSysPrompt,
        handler: Arc::new(|conn, args: Value| -> BoxFuture<'static, Result<ToolResult>> {
            Box::pin(async move {
                let role_name = args.get("role_name").and_then(Value::as_str).unwrap_or_default();
                let Some((name, prompt)) = ROLES.iter().find(|(n, _)| *n == role_name) else {
                    return Ok(ToolResult::Error(format!(
                        "「{role_name}」という役柄は知りません"
                    )));
                };
                conn.change_system_prompt(prompt).await;
                Ok(ToolResult::Response(format!(
                    "わかりました。これからは{name}としてお話しますね。"
                )))
            })
        }),
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_text_shape() {
        let text = current_time_text();
        assert!(text.starts_with("現在の日付: "));
        assert!(text.contains("現在の時刻: "));
        assert!(WEEKDAYS_JA.iter().any(|d| text.ends_with(d)));
    }
}
