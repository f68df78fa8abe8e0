//! Text helpers shared across the pipeline: punctuation/emoji stripping,
//! markdown cleanup before synthesis, emotion inference for the `llm` control
//! frame, inline tool-call JSON extraction, and log redaction.

use once_cell::sync::Lazy;
use regex::Regex;

/// Punctuation stripped from utterances before wake-word / exit matching and
/// from segments before synthesis.
const PUNCTUATION: &[char] = &[
    '，', ',', '。', '.', '！', '!', '？', '?', '；', ';', '：', ':', '、', '～', '~', '"', '"',
    '「', '」', '（', '）', '(', ')', '…', '・', '\'', '"', ' ', '　',
];

static EMOJI_RE: Lazy<Regex> = Lazy::new(|| {
    // Covers the common emoji planes plus variation selectors.
    Regex::new("[\u{1F300}-\u{1FAFF}\u{2600}-\u{27BF}\u{FE0F}\u{1F000}-\u{1F02F}]").unwrap()
});

/// Strip punctuation and emoji from both ends and collapse the remainder.
/// Returns the character count of the filtered text together with the text,
/// mirroring how the matcher keys off both.
pub fn remove_punctuation_and_length(text: &str) -> (usize, String) {
    let no_emoji = EMOJI_RE.replace_all(text, "");
    let filtered: String = no_emoji.chars().filter(|c| !PUNCTUATION.contains(c)).collect();
    (filtered.chars().count(), filtered)
}

/// Segment text with terminators and emoji removed, fit for the TTS provider
/// and the `stt` frame.
pub fn strip_punctuation_and_emoji(text: &str) -> String {
    let no_emoji = EMOJI_RE.replace_all(text, "");
    no_emoji
        .trim_matches(|c: char| PUNCTUATION.contains(&c) || c.is_whitespace())
        .to_string()
}

static MD_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (Regex::new(r"```[\s\S]*?```").unwrap(), ""),
        (Regex::new(r"`([^`]*)`").unwrap(), "$1"),
        (Regex::new(r"!\[[^\]]*\]\([^)]*\)").unwrap(), ""),
        (Regex::new(r"\[([^\]]*)\]\([^)]*\)").unwrap(), "$1"),
        (Regex::new(r"[*_#>]+").unwrap(), ""),
        (Regex::new(r"^\s*[-+]\s+").unwrap(), ""),
    ]
});

/// Remove markdown markup that would otherwise be read aloud.
pub fn clean_markdown(text: &str) -> String {
    let mut out = text.to_string();
    for (re, rep) in MD_PATTERNS.iter() {
        out = re.replace_all(&out, *rep).to_string();
    }
    out.trim().to_string()
}

/// Emotion keyword table feeding the `{type:"llm"}` emoji frame.
const EMOTION_EMOJI: &[(&str, &str)] = &[
    ("neutral", "😶"),
    ("happy", "🙂"),
    ("laughing", "😆"),
    ("funny", "😂"),
    ("sad", "😔"),
    ("angry", "😠"),
    ("crying", "😭"),
    ("loving", "😍"),
    ("embarrassed", "😳"),
    ("surprised", "😲"),
    ("shocked", "😱"),
    ("thinking", "🤔"),
    ("winking", "😉"),
    ("cool", "😎"),
    ("relaxed", "😌"),
    ("delicious", "🤤"),
    ("kissy", "😘"),
    ("confident", "😏"),
    ("sleepy", "😴"),
    ("silly", "😜"),
    ("confused", "🙄"),
];

/// Cheap keyword/punctuation emotion guess for a synthesized sentence.
pub fn analyze_emotion(text: &str) -> &'static str {
    let t = text.to_lowercase();
    let hits: &[(&str, &[&str])] = &[
        ("laughing", &["ハハ", "笑", "haha", "lol"]),
        ("crying", &["泣", "悲しすぎ", "つらい"]),
        ("sad", &["悲し", "残念", "sorry", "ごめん"]),
        ("angry", &["怒", "ムカ", "angry"]),
        ("loving", &["大好き", "愛", "love"]),
        ("surprised", &["びっくり", "驚", "えっ", "wow"]),
        ("thinking", &["考え", "思う", "かな", "でしょうか"]),
        ("sleepy", &["眠", "おやすみ", "寝"]),
        ("delicious", &["おいし", "うまい", "食べ"]),
        ("cool", &["かっこいい", "クール", "cool"]),
        ("confident", &["任せて", "もちろん", "できます"]),
        ("happy", &["うれし", "嬉し", "楽し", "やった", "!", "！"]),
    ];
    for (emotion, words) in hits {
        if words.iter().any(|w| t.contains(w)) {
            return emotion;
        }
    }
    if t.contains('?') || t.contains('？') {
        "thinking"
    } else {
        "neutral"
    }
}

/// Emoji for an emotion name, falling back to the smiley.
pub fn emotion_emoji(emotion: &str) -> &'static str {
    EMOTION_EMOJI
        .iter()
        .find(|(name, _)| *name == emotion)
        .map(|(_, emoji)| *emoji)
        .unwrap_or("🙂")
}

/// Extract the first balanced JSON object from surrounding text.
///
/// Small models emit `<tool_call>{...}</tool_call>` inline instead of a
/// structured call; this is the single place that digs the object out.
/// Returns `None` when no balanced object exists.
pub fn extract_json_from_string(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

const SENSITIVE_KEYS: &[&str] = &["api_key", "secret", "token", "access_token", "auth_key"];

/// Redact secret-bearing fields before a config or message hits the log.
pub fn filter_sensitive_info(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                if SENSITIVE_KEYS.iter().any(|s| k.to_lowercase().contains(s)) {
                    out.insert(k.clone(), serde_json::Value::String("***".into()));
                } else {
                    out.insert(k.clone(), filter_sensitive_info(v));
                }
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(filter_sensitive_info).collect())
        }
        other => other.clone(),
    }
}

/// Truncate on a char boundary for log lines.
pub fn truncate_safe(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_punctuation_and_emoji() {
        let (len, text) = remove_punctuation_and_length("こんにちは！🙂");
        assert_eq!(text, "こんにちは");
        assert_eq!(len, 5);
    }

    #[test]
    fn extracts_wrapped_tool_call() {
        let raw = r#"<tool_call>{"name":"get_time","arguments":{}}</tool_call>"#;
        let json = extract_json_from_string(raw).unwrap();
        let v: serde_json::Value = serde_json::from_str(json).unwrap();
        assert_eq!(v["name"], "get_time");
    }

    #[test]
    fn extracts_nested_objects_with_strings() {
        let raw = r#"noise {"a":{"b":"}{"},"c":1} tail"#;
        assert_eq!(extract_json_from_string(raw).unwrap(), r#"{"a":{"b":"}{"},"c":1}"#);
        assert!(extract_json_from_string("no json here").is_none());
    }

    #[test]
    fn cleans_markdown() {
        assert_eq!(clean_markdown("**強い** `code` [link](http://x)"), "強い code link");
    }

    #[test]
    fn redacts_secrets() {
        let v = serde_json::json!({"api_key": "sk-123", "nested": {"secret": "s"}, "ok": 1});
        let filtered = filter_sensitive_info(&v);
        assert_eq!(filtered["api_key"], "***");
        assert_eq!(filtered["nested"]["secret"], "***");
        assert_eq!(filtered["ok"], 1);
    }

    #[test]
    fn emotion_falls_back_to_neutral() {
        assert_eq!(analyze_emotion("今日は晴れです"), "neutral");
        assert_eq!(analyze_emotion("やったー！"), "happy");
        assert_eq!(emotion_emoji("unknown"), "🙂");
    }
}
