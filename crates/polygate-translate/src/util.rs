//! Shared helpers for the converter modules.

use rand::distr::{Alphanumeric, SampleString};
use serde_json::Value;

/// Random message id with a dialect-appropriate prefix, e.g. `chatcmpl-…`.
pub(crate) fn gen_id(prefix: &str) -> String {
    let suffix = Alphanumeric.sample_string(&mut rand::rng(), 24);
    format!("{prefix}{suffix}")
}

pub(crate) fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

pub(crate) fn get_str<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(Value::as_str)
}

/// Flatten OpenAI-style content (string or array of parts) to plain text.
pub(crate) fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| {
                get_str(p, "text")
                    .or_else(|| get_str(p, "input_text"))
                    .map(str::to_string)
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Anthropic `stop_reason` → OpenAI `finish_reason`.
pub(crate) fn stop_reason_to_finish(stop_reason: &str) -> &'static str {
    match stop_reason {
        "tool_use" => "tool_calls",
        "max_tokens" => "length",
        // end_turn, stop_sequence, and anything unknown map to a plain stop
        _ => "stop",
    }
}

/// OpenAI `finish_reason` → Anthropic `stop_reason`.
pub(crate) fn finish_to_stop_reason(finish_reason: &str) -> &'static str {
    match finish_reason {
        "tool_calls" => "tool_use",
        "length" => "max_tokens",
        _ => "end_turn",
    }
}

/// Split a `data:` URI into (media type, base64 payload).
pub(crate) fn parse_data_uri(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (header, data) = rest.split_once(',')?;
    let media_type = header.split(';').next().unwrap_or("image/png");
    Some((media_type.to_string(), data.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_text_string_and_parts() {
        assert_eq!(content_text(&json!("hi")), "hi");
        assert_eq!(
            content_text(&json!([{"type": "text", "text": "a"}, {"type": "text", "text": "b"}])),
            "a\nb"
        );
        assert_eq!(content_text(&json!(42)), "");
    }

    #[test]
    fn test_finish_reason_maps() {
        assert_eq!(stop_reason_to_finish("end_turn"), "stop");
        assert_eq!(stop_reason_to_finish("tool_use"), "tool_calls");
        assert_eq!(stop_reason_to_finish("max_tokens"), "length");
        assert_eq!(stop_reason_to_finish("stop_sequence"), "stop");
        assert_eq!(finish_to_stop_reason("tool_calls"), "tool_use");
        assert_eq!(finish_to_stop_reason("length"), "max_tokens");
        assert_eq!(finish_to_stop_reason("stop"), "end_turn");
    }

    #[test]
    fn test_parse_data_uri() {
        let (media, data) = parse_data_uri("data:image/jpeg;base64,abc123").unwrap();
        assert_eq!(media, "image/jpeg");
        assert_eq!(data, "abc123");
        assert!(parse_data_uri("https://example.com/x.png").is_none());
    }

    #[test]
    fn test_gen_id_prefix() {
        let id = gen_id("msg_");
        assert!(id.starts_with("msg_"));
        assert!(id.len() > 10);
    }
}
