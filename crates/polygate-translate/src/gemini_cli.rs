//! Code Assist envelope for Google's internal CLI endpoint.
//!
//! OAuth-backed Gemini credentials talk to the Code Assist API, which wraps
//! the plain `generateContent` payload in a `{model, project, request}`
//! envelope and nests responses under a `response` key. The payload inside
//! is ordinary gemini-v1beta, so the openai ↔ gemini converters apply
//! unchanged on either side of the wrap.

use serde_json::{Value, json};

/// Wrap a gemini-v1beta request payload for the Code Assist endpoint.
pub fn wrap_code_assist(model: &str, project: Option<&str>, payload: &Value) -> Value {
    let mut envelope = json!({
        "model": model,
        "request": payload,
    });
    if let Some(project) = project {
        if !project.is_empty() {
            envelope["project"] = json!(project);
        }
    }
    envelope
}

/// Unwrap a Code Assist response (or stream chunk) to the inner
/// gemini-v1beta payload. Payloads without the envelope come back unchanged.
pub fn unwrap_code_assist(response: &Value) -> Value {
    match response.get("response") {
        Some(inner) if inner.is_object() => inner.clone(),
        _ => response.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_includes_project() {
        let payload = json!({"contents": [{"role": "user", "parts": [{"text": "hi"}]}]});
        let wrapped = wrap_code_assist("gemini-2.5-pro", Some("my-project"), &payload);
        assert_eq!(wrapped["model"], "gemini-2.5-pro");
        assert_eq!(wrapped["project"], "my-project");
        assert_eq!(wrapped["request"]["contents"][0]["parts"][0]["text"], "hi");
    }

    #[test]
    fn test_wrap_without_project() {
        let wrapped = wrap_code_assist("m", None, &json!({"contents": []}));
        assert!(wrapped.get("project").is_none());
    }

    #[test]
    fn test_unwrap_round_trip() {
        let inner = json!({"candidates": [{"content": {"parts": [{"text": "ok"}]}}]});
        let enveloped = json!({"response": inner});
        assert_eq!(unwrap_code_assist(&enveloped), inner);
    }

    #[test]
    fn test_unwrap_passthrough_when_not_enveloped() {
        let plain = json!({"candidates": []});
        assert_eq!(unwrap_code_assist(&plain), plain);
    }
}
