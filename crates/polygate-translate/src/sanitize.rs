//! Tool-name sanitization for strict upstream character classes.
//!
//! Azure Foundry rejects function names containing characters outside
//! `[A-Za-z0-9_-]` (a `:` in an MCP-style name like `search:web` is enough
//! to fail the whole request). Sanitization is idempotent, and the rename
//! map lets responses restore the client's original names.

use std::collections::BTreeMap;

use serde_json::Value;

/// Replace every character outside `[A-Za-z0-9_-]` with `_`.
pub fn sanitize_tool_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Sanitize every tool/function name in a provider-dialect payload, in place.
///
/// Returns a map of sanitized → original for names that changed, used to
/// restore client-facing names in responses. Walks `tools[].name` (Anthropic),
/// `tools[].function.name` (OpenAI), and assistant-history `tool_use` blocks
/// so the conversation stays self-consistent upstream.
pub fn sanitize_payload_tool_names(payload: &mut Value) -> BTreeMap<String, String> {
    let mut renames = BTreeMap::new();

    if let Some(tools) = payload.get_mut("tools").and_then(Value::as_array_mut) {
        for tool in tools {
            let slot = if tool.get("function").is_some() {
                tool.get_mut("function").and_then(|f| f.get_mut("name"))
            } else {
                tool.get_mut("name")
            };
            rename_in_place(slot, &mut renames);
        }
    }

    if let Some(tc) = payload.get_mut("tool_choice") {
        rename_in_place(tc.get_mut("name"), &mut renames);
        if let Some(f) = tc.get_mut("function") {
            rename_in_place(f.get_mut("name"), &mut renames);
        }
    }

    if let Some(messages) = payload.get_mut("messages").and_then(Value::as_array_mut) {
        for msg in messages {
            if let Some(blocks) = msg.get_mut("content").and_then(Value::as_array_mut) {
                for block in blocks {
                    if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                        rename_in_place(block.get_mut("name"), &mut renames);
                    }
                }
            }
            if let Some(calls) = msg.get_mut("tool_calls").and_then(Value::as_array_mut) {
                for call in calls {
                    if let Some(f) = call.get_mut("function") {
                        rename_in_place(f.get_mut("name"), &mut renames);
                    }
                }
            }
        }
    }

    renames
}

/// Restore original tool names in a response, using the map produced by
/// [`sanitize_payload_tool_names`].
pub fn restore_tool_names(response: &mut Value, renames: &BTreeMap<String, String>) {
    if renames.is_empty() {
        return;
    }
    restore_value(response, renames);
}

fn restore_value(value: &mut Value, renames: &BTreeMap<String, String>) {
    match value {
        Value::Object(map) => {
            let is_named_call = matches!(
                map.get("type").and_then(Value::as_str),
                Some("tool_use") | Some("function_call") | Some("function")
            ) || map.contains_key("arguments")
                || map.contains_key("input");
            if is_named_call {
                if let Some(Value::String(name)) = map.get_mut("name") {
                    if let Some(original) = renames.get(name.as_str()) {
                        *name = original.clone();
                    }
                }
            }
            for v in map.values_mut() {
                restore_value(v, renames);
            }
        }
        Value::Array(items) => {
            for v in items {
                restore_value(v, renames);
            }
        }
        _ => {}
    }
}

fn rename_in_place(slot: Option<&mut Value>, renames: &mut BTreeMap<String, String>) {
    if let Some(Value::String(name)) = slot {
        let sanitized = sanitize_tool_name(name);
        if sanitized != *name {
            renames.insert(sanitized.clone(), name.clone());
            *name = sanitized;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sanitize_replaces_invalid_chars() {
        assert_eq!(sanitize_tool_name("search:web"), "search_web");
        assert_eq!(sanitize_tool_name("a.b/c d"), "a_b_c_d");
        assert_eq!(sanitize_tool_name("plain_name-1"), "plain_name-1");
    }

    #[test]
    fn test_sanitize_idempotent() {
        let once = sanitize_tool_name("mcp:tools/list");
        assert_eq!(sanitize_tool_name(&once), once);
    }

    #[test]
    fn test_payload_sanitization_anthropic_tools() {
        let mut payload = json!({
            "tools": [{"name": "search:web", "input_schema": {}}],
            "messages": [{
                "role": "assistant",
                "content": [{"type": "tool_use", "id": "t1", "name": "search:web", "input": {}}]
            }]
        });
        let renames = sanitize_payload_tool_names(&mut payload);
        assert_eq!(payload["tools"][0]["name"], "search_web");
        assert_eq!(payload["messages"][0]["content"][0]["name"], "search_web");
        assert_eq!(renames.get("search_web").unwrap(), "search:web");
    }

    #[test]
    fn test_payload_sanitization_openai_tools() {
        let mut payload = json!({
            "tools": [{"type": "function", "function": {"name": "fs.read", "parameters": {}}}]
        });
        let renames = sanitize_payload_tool_names(&mut payload);
        assert_eq!(payload["tools"][0]["function"]["name"], "fs_read");
        assert_eq!(renames.len(), 1);
    }

    #[test]
    fn test_restore_tool_names_in_response() {
        let mut payload = json!({"tools": [{"name": "search:web", "input_schema": {}}]});
        let renames = sanitize_payload_tool_names(&mut payload);

        let mut response = json!({
            "content": [
                {"type": "text", "text": "ok"},
                {"type": "tool_use", "id": "t1", "name": "search_web", "input": {"q": "x"}}
            ]
        });
        restore_tool_names(&mut response, &renames);
        assert_eq!(response["content"][1]["name"], "search:web");
        // text blocks untouched
        assert_eq!(response["content"][0]["text"], "ok");
    }

    #[test]
    fn test_clean_payload_produces_no_renames() {
        let mut payload = json!({"tools": [{"name": "ok_tool", "input_schema": {}}]});
        assert!(sanitize_payload_tool_names(&mut payload).is_empty());
    }
}
