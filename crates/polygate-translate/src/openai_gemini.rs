//! openai-chat ↔ gemini-v1beta conversion.
//!
//! Roles map onto `contents[].role` (`assistant` → `model`, system messages
//! → `systemInstruction`), content parts onto `parts[]` of
//! `text`/`inlineData`/`fileData`, tool calls onto `functionCall` /
//! `functionResponse` parts, and `max_tokens` onto
//! `generationConfig.maxOutputTokens`. Gemini does not carry the model in
//! the body; it travels in the URL, so the request transform leaves it out.

use std::collections::HashMap;

use serde_json::{Map, Value, json};

use crate::util::{content_text, gen_id, get_str, now_unix, parse_data_uri};
use crate::{SseEvent, StreamFrame, StreamTranslator, UsageReport};

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// openai-chat request → gemini-v1beta `generateContent` request.
pub fn chat_to_gemini_request(_model: &str, body: &Value, _stream: bool) -> Value {
    let Some(messages) = body.get("messages").and_then(Value::as_array) else {
        return body.clone();
    };

    let mut system_parts: Vec<Value> = Vec::new();
    let mut contents: Vec<Value> = Vec::new();
    // tool_call_id → function name, for functionResponse parts
    let mut call_names: HashMap<String, String> = HashMap::new();

    for msg in messages {
        match get_str(msg, "role") {
            Some("system") | Some("developer") => {
                let text = content_text(msg.get("content").unwrap_or(&Value::Null));
                if !text.is_empty() {
                    system_parts.push(json!({"text": text}));
                }
            }
            Some("tool") => {
                let call_id = get_str(msg, "tool_call_id").unwrap_or_default();
                let name = call_names.get(call_id).cloned().unwrap_or_default();
                let text = content_text(msg.get("content").unwrap_or(&Value::Null));
                contents.push(json!({
                    "role": "user",
                    "parts": [{
                        "functionResponse": {
                            "name": name,
                            "response": {"content": text},
                        }
                    }]
                }));
            }
            Some(role) => {
                let gemini_role = if role == "assistant" { "model" } else { "user" };
                let mut parts = content_to_parts(msg.get("content").unwrap_or(&Value::Null));

                if let Some(calls) = msg.get("tool_calls").and_then(Value::as_array) {
                    for call in calls {
                        let f = call.get("function").cloned().unwrap_or_default();
                        let name = get_str(&f, "name").unwrap_or_default().to_string();
                        if let Some(id) = get_str(call, "id") {
                            call_names.insert(id.to_string(), name.clone());
                        }
                        let args = get_str(&f, "arguments")
                            .and_then(|a| serde_json::from_str(a).ok())
                            .unwrap_or_else(|| json!({}));
                        parts.push(json!({"functionCall": {"name": name, "args": args}}));
                    }
                }

                if !parts.is_empty() {
                    contents.push(json!({"role": gemini_role, "parts": parts}));
                }
            }
            None => {}
        }
    }

    let mut out = Map::new();
    out.insert("contents".into(), json!(contents));
    if !system_parts.is_empty() {
        out.insert("systemInstruction".into(), json!({"parts": system_parts}));
    }

    let mut generation = Map::new();
    if let Some(v) = body
        .get("max_tokens")
        .or_else(|| body.get("max_completion_tokens"))
    {
        generation.insert("maxOutputTokens".into(), v.clone());
    }
    if let Some(v) = body.get("temperature") {
        generation.insert("temperature".into(), v.clone());
    }
    if let Some(v) = body.get("top_p") {
        generation.insert("topP".into(), v.clone());
    }
    match body.get("stop") {
        Some(Value::String(s)) => {
            generation.insert("stopSequences".into(), json!([s]));
        }
        Some(Value::Array(seqs)) => {
            generation.insert("stopSequences".into(), json!(seqs));
        }
        _ => {}
    }
    if !generation.is_empty() {
        out.insert("generationConfig".into(), Value::Object(generation));
    }

    if let Some(tools) = body.get("tools").and_then(Value::as_array) {
        let declarations: Vec<Value> = tools
            .iter()
            .filter(|t| get_str(t, "type").unwrap_or("function") == "function")
            .map(|t| {
                let f = t.get("function").unwrap_or(t);
                json!({
                    "name": get_str(f, "name").unwrap_or_default(),
                    "description": get_str(f, "description").unwrap_or_default(),
                    "parameters": f.get("parameters").cloned()
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                })
            })
            .collect();
        if !declarations.is_empty() {
            out.insert("tools".into(), json!([{"functionDeclarations": declarations}]));
        }
    }

    Value::Object(out)
}

fn content_to_parts(content: &Value) -> Vec<Value> {
    match content {
        Value::String(s) if !s.is_empty() => vec![json!({"text": s})],
        Value::Array(items) => items
            .iter()
            .filter_map(|part| match get_str(part, "type") {
                Some("text") => Some(json!({"text": get_str(part, "text")?})),
                Some("image_url") => {
                    let url = part.get("image_url").and_then(|i| get_str(i, "url"))?;
                    match parse_data_uri(url) {
                        Some((mime, data)) => {
                            Some(json!({"inlineData": {"mimeType": mime, "data": data}}))
                        }
                        None => Some(json!({"fileData": {"fileUri": url}})),
                    }
                }
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

fn gemini_finish_reason(reason: Option<&str>, has_calls: bool) -> &'static str {
    if has_calls {
        return "tool_calls";
    }
    match reason {
        Some("MAX_TOKENS") => "length",
        _ => "stop",
    }
}

/// gemini-v1beta response → openai-chat response.
pub fn gemini_to_chat_response(model: &str, _request: &Value, response: &Value) -> Value {
    let Some(candidate) = response
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
    else {
        return response.clone();
    };

    let mut text = String::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    if let Some(parts) = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
    {
        for part in parts {
            if let Some(t) = get_str(part, "text") {
                text.push_str(t);
            }
            if let Some(call) = part.get("functionCall") {
                let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
                tool_calls.push(json!({
                    "id": gen_id("call_"),
                    "type": "function",
                    "function": {
                        "name": get_str(call, "name").unwrap_or_default(),
                        "arguments": args.to_string(),
                    }
                }));
            }
        }
    }

    let finish = gemini_finish_reason(get_str(candidate, "finishReason"), !tool_calls.is_empty());

    let mut message = Map::new();
    message.insert("role".into(), json!("assistant"));
    message.insert(
        "content".into(),
        if text.is_empty() && !tool_calls.is_empty() {
            Value::Null
        } else {
            json!(text)
        },
    );
    if !tool_calls.is_empty() {
        message.insert("tool_calls".into(), json!(tool_calls));
    }

    let usage = response.get("usageMetadata");
    let prompt = usage
        .and_then(|u| u.get("promptTokenCount"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let completion = usage
        .and_then(|u| u.get("candidatesTokenCount"))
        .and_then(Value::as_u64)
        .unwrap_or(0);

    json!({
        "id": gen_id("chatcmpl-"),
        "object": "chat.completion",
        "created": now_unix(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": Value::Object(message),
            "finish_reason": finish,
        }],
        "usage": {
            "prompt_tokens": prompt,
            "completion_tokens": completion,
            "total_tokens": prompt + completion,
        }
    })
}

// ---------------------------------------------------------------------------
// Streaming: gemini chunks → openai chunks
// ---------------------------------------------------------------------------

/// Translates a Gemini `streamGenerateContent` stream into OpenAI chunks.
pub struct GeminiToChatStream {
    id: String,
    created: i64,
    model: String,
    sent_role: bool,
    next_tool_index: usize,
    finish_reason: Option<&'static str>,
    usage: UsageReport,
    saw_usage: bool,
    done: bool,
}

impl GeminiToChatStream {
    pub fn new(model: &str) -> Self {
        Self {
            id: gen_id("chatcmpl-"),
            created: now_unix(),
            model: model.to_string(),
            sent_role: false,
            next_tool_index: 0,
            finish_reason: None,
            usage: UsageReport::default(),
            saw_usage: false,
            done: false,
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> StreamFrame {
        StreamFrame::json(&json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }]
        }))
    }

    fn final_frames(&mut self) -> Vec<StreamFrame> {
        self.done = true;
        let reason = self.finish_reason.unwrap_or("stop");
        vec![
            self.chunk(json!({}), Some(reason)),
            StreamFrame::data("[DONE]"),
        ]
    }
}

impl StreamTranslator for GeminiToChatStream {
    fn next(&mut self, event: &SseEvent) -> Vec<StreamFrame> {
        let Ok(data) = serde_json::from_str::<Value>(&event.data) else {
            return vec![StreamFrame::data(event.data.clone())];
        };

        let mut frames = Vec::new();
        if !self.sent_role {
            self.sent_role = true;
            frames.push(self.chunk(json!({"role": "assistant", "content": ""}), None));
        }

        if let Some(u) = data.get("usageMetadata") {
            self.usage.input_tokens = u
                .get("promptTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(self.usage.input_tokens);
            self.usage.output_tokens = u
                .get("candidatesTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(self.usage.output_tokens);
            self.saw_usage = true;
        }

        let Some(candidate) = data
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
        else {
            return frames;
        };

        if let Some(parts) = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(Value::as_array)
        {
            for part in parts {
                if let Some(text) = get_str(part, "text") {
                    if !text.is_empty() {
                        frames.push(self.chunk(json!({"content": text}), None));
                    }
                }
                if let Some(call) = part.get("functionCall") {
                    let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
                    let index = self.next_tool_index;
                    self.next_tool_index += 1;
                    frames.push(self.chunk(
                        json!({"tool_calls": [{
                            "index": index,
                            "id": gen_id("call_"),
                            "type": "function",
                            "function": {
                                "name": get_str(call, "name").unwrap_or_default(),
                                "arguments": args.to_string(),
                            },
                        }]}),
                        None,
                    ));
                    self.finish_reason = Some("tool_calls");
                }
            }
        }

        if let Some(reason) = get_str(candidate, "finishReason") {
            if self.finish_reason != Some("tool_calls") {
                self.finish_reason = Some(gemini_finish_reason(Some(reason), false));
            }
        }

        frames
    }

    fn finish(&mut self) -> Vec<StreamFrame> {
        if self.done {
            return Vec::new();
        }
        self.final_frames()
    }

    fn usage(&self) -> Option<UsageReport> {
        self.saw_usage.then_some(self.usage)
    }
}
