//! openai-chat ↔ anthropic-messages conversion.
//!
//! Requests: system messages lift to the top-level `system` array,
//! `tool_calls[].function` ↔ `content[].tool_use`, role `tool` ↔
//! `content[].tool_result`, `stop` ↔ `stop_sequences`, data-URI images ↔
//! base64 sources. Streaming: the Anthropic event stream becomes OpenAI
//! chunks (and back), with `finish_reason` mapped from `stop_reason`.

use serde_json::{Map, Value, json};

use crate::util::{
    content_text, finish_to_stop_reason, gen_id, get_str, now_unix, parse_data_uri,
    stop_reason_to_finish,
};
use crate::{SseEvent, StreamFrame, StreamTranslator, UsageReport};

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// openai-chat request → anthropic-messages request.
pub fn chat_to_messages_request(model: &str, body: &Value, stream: bool) -> Value {
    let Some(messages) = body.get("messages").and_then(Value::as_array) else {
        return body.clone();
    };

    let mut system: Vec<Value> = Vec::new();
    let mut out_messages: Vec<Value> = Vec::new();

    for msg in messages {
        match get_str(msg, "role") {
            Some("system") | Some("developer") => {
                let text = content_text(msg.get("content").unwrap_or(&Value::Null));
                if !text.is_empty() {
                    system.push(json!({"type": "text", "text": text}));
                }
            }
            Some("tool") => {
                let tool_use_id = get_str(msg, "tool_call_id").unwrap_or_default();
                let text = content_text(msg.get("content").unwrap_or(&Value::Null));
                out_messages.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": tool_use_id,
                        "content": text,
                    }]
                }));
            }
            Some(role) => {
                let role = if role == "assistant" { "assistant" } else { "user" };
                let mut blocks = content_to_blocks(msg.get("content").unwrap_or(&Value::Null));

                if let Some(calls) = msg.get("tool_calls").and_then(Value::as_array) {
                    for call in calls {
                        let f = call.get("function").cloned().unwrap_or_default();
                        let input = get_str(&f, "arguments")
                            .and_then(|a| serde_json::from_str(a).ok())
                            .unwrap_or_else(|| json!({}));
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": get_str(call, "id").unwrap_or_default(),
                            "name": get_str(&f, "name").unwrap_or_default(),
                            "input": input,
                        }));
                    }
                }

                if !blocks.is_empty() {
                    out_messages.push(json!({"role": role, "content": blocks}));
                }
            }
            None => {}
        }
    }

    let mut out = Map::new();
    out.insert("model".into(), json!(model));
    out.insert("messages".into(), json!(out_messages));
    if !system.is_empty() {
        out.insert("system".into(), json!(system));
    }
    let max_tokens = body
        .get("max_tokens")
        .or_else(|| body.get("max_completion_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(4096);
    out.insert("max_tokens".into(), json!(max_tokens));

    for key in ["temperature", "top_p", "metadata"] {
        if let Some(v) = body.get(key) {
            out.insert(key.into(), v.clone());
        }
    }
    match body.get("stop") {
        Some(Value::String(s)) => {
            out.insert("stop_sequences".into(), json!([s]));
        }
        Some(Value::Array(seqs)) => {
            out.insert("stop_sequences".into(), json!(seqs));
        }
        _ => {}
    }
    if let Some(tools) = body.get("tools").and_then(Value::as_array) {
        let converted: Vec<Value> = tools
            .iter()
            .filter(|t| get_str(t, "type").unwrap_or("function") == "function")
            .map(|t| {
                let f = t.get("function").unwrap_or(t);
                json!({
                    "name": get_str(f, "name").unwrap_or_default(),
                    "description": get_str(f, "description").unwrap_or_default(),
                    "input_schema": f.get("parameters").cloned()
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                })
            })
            .collect();
        if !converted.is_empty() {
            out.insert("tools".into(), json!(converted));
        }
    }
    if let Some(tc) = convert_tool_choice_to_anthropic(body.get("tool_choice")) {
        out.insert("tool_choice".into(), tc);
    }
    if stream {
        out.insert("stream".into(), json!(true));
    }

    Value::Object(out)
}

/// anthropic-messages request → openai-chat request.
pub fn messages_to_chat_request(model: &str, body: &Value, stream: bool) -> Value {
    let Some(messages) = body.get("messages").and_then(Value::as_array) else {
        return body.clone();
    };

    let mut out_messages: Vec<Value> = Vec::new();

    match body.get("system") {
        Some(Value::String(s)) if !s.is_empty() => {
            out_messages.push(json!({"role": "system", "content": s}));
        }
        Some(Value::Array(blocks)) => {
            let text = blocks
                .iter()
                .filter_map(|b| get_str(b, "text"))
                .collect::<Vec<_>>()
                .join("\n\n");
            if !text.is_empty() {
                out_messages.push(json!({"role": "system", "content": text}));
            }
        }
        _ => {}
    }

    for msg in messages {
        let role = get_str(msg, "role").unwrap_or("user");
        match msg.get("content") {
            Some(Value::String(text)) => {
                out_messages.push(json!({"role": role, "content": text}));
            }
            Some(Value::Array(blocks)) => {
                push_chat_messages_from_blocks(role, blocks, &mut out_messages);
            }
            _ => {}
        }
    }

    let mut out = Map::new();
    out.insert("model".into(), json!(model));
    out.insert("messages".into(), json!(out_messages));
    for key in ["max_tokens", "temperature", "top_p", "metadata"] {
        if let Some(v) = body.get(key) {
            out.insert(key.into(), v.clone());
        }
    }
    if let Some(seqs) = body.get("stop_sequences") {
        out.insert("stop".into(), seqs.clone());
    }
    if let Some(tools) = body.get("tools").and_then(Value::as_array) {
        let converted: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": get_str(t, "name").unwrap_or_default(),
                        "description": get_str(t, "description").unwrap_or_default(),
                        "parameters": t.get("input_schema").cloned()
                            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                    }
                })
            })
            .collect();
        out.insert("tools".into(), json!(converted));
    }
    match body.get("tool_choice").and_then(|tc| get_str(tc, "type")) {
        Some("auto") => {
            out.insert("tool_choice".into(), json!("auto"));
        }
        Some("any") => {
            out.insert("tool_choice".into(), json!("required"));
        }
        Some("tool") => {
            if let Some(name) = body.get("tool_choice").and_then(|tc| get_str(tc, "name")) {
                out.insert(
                    "tool_choice".into(),
                    json!({"type": "function", "function": {"name": name}}),
                );
            }
        }
        _ => {}
    }
    if stream {
        out.insert("stream".into(), json!(true));
        out.insert("stream_options".into(), json!({"include_usage": true}));
    }

    Value::Object(out)
}

/// One Anthropic message may fan out into several chat messages: tool_result
/// blocks become standalone role=tool messages.
fn push_chat_messages_from_blocks(role: &str, blocks: &[Value], out: &mut Vec<Value>) {
    let mut text_parts: Vec<Value> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    let mut only_text = true;

    for block in blocks {
        match get_str(block, "type") {
            Some("text") => {
                text_parts.push(json!({"type": "text", "text": get_str(block, "text").unwrap_or_default()}));
            }
            Some("image") => {
                only_text = false;
                let source = block.get("source").cloned().unwrap_or_default();
                let url = match get_str(&source, "type") {
                    Some("base64") => format!(
                        "data:{};base64,{}",
                        get_str(&source, "media_type").unwrap_or("image/png"),
                        get_str(&source, "data").unwrap_or_default()
                    ),
                    _ => get_str(&source, "url").unwrap_or_default().to_string(),
                };
                text_parts.push(json!({"type": "image_url", "image_url": {"url": url}}));
            }
            Some("tool_use") => {
                let input = block.get("input").cloned().unwrap_or_else(|| json!({}));
                tool_calls.push(json!({
                    "id": get_str(block, "id").unwrap_or_default(),
                    "type": "function",
                    "function": {
                        "name": get_str(block, "name").unwrap_or_default(),
                        "arguments": input.to_string(),
                    }
                }));
            }
            Some("tool_result") => {
                let content = match block.get("content") {
                    Some(Value::String(s)) => s.clone(),
                    Some(v) => content_text(v),
                    None => String::new(),
                };
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": get_str(block, "tool_use_id").unwrap_or_default(),
                    "content": content,
                }));
            }
            _ => {}
        }
    }

    if text_parts.is_empty() && tool_calls.is_empty() {
        return;
    }

    let mut msg = Map::new();
    msg.insert("role".into(), json!(role));
    if only_text {
        let text = text_parts
            .iter()
            .filter_map(|p| get_str(p, "text"))
            .collect::<Vec<_>>()
            .join("\n");
        msg.insert("content".into(), json!(text));
    } else {
        msg.insert("content".into(), json!(text_parts));
    }
    if !tool_calls.is_empty() {
        msg.insert("tool_calls".into(), json!(tool_calls));
    }
    out.push(Value::Object(msg));
}

fn convert_tool_choice_to_anthropic(choice: Option<&Value>) -> Option<Value> {
    match choice? {
        Value::String(mode) => match mode.as_str() {
            "auto" => Some(json!({"type": "auto"})),
            "required" => Some(json!({"type": "any"})),
            // "none" has no Anthropic counterpart; omitting it means auto
            // with the tools list absent, which the caller controls.
            _ => None,
        },
        choice @ Value::Object(_) => {
            let name = choice
                .get("function")
                .and_then(|f| get_str(f, "name"))
                .or_else(|| get_str(choice, "name"))?;
            Some(json!({"type": "tool", "name": name}))
        }
        _ => None,
    }
}

/// OpenAI content (string or parts) → Anthropic content blocks.
fn content_to_blocks(content: &Value) -> Vec<Value> {
    match content {
        Value::String(s) if !s.is_empty() => vec![json!({"type": "text", "text": s})],
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| match get_str(part, "type") {
                Some("text") => Some(json!({"type": "text", "text": get_str(part, "text")?})),
                Some("image_url") => {
                    let url = part.get("image_url").and_then(|i| get_str(i, "url"))?;
                    match parse_data_uri(url) {
                        Some((media_type, data)) => Some(json!({
                            "type": "image",
                            "source": {"type": "base64", "media_type": media_type, "data": data},
                        })),
                        None => Some(json!({
                            "type": "image",
                            "source": {"type": "url", "url": url},
                        })),
                    }
                }
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Non-streaming responses
// ---------------------------------------------------------------------------

/// anthropic-messages response → openai-chat response.
pub fn messages_to_chat_response(model: &str, _request: &Value, response: &Value) -> Value {
    let Some(content) = response.get("content").and_then(Value::as_array) else {
        return response.clone();
    };

    let mut text = String::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    for block in content {
        match get_str(block, "type") {
            Some("text") => text.push_str(get_str(block, "text").unwrap_or_default()),
            Some("tool_use") => {
                let input = block.get("input").cloned().unwrap_or_else(|| json!({}));
                tool_calls.push(json!({
                    "id": get_str(block, "id").unwrap_or_default(),
                    "type": "function",
                    "function": {
                        "name": get_str(block, "name").unwrap_or_default(),
                        "arguments": input.to_string(),
                    }
                }));
            }
            _ => {}
        }
    }

    let finish_reason = get_str(response, "stop_reason")
        .map(stop_reason_to_finish)
        .unwrap_or("stop");

    let mut message = Map::new();
    message.insert("role".into(), json!("assistant"));
    message.insert("content".into(), if text.is_empty() && !tool_calls.is_empty() {
        Value::Null
    } else {
        json!(text)
    });
    if !tool_calls.is_empty() {
        message.insert("tool_calls".into(), json!(tool_calls));
    }

    let usage = response.get("usage");
    let input_tokens = usage
        .and_then(|u| u.get("input_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let output_tokens = usage
        .and_then(|u| u.get("output_tokens"))
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
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": input_tokens,
            "completion_tokens": output_tokens,
            "total_tokens": input_tokens + output_tokens,
        }
    })
}

/// openai-chat response → anthropic-messages response.
pub fn chat_to_messages_response(model: &str, _request: &Value, response: &Value) -> Value {
    let Some(choice) = response
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
    else {
        return response.clone();
    };
    let message = choice.get("message").cloned().unwrap_or_default();

    let mut content: Vec<Value> = Vec::new();
    if let Some(text) = get_str(&message, "content") {
        if !text.is_empty() {
            content.push(json!({"type": "text", "text": text}));
        }
    }
    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            let f = call.get("function").cloned().unwrap_or_default();
            let input = get_str(&f, "arguments")
                .and_then(|a| serde_json::from_str(a).ok())
                .unwrap_or_else(|| json!({}));
            content.push(json!({
                "type": "tool_use",
                "id": get_str(call, "id").unwrap_or_default(),
                "name": get_str(&f, "name").unwrap_or_default(),
                "input": input,
            }));
        }
    }

    let stop_reason = get_str(choice, "finish_reason")
        .map(finish_to_stop_reason)
        .unwrap_or("end_turn");

    let usage = response.get("usage");
    let prompt = usage
        .and_then(|u| u.get("prompt_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let completion = usage
        .and_then(|u| u.get("completion_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);

    json!({
        "id": gen_id("msg_"),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": Value::Null,
        "usage": {"input_tokens": prompt, "output_tokens": completion},
    })
}

// ---------------------------------------------------------------------------
// Streaming: anthropic events → openai chunks
// ---------------------------------------------------------------------------

enum BlockKind {
    Text,
    Tool { tool_index: usize },
}

/// Translates an Anthropic Messages SSE stream into OpenAI chat chunks.
pub struct MessagesToChatStream {
    id: String,
    created: i64,
    model: String,
    blocks: Vec<Option<BlockKind>>,
    next_tool_index: usize,
    finish_reason: Option<String>,
    usage: UsageReport,
    saw_usage: bool,
    done: bool,
}

impl MessagesToChatStream {
    pub fn new(model: &str) -> Self {
        Self {
            id: gen_id("chatcmpl-"),
            created: now_unix(),
            model: model.to_string(),
            blocks: Vec::new(),
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

    fn final_chunk(&self) -> StreamFrame {
        let reason = self.finish_reason.as_deref().unwrap_or("stop");
        StreamFrame::json(&json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": {},
                "finish_reason": reason,
            }],
            "usage": {
                "prompt_tokens": self.usage.input_tokens,
                "completion_tokens": self.usage.output_tokens,
                "total_tokens": self.usage.input_tokens + self.usage.output_tokens,
            }
        }))
    }

    fn set_block(&mut self, index: usize, kind: BlockKind) {
        while self.blocks.len() <= index {
            self.blocks.push(None);
        }
        self.blocks[index] = Some(kind);
    }
}

impl StreamTranslator for MessagesToChatStream {
    fn next(&mut self, event: &SseEvent) -> Vec<StreamFrame> {
        let Ok(data) = serde_json::from_str::<Value>(&event.data) else {
            // Malformed upstream payload passes through verbatim.
            return vec![StreamFrame::data(event.data.clone())];
        };
        let event_type = event
            .event
            .as_deref()
            .or_else(|| get_str(&data, "type"))
            .unwrap_or_default()
            .to_string();

        match event_type.as_str() {
            "message_start" => {
                if let Some(u) = data.get("message").and_then(|m| m.get("usage")) {
                    self.usage.input_tokens =
                        u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
                    self.saw_usage = true;
                }
                vec![self.chunk(json!({"role": "assistant", "content": ""}), None)]
            }
            "content_block_start" => {
                let index = data.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                let block = data.get("content_block").cloned().unwrap_or_default();
                if get_str(&block, "type") == Some("tool_use") {
                    let tool_index = self.next_tool_index;
                    self.next_tool_index += 1;
                    self.set_block(index, BlockKind::Tool { tool_index });
                    vec![self.chunk(
                        json!({"tool_calls": [{
                            "index": tool_index,
                            "id": get_str(&block, "id").unwrap_or_default(),
                            "type": "function",
                            "function": {"name": get_str(&block, "name").unwrap_or_default(), "arguments": ""},
                        }]}),
                        None,
                    )]
                } else {
                    self.set_block(index, BlockKind::Text);
                    Vec::new()
                }
            }
            "content_block_delta" => {
                let index = data.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                let delta = data.get("delta").cloned().unwrap_or_default();
                match get_str(&delta, "type") {
                    Some("text_delta") => {
                        let text = get_str(&delta, "text").unwrap_or_default();
                        vec![self.chunk(json!({"content": text}), None)]
                    }
                    Some("input_json_delta") => {
                        let partial = get_str(&delta, "partial_json").unwrap_or_default();
                        let tool_index = match self.blocks.get(index) {
                            Some(Some(BlockKind::Tool { tool_index })) => *tool_index,
                            _ => 0,
                        };
                        vec![self.chunk(
                            json!({"tool_calls": [{
                                "index": tool_index,
                                "function": {"arguments": partial},
                            }]}),
                            None,
                        )]
                    }
                    _ => Vec::new(),
                }
            }
            "message_delta" => {
                if let Some(reason) = data.get("delta").and_then(|d| get_str(d, "stop_reason")) {
                    self.finish_reason = Some(stop_reason_to_finish(reason).to_string());
                }
                if let Some(u) = data.get("usage") {
                    self.usage.output_tokens =
                        u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0);
                    self.saw_usage = true;
                }
                Vec::new()
            }
            "message_stop" => {
                self.done = true;
                vec![self.final_chunk(), StreamFrame::data("[DONE]")]
            }
            "ping" | "content_block_stop" => Vec::new(),
            _ => Vec::new(),
        }
    }

    fn finish(&mut self) -> Vec<StreamFrame> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        vec![self.final_chunk(), StreamFrame::data("[DONE]")]
    }

    fn usage(&self) -> Option<UsageReport> {
        self.saw_usage.then_some(self.usage)
    }
}

// ---------------------------------------------------------------------------
// Streaming: openai chunks → anthropic events
// ---------------------------------------------------------------------------

enum OpenBlock {
    None,
    Text { index: usize },
    Tool { index: usize, tool_index: usize },
}

/// Translates an OpenAI chat chunk stream into Anthropic Messages events.
pub struct ChatToMessagesStream {
    id: String,
    model: String,
    started: bool,
    open: OpenBlock,
    next_index: usize,
    finish_reason: Option<String>,
    usage: UsageReport,
    saw_usage: bool,
    done: bool,
}

impl ChatToMessagesStream {
    pub fn new(model: &str) -> Self {
        Self {
            id: gen_id("msg_"),
            model: model.to_string(),
            started: false,
            open: OpenBlock::None,
            next_index: 0,
            finish_reason: None,
            usage: UsageReport::default(),
            saw_usage: false,
            done: false,
        }
    }

    fn start_frames(&mut self) -> Vec<StreamFrame> {
        self.started = true;
        vec![StreamFrame::named_json(
            "message_start",
            &json!({
                "type": "message_start",
                "message": {
                    "id": self.id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": Value::Null,
                    "usage": {"input_tokens": 0, "output_tokens": 0},
                }
            }),
        )]
    }

    fn close_open_block(&mut self, frames: &mut Vec<StreamFrame>) {
        let index = match self.open {
            OpenBlock::None => return,
            OpenBlock::Text { index } | OpenBlock::Tool { index, .. } => index,
        };
        frames.push(StreamFrame::named_json(
            "content_block_stop",
            &json!({"type": "content_block_stop", "index": index}),
        ));
        self.open = OpenBlock::None;
    }

    fn terminal_frames(&mut self) -> Vec<StreamFrame> {
        let mut frames = Vec::new();
        self.close_open_block(&mut frames);
        let stop_reason = self
            .finish_reason
            .as_deref()
            .map(finish_to_stop_reason)
            .unwrap_or("end_turn");
        frames.push(StreamFrame::named_json(
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": Value::Null},
                "usage": {"output_tokens": self.usage.output_tokens},
            }),
        ));
        frames.push(StreamFrame::named_json(
            "message_stop",
            &json!({"type": "message_stop"}),
        ));
        self.done = true;
        frames
    }
}

impl StreamTranslator for ChatToMessagesStream {
    fn next(&mut self, event: &SseEvent) -> Vec<StreamFrame> {
        let raw = event.data.trim();
        if raw == "[DONE]" {
            return if self.done { Vec::new() } else { self.terminal_frames() };
        }
        let Ok(data) = serde_json::from_str::<Value>(raw) else {
            return vec![StreamFrame::data(event.data.clone())];
        };

        let mut frames = Vec::new();
        if !self.started {
            frames.extend(self.start_frames());
        }

        if let Some(u) = data.get("usage").filter(|u| !u.is_null()) {
            self.usage.input_tokens = u
                .get("prompt_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(self.usage.input_tokens);
            self.usage.output_tokens = u
                .get("completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(self.usage.output_tokens);
            self.saw_usage = true;
        }

        let Some(choice) = data
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
        else {
            return frames;
        };
        let delta = choice.get("delta").cloned().unwrap_or_default();

        if let Some(text) = get_str(&delta, "content").filter(|t| !t.is_empty()) {
            if !matches!(self.open, OpenBlock::Text { .. }) {
                self.close_open_block(&mut frames);
                let index = self.next_index;
                self.next_index += 1;
                self.open = OpenBlock::Text { index };
                frames.push(StreamFrame::named_json(
                    "content_block_start",
                    &json!({
                        "type": "content_block_start",
                        "index": index,
                        "content_block": {"type": "text", "text": ""},
                    }),
                ));
            }
            if let OpenBlock::Text { index } = self.open {
                frames.push(StreamFrame::named_json(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": {"type": "text_delta", "text": text},
                    }),
                ));
            }
        }

        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                let tool_index =
                    call.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                let function = call.get("function").cloned().unwrap_or_default();
                let is_new = call.get("id").is_some()
                    || !matches!(self.open, OpenBlock::Tool { tool_index: t, .. } if t == tool_index);

                if is_new {
                    self.close_open_block(&mut frames);
                    let index = self.next_index;
                    self.next_index += 1;
                    self.open = OpenBlock::Tool { index, tool_index };
                    frames.push(StreamFrame::named_json(
                        "content_block_start",
                        &json!({
                            "type": "content_block_start",
                            "index": index,
                            "content_block": {
                                "type": "tool_use",
                                "id": get_str(call, "id").unwrap_or_default(),
                                "name": function.get("name").and_then(Value::as_str).unwrap_or_default(),
                                "input": {},
                            },
                        }),
                    ));
                }
                if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                    if !args.is_empty() {
                        if let OpenBlock::Tool { index, .. } = self.open {
                            frames.push(StreamFrame::named_json(
                                "content_block_delta",
                                &json!({
                                    "type": "content_block_delta",
                                    "index": index,
                                    "delta": {"type": "input_json_delta", "partial_json": args},
                                }),
                            ));
                        }
                    }
                }
            }
        }

        if let Some(reason) = get_str(choice, "finish_reason") {
            self.finish_reason = Some(reason.to_string());
        }

        frames
    }

    fn finish(&mut self) -> Vec<StreamFrame> {
        if self.done {
            return Vec::new();
        }
        let mut frames = Vec::new();
        if !self.started {
            frames.extend(self.start_frames());
        }
        frames.extend(self.terminal_frames());
        frames
    }

    fn usage(&self) -> Option<UsageReport> {
        self.saw_usage.then_some(self.usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sse(data: Value) -> SseEvent {
        SseEvent::data(data.to_string())
    }

    fn named(event: &str, data: Value) -> SseEvent {
        SseEvent::named(event, data.to_string())
    }

    #[test]
    fn test_system_lifting() {
        let body = json!({
            "model": "gpt-x",
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hi"}
            ]
        });
        let out = chat_to_messages_request("claude-opus-4-5", &body, false);

        assert_eq!(out["model"], "claude-opus-4-5");
        assert_eq!(out["system"], json!([{"type": "text", "text": "be terse"}]));
        assert_eq!(out["messages"].as_array().unwrap().len(), 1);
        assert_eq!(
            out["messages"][0],
            json!({"role": "user", "content": [{"type": "text", "text": "hi"}]})
        );
        assert!(out["max_tokens"].is_u64());
    }

    #[test]
    fn test_tool_call_translation_to_anthropic() {
        let body = json!({
            "model": "gpt-x",
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "content": Value::Null, "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "get_weather", "arguments": "{\"city\":\"London\"}"}
                }]},
                {"role": "tool", "tool_call_id": "call_1", "content": "Sunny"}
            ],
            "stop": "END",
            "tools": [{"type": "function", "function": {"name": "get_weather", "parameters": {"type": "object"}}}]
        });
        let out = chat_to_messages_request("claude", &body, false);

        let assistant = &out["messages"][1];
        assert_eq!(assistant["content"][0]["type"], "tool_use");
        assert_eq!(assistant["content"][0]["input"]["city"], "London");

        let tool_result = &out["messages"][2];
        assert_eq!(tool_result["role"], "user");
        assert_eq!(tool_result["content"][0]["type"], "tool_result");
        assert_eq!(tool_result["content"][0]["tool_use_id"], "call_1");

        assert_eq!(out["stop_sequences"], json!(["END"]));
        assert_eq!(out["tools"][0]["input_schema"]["type"], "object");
        assert!(out["tools"][0].get("function").is_none());
    }

    #[test]
    fn test_image_data_uri_to_base64_source() {
        let body = json!({
            "model": "m",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "look"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,aWtl"}},
                {"type": "image_url", "image_url": {"url": "https://x/y.png"}}
            ]}]
        });
        let out = chat_to_messages_request("m", &body, false);
        let blocks = out["messages"][0]["content"].as_array().unwrap();
        assert_eq!(blocks[1]["source"]["type"], "base64");
        assert_eq!(blocks[1]["source"]["media_type"], "image/png");
        assert_eq!(blocks[2]["source"]["type"], "url");
        assert_eq!(blocks[2]["source"]["url"], "https://x/y.png");
    }

    #[test]
    fn test_tool_choice_mapping() {
        let base = |tc: Value| {
            json!({"model": "m", "messages": [{"role": "user", "content": "x"}], "tool_choice": tc})
        };
        let auto = chat_to_messages_request("m", &base(json!("auto")), false);
        assert_eq!(auto["tool_choice"], json!({"type": "auto"}));

        let required = chat_to_messages_request("m", &base(json!("required")), false);
        assert_eq!(required["tool_choice"], json!({"type": "any"}));

        let none = chat_to_messages_request("m", &base(json!("none")), false);
        assert!(none.get("tool_choice").is_none());

        let specific = chat_to_messages_request(
            "m",
            &base(json!({"type": "function", "function": {"name": "f"}})),
            false,
        );
        assert_eq!(specific["tool_choice"], json!({"type": "tool", "name": "f"}));
    }

    #[test]
    fn test_text_only_round_trip() {
        let original = json!({
            "model": "gpt-x",
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hi"}
            ],
            "max_tokens": 512
        });
        let anthropic = chat_to_messages_request("claude", &original, false);
        let back = messages_to_chat_request("gpt-x", &anthropic, false);

        assert_eq!(back["model"], "gpt-x");
        assert_eq!(back["max_tokens"], 512);
        assert_eq!(
            back["messages"],
            json!([
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hi"}
            ])
        );
    }

    #[test]
    fn test_messages_to_chat_response_text() {
        let response = json!({
            "id": "msg_1", "type": "message", "role": "assistant",
            "content": [{"type": "text", "text": "hello there"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 4}
        });
        let out = messages_to_chat_response("gpt-x", &json!({}), &response);

        assert_eq!(out["object"], "chat.completion");
        assert_eq!(out["model"], "gpt-x");
        assert_eq!(out["choices"][0]["message"]["content"], "hello there");
        assert_eq!(out["choices"][0]["finish_reason"], "stop");
        assert_eq!(out["usage"]["total_tokens"], 14);
    }

    #[test]
    fn test_messages_to_chat_response_tool_use() {
        let response = json!({
            "content": [{"type": "tool_use", "id": "t1", "name": "f", "input": {"a": 1}}],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 1, "output_tokens": 1}
        });
        let out = messages_to_chat_response("m", &json!({}), &response);
        let msg = &out["choices"][0]["message"];
        assert!(msg["content"].is_null());
        assert_eq!(msg["tool_calls"][0]["function"]["name"], "f");
        assert_eq!(
            msg["tool_calls"][0]["function"]["arguments"],
            "{\"a\":1}"
        );
        assert_eq!(out["choices"][0]["finish_reason"], "tool_calls");
    }

    #[test]
    fn test_chat_to_messages_response() {
        let response = json!({
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hey"}, "finish_reason": "length"}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 9}
        });
        let out = chat_to_messages_response("claude", &json!({}), &response);
        assert_eq!(out["type"], "message");
        assert_eq!(out["content"][0]["text"], "hey");
        assert_eq!(out["stop_reason"], "max_tokens");
        assert_eq!(out["usage"]["output_tokens"], 9);
    }

    #[test]
    fn test_malformed_response_passes_through() {
        let bad = json!({"error": {"type": "overloaded_error"}});
        assert_eq!(messages_to_chat_response("m", &json!({}), &bad), bad);
    }

    #[test]
    fn test_stream_anthropic_to_openai_text() {
        let mut tr = MessagesToChatStream::new("gpt-x");

        let mut frames = Vec::new();
        frames.extend(tr.next(&named(
            "message_start",
            json!({"type": "message_start", "message": {"usage": {"input_tokens": 7}}}),
        )));
        frames.extend(tr.next(&named(
            "content_block_start",
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
        )));
        frames.extend(tr.next(&named(
            "content_block_delta",
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hel"}}),
        )));
        frames.extend(tr.next(&named(
            "content_block_delta",
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "lo"}}),
        )));
        frames.extend(tr.next(&named(
            "message_delta",
            json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 2}}),
        )));
        frames.extend(tr.next(&named("message_stop", json!({"type": "message_stop"}))));

        // role chunk, two text deltas, final chunk, [DONE]
        assert_eq!(frames.len(), 5);
        let first: Value = serde_json::from_str(&frames[0].data).unwrap();
        assert_eq!(first["choices"][0]["delta"]["role"], "assistant");

        let text: String = frames[1..3]
            .iter()
            .map(|f| {
                let v: Value = serde_json::from_str(&f.data).unwrap();
                v["choices"][0]["delta"]["content"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect();
        assert_eq!(text, "Hello");

        let last: Value = serde_json::from_str(&frames[3].data).unwrap();
        assert_eq!(last["choices"][0]["finish_reason"], "stop");
        assert_eq!(last["usage"]["prompt_tokens"], 7);
        assert_eq!(frames[4].data, "[DONE]");

        assert_eq!(
            tr.usage(),
            Some(UsageReport {
                input_tokens: 7,
                output_tokens: 2
            })
        );
        assert!(tr.finish().is_empty());
    }

    #[test]
    fn test_stream_anthropic_tool_use_to_openai() {
        let mut tr = MessagesToChatStream::new("m");
        tr.next(&named("message_start", json!({"type": "message_start", "message": {}})));

        let start = tr.next(&named(
            "content_block_start",
            json!({"type": "content_block_start", "index": 0,
                   "content_block": {"type": "tool_use", "id": "t1", "name": "f"}}),
        ));
        let v: Value = serde_json::from_str(&start[0].data).unwrap();
        let tc = &v["choices"][0]["delta"]["tool_calls"][0];
        assert_eq!(tc["index"], 0);
        assert_eq!(tc["id"], "t1");
        assert_eq!(tc["function"]["name"], "f");

        let delta = tr.next(&named(
            "content_block_delta",
            json!({"type": "content_block_delta", "index": 0,
                   "delta": {"type": "input_json_delta", "partial_json": "{\"a\":"}}),
        ));
        let v: Value = serde_json::from_str(&delta[0].data).unwrap();
        assert_eq!(
            v["choices"][0]["delta"]["tool_calls"][0]["function"]["arguments"],
            "{\"a\":"
        );
    }

    #[test]
    fn test_stream_truncated_upstream_still_terminates() {
        let mut tr = MessagesToChatStream::new("m");
        tr.next(&named("message_start", json!({"type": "message_start", "message": {}})));
        let frames = tr.finish();
        assert_eq!(frames.len(), 2);
        let last: Value = serde_json::from_str(&frames[0].data).unwrap();
        assert_eq!(last["choices"][0]["finish_reason"], "stop");
        assert_eq!(frames[1].data, "[DONE]");
    }

    #[test]
    fn test_stream_openai_to_anthropic_text() {
        let mut tr = ChatToMessagesStream::new("claude");

        let mut frames = Vec::new();
        frames.extend(tr.next(&sse(
            json!({"choices": [{"index": 0, "delta": {"role": "assistant", "content": "Hi"}}]}),
        )));
        frames.extend(tr.next(&sse(
            json!({"choices": [{"index": 0, "delta": {"content": " there"}}]}),
        )));
        frames.extend(tr.next(&sse(
            json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
                   "usage": {"prompt_tokens": 5, "completion_tokens": 2}}),
        )));
        frames.extend(tr.next(&SseEvent::data("[DONE]")));

        let events: Vec<&str> = frames.iter().filter_map(|f| f.event.as_deref()).collect();
        assert_eq!(
            events,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        let delta: Value = serde_json::from_str(&frames[5].data).unwrap();
        assert_eq!(delta["delta"]["stop_reason"], "end_turn");
        assert_eq!(delta["usage"]["output_tokens"], 2);
    }

    #[test]
    fn test_stream_openai_tool_calls_to_anthropic() {
        let mut tr = ChatToMessagesStream::new("claude");
        tr.next(&sse(json!({"choices": [{"index": 0, "delta": {"role": "assistant"}}]})));

        let frames = tr.next(&sse(json!({"choices": [{"index": 0, "delta": {"tool_calls": [
            {"index": 0, "id": "call_1", "type": "function",
             "function": {"name": "exec", "arguments": ""}}
        ]}}]})));
        let start: Value = serde_json::from_str(&frames[0].data).unwrap();
        assert_eq!(start["content_block"]["type"], "tool_use");
        assert_eq!(start["content_block"]["name"], "exec");

        let frames = tr.next(&sse(json!({"choices": [{"index": 0, "delta": {"tool_calls": [
            {"index": 0, "function": {"arguments": "{\"cmd\":\"ls\"}"}}
        ]}}]})));
        let delta: Value = serde_json::from_str(&frames[0].data).unwrap();
        assert_eq!(delta["delta"]["type"], "input_json_delta");
        assert_eq!(delta["delta"]["partial_json"], "{\"cmd\":\"ls\"}");
    }

    #[test]
    fn test_stream_empty_upstream_yields_synthetic_stop() {
        let mut tr = ChatToMessagesStream::new("claude");
        let frames = tr.finish();
        let events: Vec<&str> = frames.iter().filter_map(|f| f.event.as_deref()).collect();
        assert_eq!(events, vec!["message_start", "message_delta", "message_stop"]);
    }
}
