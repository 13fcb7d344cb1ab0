//! openai-responses ↔ anthropic-messages conversion.
//!
//! Requests map Responses `input` items onto Anthropic messages
//! (`function_call` → `tool_use`, `function_call_output` → `tool_result`,
//! `instructions` → top-level `system`). The streaming direction turns the
//! Anthropic event stream into the Responses event sequence
//! (`response.created` … `response.completed`) with a monotonic
//! `sequence_number` and accumulated text on every `done` event.

use serde_json::{Map, Value, json};

use crate::util::{gen_id, get_str, now_unix, parse_data_uri};
use crate::{SseEvent, StreamFrame, StreamTranslator, UsageReport};

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// openai-responses request → anthropic-messages request.
pub fn responses_to_messages_request(model: &str, body: &Value, stream: bool) -> Value {
    let mut system: Vec<Value> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();

    if let Some(instructions) = get_str(body, "instructions") {
        if !instructions.is_empty() {
            system.push(json!({"type": "text", "text": instructions}));
        }
    }

    match body.get("input") {
        Some(Value::String(text)) => {
            messages.push(json!({
                "role": "user",
                "content": [{"type": "text", "text": text}],
            }));
        }
        Some(Value::Array(items)) => {
            for item in items {
                convert_input_item(item, &mut system, &mut messages);
            }
        }
        _ => return body.clone(),
    }

    let mut out = Map::new();
    out.insert("model".into(), json!(model));
    out.insert("messages".into(), json!(messages));
    if !system.is_empty() {
        out.insert("system".into(), json!(system));
    }
    let max_tokens = body
        .get("max_output_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(4096);
    out.insert("max_tokens".into(), json!(max_tokens));
    for key in ["temperature", "top_p"] {
        if let Some(v) = body.get(key) {
            out.insert(key.into(), v.clone());
        }
    }
    if let Some(tools) = body.get("tools").and_then(Value::as_array) {
        // Responses tools are flat objects, not wrapped under "function".
        let converted: Vec<Value> = tools
            .iter()
            .filter(|t| get_str(t, "type").unwrap_or("function") == "function")
            .map(|t| {
                json!({
                    "name": get_str(t, "name").unwrap_or_default(),
                    "description": get_str(t, "description").unwrap_or_default(),
                    "input_schema": t.get("parameters").cloned()
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                })
            })
            .collect();
        if !converted.is_empty() {
            out.insert("tools".into(), json!(converted));
        }
    }
    match body.get("tool_choice") {
        Some(Value::String(mode)) => match mode.as_str() {
            "auto" => {
                out.insert("tool_choice".into(), json!({"type": "auto"}));
            }
            "required" => {
                out.insert("tool_choice".into(), json!({"type": "any"}));
            }
            _ => {}
        },
        Some(choice @ Value::Object(_)) => {
            if let Some(name) = get_str(choice, "name") {
                out.insert("tool_choice".into(), json!({"type": "tool", "name": name}));
            }
        }
        _ => {}
    }
    if stream {
        out.insert("stream".into(), json!(true));
    }

    Value::Object(out)
}

fn convert_input_item(item: &Value, system: &mut Vec<Value>, messages: &mut Vec<Value>) {
    let item_type = get_str(item, "type").unwrap_or("message");
    match item_type {
        "message" => {
            let role = get_str(item, "role").unwrap_or("user");
            let blocks = responses_content_to_blocks(item.get("content").unwrap_or(&Value::Null));
            if role == "system" || role == "developer" {
                for b in &blocks {
                    if get_str(b, "type") == Some("text") {
                        system.push(b.clone());
                    }
                }
            } else if !blocks.is_empty() {
                let role = if role == "assistant" { "assistant" } else { "user" };
                messages.push(json!({"role": role, "content": blocks}));
            }
        }
        "function_call" => {
            let input = get_str(item, "arguments")
                .and_then(|a| serde_json::from_str(a).ok())
                .unwrap_or_else(|| json!({}));
            messages.push(json!({
                "role": "assistant",
                "content": [{
                    "type": "tool_use",
                    "id": get_str(item, "call_id").or_else(|| get_str(item, "id")).unwrap_or_default(),
                    "name": get_str(item, "name").unwrap_or_default(),
                    "input": input,
                }]
            }));
        }
        "function_call_output" => {
            let output = match item.get("output") {
                Some(Value::String(s)) => s.clone(),
                Some(v) => v.to_string(),
                None => String::new(),
            };
            messages.push(json!({
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": get_str(item, "call_id").unwrap_or_default(),
                    "content": output,
                }]
            }));
        }
        _ => {}
    }
}

fn responses_content_to_blocks(content: &Value) -> Vec<Value> {
    match content {
        Value::String(s) if !s.is_empty() => vec![json!({"type": "text", "text": s})],
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| match get_str(part, "type") {
                Some("input_text") | Some("output_text") | Some("text") => {
                    Some(json!({"type": "text", "text": get_str(part, "text")?}))
                }
                Some("input_image") => {
                    let url = get_str(part, "image_url")?;
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
// Responses envelope
// ---------------------------------------------------------------------------

/// The canonical Responses metadata envelope. Clients close the connection
/// when `response.created` arrives without the full field set, so every
/// field is always present.
fn response_envelope(id: &str, model: &str, status: &str, output: Value, usage: Value) -> Value {
    json!({
        "id": id,
        "object": "response",
        "created_at": now_unix(),
        "status": status,
        "error": Value::Null,
        "incomplete_details": Value::Null,
        "instructions": Value::Null,
        "max_output_tokens": Value::Null,
        "model": model,
        "output": output,
        "parallel_tool_calls": true,
        "previous_response_id": Value::Null,
        "reasoning": {"effort": Value::Null, "summary": Value::Null},
        "store": false,
        "temperature": Value::Null,
        "text": {"format": {"type": "text"}},
        "tool_choice": "auto",
        "tools": [],
        "top_p": Value::Null,
        "truncation": "disabled",
        "usage": usage,
        "user": Value::Null,
        "metadata": {},
    })
}

/// anthropic-messages response → openai-responses response.
pub fn messages_to_responses_response(model: &str, _request: &Value, response: &Value) -> Value {
    let Some(content) = response.get("content").and_then(Value::as_array) else {
        return response.clone();
    };

    let mut output: Vec<Value> = Vec::new();
    for block in content {
        match get_str(block, "type") {
            Some("text") => {
                output.push(json!({
                    "type": "message",
                    "id": gen_id("msg_"),
                    "status": "completed",
                    "role": "assistant",
                    "content": [{
                        "type": "output_text",
                        "text": get_str(block, "text").unwrap_or_default(),
                        "annotations": [],
                    }],
                }));
            }
            Some("tool_use") => {
                let input = block.get("input").cloned().unwrap_or_else(|| json!({}));
                output.push(json!({
                    "type": "function_call",
                    "id": gen_id("fc_"),
                    "call_id": get_str(block, "id").unwrap_or_default(),
                    "name": get_str(block, "name").unwrap_or_default(),
                    "arguments": input.to_string(),
                    "status": "completed",
                }));
            }
            _ => {}
        }
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

    response_envelope(
        &gen_id("resp_"),
        model,
        "completed",
        json!(output),
        json!({
            "input_tokens": input_tokens,
            "output_tokens": output_tokens,
            "total_tokens": input_tokens + output_tokens,
        }),
    )
}

// ---------------------------------------------------------------------------
// Streaming: anthropic events → responses events
// ---------------------------------------------------------------------------

enum ItemKind {
    Message,
    FunctionCall { name: String, call_id: String },
}

struct ItemState {
    item_id: String,
    output_index: usize,
    kind: ItemKind,
    accumulated: String,
}

/// Translates an Anthropic Messages SSE stream into Responses API events.
///
/// Every emitted event carries a `sequence_number` that starts at 0 and
/// increases by one per event; `output_index` equals the Anthropic block
/// index; `done` events carry the accumulated content, never an empty string.
pub struct MessagesToResponsesStream {
    response_id: String,
    model: String,
    sequence: u64,
    items: Vec<ItemState>,
    completed_output: Vec<Value>,
    usage: UsageReport,
    saw_usage: bool,
    started: bool,
    done: bool,
}

impl MessagesToResponsesStream {
    pub fn new(model: &str) -> Self {
        Self {
            response_id: gen_id("resp_"),
            model: model.to_string(),
            sequence: 0,
            items: Vec::new(),
            completed_output: Vec::new(),
            usage: UsageReport::default(),
            saw_usage: false,
            started: false,
            done: false,
        }
    }

    fn emit(&mut self, event_type: &str, payload: Value) -> StreamFrame {
        let mut map = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        map.insert("type".into(), json!(event_type));
        map.insert("sequence_number".into(), json!(self.sequence));
        self.sequence += 1;
        StreamFrame::named_json(event_type, &Value::Object(map))
    }

    fn item_pos(&self, output_index: usize) -> Option<usize> {
        self.items.iter().position(|i| i.output_index == output_index)
    }

    fn start_frames(&mut self) -> Vec<StreamFrame> {
        self.started = true;
        let envelope = response_envelope(
            &self.response_id,
            &self.model,
            "in_progress",
            json!([]),
            Value::Null,
        );
        vec![
            self.emit("response.created", json!({"response": envelope.clone()})),
            self.emit("response.in_progress", json!({"response": envelope})),
        ]
    }

    fn completed_frame(&mut self) -> StreamFrame {
        self.done = true;
        let usage = if self.saw_usage {
            json!({
                "input_tokens": self.usage.input_tokens,
                "output_tokens": self.usage.output_tokens,
                "total_tokens": self.usage.input_tokens + self.usage.output_tokens,
            })
        } else {
            Value::Null
        };
        let envelope = response_envelope(
            &self.response_id,
            &self.model,
            "completed",
            json!(self.completed_output),
            usage,
        );
        self.emit("response.completed", json!({"response": envelope}))
    }
}

impl StreamTranslator for MessagesToResponsesStream {
    fn next(&mut self, event: &SseEvent) -> Vec<StreamFrame> {
        let Ok(data) = serde_json::from_str::<Value>(&event.data) else {
            return vec![StreamFrame::data(event.data.clone())];
        };
        let event_type = event
            .event
            .as_deref()
            .or_else(|| get_str(&data, "type"))
            .unwrap_or_default()
            .to_string();

        let mut frames = Vec::new();
        if !self.started && event_type != "ping" {
            frames.extend(self.start_frames());
        }

        match event_type.as_str() {
            "message_start" => {
                if let Some(u) = data.get("message").and_then(|m| m.get("usage")) {
                    self.usage.input_tokens =
                        u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
                    self.saw_usage = true;
                }
            }
            "content_block_start" => {
                let output_index =
                    data.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                let block = data.get("content_block").cloned().unwrap_or_default();
                if get_str(&block, "type") == Some("tool_use") {
                    let name = get_str(&block, "name").unwrap_or_default().to_string();
                    let call_id = get_str(&block, "id").unwrap_or_default().to_string();
                    let item_id = gen_id("fc_");
                    let added = json!({
                        "output_index": output_index,
                        "item": {
                            "type": "function_call",
                            "id": item_id,
                            "call_id": call_id,
                            "name": name,
                            "arguments": "",
                            "status": "in_progress",
                        },
                    });
                    frames.push(self.emit("response.output_item.added", added));
                    self.items.push(ItemState {
                        item_id,
                        output_index,
                        kind: ItemKind::FunctionCall { name, call_id },
                        accumulated: String::new(),
                    });
                } else {
                    let item_id = gen_id("msg_");
                    let added = json!({
                        "output_index": output_index,
                        "item": {
                            "type": "message",
                            "id": item_id,
                            "status": "in_progress",
                            "role": "assistant",
                            "content": [],
                        },
                    });
                    frames.push(self.emit("response.output_item.added", added));
                    let part = json!({
                        "item_id": item_id,
                        "output_index": output_index,
                        "content_index": 0,
                        "part": {"type": "output_text", "text": "", "annotations": []},
                    });
                    frames.push(self.emit("response.content_part.added", part));
                    self.items.push(ItemState {
                        item_id,
                        output_index,
                        kind: ItemKind::Message,
                        accumulated: String::new(),
                    });
                }
            }
            "content_block_delta" => {
                let output_index =
                    data.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                let delta = data.get("delta").cloned().unwrap_or_default();
                let Some(pos) = self.item_pos(output_index) else {
                    return frames;
                };
                match get_str(&delta, "type") {
                    Some("text_delta") => {
                        let text = get_str(&delta, "text").unwrap_or_default().to_string();
                        self.items[pos].accumulated.push_str(&text);
                        let item_id = self.items[pos].item_id.clone();
                        frames.push(self.emit(
                            "response.output_text.delta",
                            json!({
                                "item_id": item_id,
                                "output_index": output_index,
                                "content_index": 0,
                                "delta": text,
                            }),
                        ));
                    }
                    Some("input_json_delta") => {
                        let partial =
                            get_str(&delta, "partial_json").unwrap_or_default().to_string();
                        self.items[pos].accumulated.push_str(&partial);
                        let item_id = self.items[pos].item_id.clone();
                        frames.push(self.emit(
                            "response.function_call_arguments.delta",
                            json!({
                                "item_id": item_id,
                                "output_index": output_index,
                                "delta": partial,
                            }),
                        ));
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                let output_index =
                    data.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                let Some(pos) = self.item_pos(output_index) else {
                    return frames;
                };
                let item_id = self.items[pos].item_id.clone();
                let accumulated = self.items[pos].accumulated.clone();
                match &self.items[pos].kind {
                    ItemKind::Message => {
                        frames.push(self.emit(
                            "response.output_text.done",
                            json!({
                                "item_id": item_id,
                                "output_index": output_index,
                                "content_index": 0,
                                "text": accumulated,
                            }),
                        ));
                        frames.push(self.emit(
                            "response.content_part.done",
                            json!({
                                "item_id": item_id,
                                "output_index": output_index,
                                "content_index": 0,
                                "part": {"type": "output_text", "text": accumulated, "annotations": []},
                            }),
                        ));
                        let item = json!({
                            "type": "message",
                            "id": item_id,
                            "status": "completed",
                            "role": "assistant",
                            "content": [{"type": "output_text", "text": accumulated, "annotations": []}],
                        });
                        frames.push(self.emit(
                            "response.output_item.done",
                            json!({"output_index": output_index, "item": item.clone()}),
                        ));
                        self.completed_output.push(item);
                    }
                    ItemKind::FunctionCall { name, call_id } => {
                        let name = name.clone();
                        let call_id = call_id.clone();
                        frames.push(self.emit(
                            "response.function_call_arguments.done",
                            json!({
                                "item_id": item_id,
                                "output_index": output_index,
                                "name": name,
                                "arguments": accumulated,
                            }),
                        ));
                        let item = json!({
                            "type": "function_call",
                            "id": item_id,
                            "call_id": call_id,
                            "name": name,
                            "arguments": accumulated,
                            "status": "completed",
                        });
                        frames.push(self.emit(
                            "response.output_item.done",
                            json!({"output_index": output_index, "item": item.clone()}),
                        ));
                        self.completed_output.push(item);
                    }
                }
            }
            "message_delta" => {
                if let Some(u) = data.get("usage") {
                    self.usage.output_tokens =
                        u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0);
                    self.saw_usage = true;
                }
            }
            "message_stop" => {
                frames.push(self.completed_frame());
            }
            _ => {}
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
        frames.push(self.completed_frame());
        frames
    }

    fn usage(&self) -> Option<UsageReport> {
        self.saw_usage.then_some(self.usage)
    }
}
