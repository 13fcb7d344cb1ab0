//! Dialect translation.
//!
//! A [`TranslatorRegistry`] holds, for each supported `(client, provider)`
//! dialect pair, three converters: a request transform, a non-streaming
//! response transform, and a streaming translator factory. The registry is
//! built once at boot and is read-only afterwards.
//!
//! Converters are pure functions of their inputs. Streaming translators carry
//! per-call state (sequence numbers, accumulated text per block, tool-call id
//! maps) inside the boxed object returned by [`TranslatorRegistry::open_stream`];
//! one object serves exactly one stream.
//!
//! Malformed input never fails a converter: request transforms return their
//! input unchanged and stream translators pass unparseable chunks through
//! verbatim, per the gateway's pass-through error policy.

use std::collections::HashMap;

use serde_json::Value;

pub use polygate_core::dialect::Dialect;

pub mod gemini_cli;
pub mod openai_anthropic;
pub mod openai_gemini;
pub mod responses_anthropic;
pub mod sanitize;
mod util;

/// A parsed upstream SSE event handed to a [`StreamTranslator`].
#[derive(Debug, Clone, Default)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }
}

/// One client-dialect SSE frame produced by a [`StreamTranslator`].
///
/// The dispatcher writes `event:`/`data:` lines from this; translators never
/// do their own wire framing. OpenAI's `[DONE]` terminator is an ordinary
/// frame with that literal data.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFrame {
    pub event: Option<String>,
    pub data: String,
}

impl StreamFrame {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }

    pub fn json(value: &Value) -> Self {
        Self::data(value.to_string())
    }

    pub fn named_json(event: impl Into<String>, value: &Value) -> Self {
        Self::named(event, value.to_string())
    }
}

/// Per-stream translation state. Created at stream open, dropped at close,
/// never shared between concurrent streams.
pub trait StreamTranslator: Send {
    /// Translate one upstream event into zero or more client-dialect frames.
    fn next(&mut self, event: &SseEvent) -> Vec<StreamFrame>;

    /// Flush trailing frames at upstream EOF (synthetic terminal events,
    /// `[DONE]`, an end-of-stream usage report when none was seen).
    fn finish(&mut self) -> Vec<StreamFrame>;

    /// Usage totals observed on this stream, if any.
    fn usage(&self) -> Option<UsageReport> {
        None
    }
}

/// Token accounting parsed out of upstream payloads. Emitted at most once
/// per request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageReport {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

type RequestFn = fn(model: &str, body: &Value, stream: bool) -> Value;
type ResponseFn = fn(model: &str, request: &Value, response: &Value) -> Value;
type StreamFn = fn(model: &str) -> Box<dyn StreamTranslator>;

/// Converters for one `(client, provider)` dialect pair.
struct Converter {
    request: RequestFn,
    response: ResponseFn,
    stream: StreamFn,
}

/// Registry keyed by `(client_dialect, provider_dialect)`.
pub struct TranslatorRegistry {
    converters: HashMap<(Dialect, Dialect), Converter>,
}

impl TranslatorRegistry {
    pub fn new() -> Self {
        let mut converters = HashMap::new();

        converters.insert(
            (Dialect::OpenaiChat, Dialect::AnthropicMessages),
            Converter {
                request: openai_anthropic::chat_to_messages_request,
                response: openai_anthropic::messages_to_chat_response,
                stream: |model| Box::new(openai_anthropic::MessagesToChatStream::new(model)),
            },
        );

        converters.insert(
            (Dialect::AnthropicMessages, Dialect::OpenaiChat),
            Converter {
                request: openai_anthropic::messages_to_chat_request,
                response: openai_anthropic::chat_to_messages_response,
                stream: |model| Box::new(openai_anthropic::ChatToMessagesStream::new(model)),
            },
        );

        converters.insert(
            (Dialect::OpenaiResponses, Dialect::AnthropicMessages),
            Converter {
                request: responses_anthropic::responses_to_messages_request,
                response: responses_anthropic::messages_to_responses_response,
                stream: |model| {
                    Box::new(responses_anthropic::MessagesToResponsesStream::new(model))
                },
            },
        );

        converters.insert(
            (Dialect::OpenaiChat, Dialect::GeminiV1beta),
            Converter {
                request: openai_gemini::chat_to_gemini_request,
                response: openai_gemini::gemini_to_chat_response,
                stream: |model| Box::new(openai_gemini::GeminiToChatStream::new(model)),
            },
        );

        Self { converters }
    }

    /// Whether a converter exists for this `(client, provider)` pair.
    /// Same-dialect pairs are always supported (identity).
    pub fn supports(&self, client: Dialect, provider: Dialect) -> bool {
        client == provider || self.converters.contains_key(&(client, provider))
    }

    /// Transform a client-dialect request body into the provider dialect.
    /// The `model` field of the output is always set to `model`. Unknown or
    /// malformed input comes back unchanged apart from the model override.
    pub fn request(
        &self,
        client: Dialect,
        provider: Dialect,
        model: &str,
        body: &Value,
        stream: bool,
    ) -> Value {
        if client == provider {
            let mut out = body.clone();
            if let Some(map) = out.as_object_mut() {
                map.insert("model".into(), Value::String(model.to_string()));
            }
            return out;
        }
        match self.converters.get(&(client, provider)) {
            Some(c) => (c.request)(model, body, stream),
            None => body.clone(),
        }
    }

    /// Transform a provider-dialect non-streaming response back into the
    /// client dialect. `request` is the original client request, available to
    /// converters that need echo fields.
    pub fn response(
        &self,
        client: Dialect,
        provider: Dialect,
        model: &str,
        request: &Value,
        response: &Value,
    ) -> Value {
        if client == provider {
            return response.clone();
        }
        match self.converters.get(&(client, provider)) {
            Some(c) => (c.response)(model, request, response),
            None => response.clone(),
        }
    }

    /// Open a per-stream translator for this pair. Returns `None` for
    /// same-dialect pairs (the dispatcher proxies frames untranslated) and
    /// unsupported pairs.
    pub fn open_stream(
        &self,
        client: Dialect,
        provider: Dialect,
        model: &str,
    ) -> Option<Box<dyn StreamTranslator>> {
        self.converters
            .get(&(client, provider))
            .map(|c| (c.stream)(model))
    }
}

impl Default for TranslatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
