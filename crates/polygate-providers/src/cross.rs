//! Cross-provider executor.
//!
//! Makes a credential that natively speaks dialect X serve a client dialect
//! Y by sandwiching a native executor between two translations. Also used
//! when X == Y (an Anthropic client on an Azure Claude credential): the
//! translation is then the identity, but alias resolution, system-lifting,
//! and tool-name sanitization still apply.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_stream::StreamExt;

use polygate_core::auth::{Credential, attr};
use polygate_core::dialect::Dialect;
use polygate_core::error::{GatewayError, Result};
use polygate_translate::sanitize::{restore_tool_names, sanitize_payload_tool_names};
use polygate_translate::{SseEvent, StreamTranslator, TranslatorRegistry};

use crate::{EventStream, Executor, RequestContext};

pub struct CrossProviderExecutor {
    inner: Arc<dyn Executor>,
    target: Dialect,
    translators: Arc<TranslatorRegistry>,
}

impl CrossProviderExecutor {
    pub fn new(inner: Arc<dyn Executor>, target: Dialect, translators: Arc<TranslatorRegistry>) -> Self {
        Self {
            inner,
            target,
            translators,
        }
    }

    pub fn target(&self) -> Dialect {
        self.target
    }

    fn check_credential(&self, auth: &Credential) -> Result<()> {
        if !auth.is_cross_provider() {
            return Ok(());
        }
        for key in [attr::API_KEY, attr::BASE_URL] {
            if auth.attr(key).is_none_or(str::is_empty) {
                return Err(GatewayError::Unauthenticated(format!(
                    "cross-provider credential {} is missing {key}",
                    auth.id
                )));
            }
        }
        Ok(())
    }

    /// Translate the client payload into the target dialect and apply the
    /// upstream quirk fixups.
    fn build_target_payload(
        &self,
        ctx: &RequestContext,
        auth: &Credential,
        client_payload: &Value,
    ) -> (Value, std::collections::BTreeMap<String, String>) {
        let upstream_model = auth.resolve_upstream_model(&ctx.model);
        let mut payload = self.translators.request(
            ctx.dialect,
            self.target,
            &upstream_model,
            client_payload,
            ctx.stream,
        );
        if self.target == Dialect::AnthropicMessages {
            lift_system_messages(&mut payload);
        }
        let renames = sanitize_payload_tool_names(&mut payload);
        (payload, renames)
    }

    fn target_ctx(&self, ctx: &RequestContext) -> RequestContext {
        RequestContext {
            dialect: self.target,
            ..ctx.clone()
        }
    }
}

/// Anthropic rejects `system` inside the message array; collect stray system
/// messages into the top-level `system` block array.
fn lift_system_messages(payload: &mut Value) {
    let Some(messages) = payload.get_mut("messages").and_then(Value::as_array_mut) else {
        return;
    };

    let mut lifted: Vec<Value> = Vec::new();
    messages.retain(|msg| {
        if msg.get("role").and_then(Value::as_str) != Some("system") {
            return true;
        }
        match msg.get("content") {
            Some(Value::String(text)) => {
                lifted.push(serde_json::json!({"type": "text", "text": text}));
            }
            Some(Value::Array(blocks)) => {
                lifted.extend(
                    blocks
                        .iter()
                        .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                        .cloned(),
                );
            }
            _ => {}
        }
        false
    });

    if lifted.is_empty() {
        return;
    }
    let map = match payload.as_object_mut() {
        Some(map) => map,
        None => return,
    };
    match map.get_mut("system") {
        Some(Value::Array(existing)) => existing.extend(lifted),
        Some(Value::String(s)) => {
            let mut blocks = vec![serde_json::json!({"type": "text", "text": s})];
            blocks.extend(lifted);
            map.insert("system".into(), Value::Array(blocks));
        }
        _ => {
            map.insert("system".into(), Value::Array(lifted));
        }
    }
}

#[async_trait]
impl Executor for CrossProviderExecutor {
    fn identifier(&self) -> &str {
        "cross-provider"
    }

    fn serves(&self, dialect: Dialect) -> bool {
        self.translators.supports(dialect, self.target)
    }

    async fn execute(
        &self,
        ctx: &RequestContext,
        auth: &Credential,
        payload: Value,
    ) -> Result<Value> {
        self.check_credential(auth)?;
        let (target_payload, renames) = self.build_target_payload(ctx, auth, &payload);
        let target_ctx = self.target_ctx(ctx);

        // Upstream errors pass through untranslated.
        let mut response = self.inner.execute(&target_ctx, auth, target_payload).await?;

        restore_tool_names(&mut response, &renames);
        Ok(self
            .translators
            .response(ctx.dialect, self.target, &ctx.model, &payload, &response))
    }

    async fn execute_stream(
        &self,
        ctx: &RequestContext,
        auth: &Credential,
        payload: Value,
    ) -> Result<EventStream> {
        self.check_credential(auth)?;
        let (target_payload, renames) = self.build_target_payload(ctx, auth, &payload);
        let target_ctx = self.target_ctx(ctx);

        let upstream = self
            .inner
            .execute_stream(&target_ctx, auth, target_payload)
            .await?;
        let translator = self
            .translators
            .open_stream(ctx.dialect, self.target, &ctx.model);

        Ok(Box::pin(futures::stream::unfold(
            TranslateState {
                upstream,
                translator,
                renames,
                queue: std::collections::VecDeque::new(),
                finished: false,
            },
            |mut state| async move {
                loop {
                    if let Some(event) = state.queue.pop_front() {
                        return Some((Ok(event), state));
                    }
                    if state.finished {
                        return None;
                    }
                    match state.upstream.next().await {
                        Some(Ok(event)) => {
                            let frames: Vec<(Option<String>, String)> =
                                match &mut state.translator {
                                    Some(tr) => tr
                                        .next(&event)
                                        .into_iter()
                                        .map(|f| (f.event, f.data))
                                        .collect(),
                                    // Identity pair: proxy the event,
                                    // restoring names.
                                    None => vec![(event.event, event.data)],
                                };
                            for (name, data) in frames {
                                state.push(name, data);
                            }
                        }
                        Some(Err(e)) => return Some((Err(e), state)),
                        None => {
                            state.finished = true;
                            let frames: Vec<(Option<String>, String)> =
                                match &mut state.translator {
                                    Some(tr) => tr
                                        .finish()
                                        .into_iter()
                                        .map(|f| (f.event, f.data))
                                        .collect(),
                                    None => Vec::new(),
                                };
                            for (name, data) in frames {
                                state.push(name, data);
                            }
                        }
                    }
                }
            },
        )))
    }

    async fn count_tokens(
        &self,
        ctx: &RequestContext,
        auth: &Credential,
        payload: Value,
    ) -> Result<Value> {
        self.check_credential(auth)?;
        let (target_payload, _) = self.build_target_payload(ctx, auth, &payload);
        let target_ctx = self.target_ctx(ctx);
        self.inner.count_tokens(&target_ctx, auth, target_payload).await
    }

    async fn refresh(&self, ctx: &RequestContext, auth: &Credential) -> Result<()> {
        self.inner.refresh(ctx, auth).await
    }
}

struct TranslateState {
    upstream: EventStream,
    translator: Option<Box<dyn StreamTranslator>>,
    renames: std::collections::BTreeMap<String, String>,
    queue: std::collections::VecDeque<SseEvent>,
    finished: bool,
}

impl TranslateState {
    fn push(&mut self, event: Option<String>, mut data: String) {
        if !self.renames.is_empty() {
            if let Ok(mut value) = serde_json::from_str::<Value>(&data) {
                restore_tool_names(&mut value, &self.renames);
                data = value.to_string();
            }
        }
        self.queue.push_back(SseEvent { event, data });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Records the payload it was given and replies with a canned response.
    struct MockExecutor {
        seen: Mutex<Option<Value>>,
        reply: Value,
        events: Vec<SseEvent>,
    }

    impl MockExecutor {
        fn new(reply: Value) -> Self {
            Self {
                seen: Mutex::new(None),
                reply,
                events: Vec::new(),
            }
        }

        fn with_events(events: Vec<SseEvent>) -> Self {
            Self {
                seen: Mutex::new(None),
                reply: Value::Null,
                events,
            }
        }
    }

    #[async_trait]
    impl Executor for MockExecutor {
        fn identifier(&self) -> &str {
            "mock"
        }

        fn serves(&self, _dialect: Dialect) -> bool {
            true
        }

        async fn execute(
            &self,
            _ctx: &RequestContext,
            _auth: &Credential,
            payload: Value,
        ) -> Result<Value> {
            *self.seen.lock().unwrap() = Some(payload);
            Ok(self.reply.clone())
        }

        async fn execute_stream(
            &self,
            _ctx: &RequestContext,
            _auth: &Credential,
            payload: Value,
        ) -> Result<EventStream> {
            *self.seen.lock().unwrap() = Some(payload);
            Ok(Box::pin(futures::stream::iter(
                self.events.clone().into_iter().map(Ok),
            )))
        }

        async fn count_tokens(
            &self,
            _ctx: &RequestContext,
            _auth: &Credential,
            _payload: Value,
        ) -> Result<Value> {
            Ok(json!({"input_tokens": 1}))
        }
    }

    fn azure_credential() -> Credential {
        let mut cred = Credential::new("c1".into(), "cross-provider:claude", "azure");
        cred.set_attr("api_key", "azure-key");
        cred.set_attr("base_url", "https://foundry.example.com");
        cred.set_attr("provider_type", "claude");
        cred.set_attr("model_alias", "gpt-5");
        cred.set_attr("model_name", "claude-opus-4-5");
        cred
    }

    #[test]
    fn test_missing_key_material_is_unauthenticated() {
        let inner = Arc::new(MockExecutor::new(Value::Null));
        let ex = CrossProviderExecutor::new(
            inner,
            Dialect::AnthropicMessages,
            Arc::new(TranslatorRegistry::new()),
        );
        let mut cred = azure_credential();
        cred.attributes.remove("base_url");
        assert!(matches!(
            ex.check_credential(&cred),
            Err(GatewayError::Unauthenticated(_))
        ));
    }

    #[test]
    fn test_lift_system_messages() {
        let mut payload = json!({
            "system": [{"type": "text", "text": "first"}],
            "messages": [
                {"role": "system", "content": "second"},
                {"role": "user", "content": [{"type": "text", "text": "hi"}]}
            ]
        });
        lift_system_messages(&mut payload);
        assert_eq!(payload["messages"].as_array().unwrap().len(), 1);
        assert_eq!(
            payload["system"],
            json!([
                {"type": "text", "text": "first"},
                {"type": "text", "text": "second"}
            ])
        );
    }

    #[tokio::test]
    async fn test_openai_client_on_anthropic_target() {
        let reply = json!({
            "content": [{"type": "text", "text": "hey"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 2, "output_tokens": 1}
        });
        let inner = Arc::new(MockExecutor::new(reply));
        let ex = CrossProviderExecutor::new(
            inner.clone(),
            Dialect::AnthropicMessages,
            Arc::new(TranslatorRegistry::new()),
        );
        let ctx = RequestContext::new(Dialect::OpenaiChat, "gpt-5", false);
        let payload = json!({
            "model": "gpt-5",
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hi"}
            ]
        });

        let out = ex.execute(&ctx, &azure_credential(), payload).await.unwrap();

        // inner saw a translated anthropic payload with the aliased model
        let seen = inner.seen.lock().unwrap().clone().unwrap();
        assert_eq!(seen["model"], "claude-opus-4-5");
        assert_eq!(seen["system"], json!([{"type": "text", "text": "be terse"}]));
        assert_eq!(
            seen["messages"],
            json!([{"role": "user", "content": [{"type": "text", "text": "hi"}]}])
        );

        // client got an openai-chat response echoing the requested model
        assert_eq!(out["object"], "chat.completion");
        assert_eq!(out["model"], "gpt-5");
        assert_eq!(out["choices"][0]["message"]["content"], "hey");
        assert_eq!(out["choices"][0]["finish_reason"], "stop");
    }

    #[tokio::test]
    async fn test_tool_name_sanitize_and_restore() {
        let reply = json!({
            "content": [{"type": "tool_use", "id": "t1", "name": "search_web", "input": {"q": "x"}}],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 1, "output_tokens": 1}
        });
        let inner = Arc::new(MockExecutor::new(reply));
        let ex = CrossProviderExecutor::new(
            inner.clone(),
            Dialect::AnthropicMessages,
            Arc::new(TranslatorRegistry::new()),
        );
        // Anthropic client on an Azure Claude credential: identity dialect pair
        let ctx = RequestContext::new(Dialect::AnthropicMessages, "gpt-5", false);
        let payload = json!({
            "model": "gpt-5",
            "max_tokens": 100,
            "messages": [{"role": "user", "content": "search please"}],
            "tools": [{"name": "search:web", "input_schema": {"type": "object"}}]
        });

        let out = ex.execute(&ctx, &azure_credential(), payload).await.unwrap();

        let seen = inner.seen.lock().unwrap().clone().unwrap();
        assert_eq!(seen["tools"][0]["name"], "search_web");
        // client sees the original name restored
        assert_eq!(out["content"][0]["name"], "search:web");
    }

    #[tokio::test]
    async fn test_streaming_translation_responses_dialect() {
        let events = vec![
            SseEvent::named(
                "message_start",
                json!({"type": "message_start", "message": {"usage": {"input_tokens": 1}}}).to_string(),
            ),
            SseEvent::named(
                "content_block_start",
                json!({"type": "content_block_start", "index": 0,
                       "content_block": {"type": "text", "text": ""}}).to_string(),
            ),
            SseEvent::named(
                "content_block_delta",
                json!({"type": "content_block_delta", "index": 0,
                       "delta": {"type": "text_delta", "text": "hi"}}).to_string(),
            ),
            SseEvent::named(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": 0}).to_string(),
            ),
            SseEvent::named("message_stop", json!({"type": "message_stop"}).to_string()),
        ];
        let inner = Arc::new(MockExecutor::with_events(events));
        let ex = CrossProviderExecutor::new(
            inner,
            Dialect::AnthropicMessages,
            Arc::new(TranslatorRegistry::new()),
        );
        let ctx = RequestContext::new(Dialect::OpenaiResponses, "gpt-5", true);
        let payload = json!({"model": "gpt-5", "input": "hello", "stream": true});

        let stream = ex
            .execute_stream(&ctx, &azure_credential(), payload)
            .await
            .unwrap();
        let events: Vec<SseEvent> = stream.map(|e| e.unwrap()).collect().await;
        let names: Vec<&str> = events.iter().filter_map(|e| e.event.as_deref()).collect();
        assert_eq!(
            names,
            vec![
                "response.created",
                "response.in_progress",
                "response.output_item.added",
                "response.content_part.added",
                "response.output_text.delta",
                "response.output_text.done",
                "response.content_part.done",
                "response.output_item.done",
                "response.completed",
            ]
        );
    }
}
