//! Upstream executors.
//!
//! Each provider implements the [`Executor`] trait: given a credential and a
//! payload already in the provider's dialect, perform the HTTP call and
//! return a full response or a chunk stream. The cross-provider wrapper in
//! [`cross`] sandwiches a native executor between two dialect translations.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use polygate_core::auth::Credential;
use polygate_core::dialect::Dialect;
use polygate_core::error::{GatewayError, Result};
use polygate_translate::{SseEvent, UsageReport};

pub mod anthropic;
pub mod cross;
pub mod gemini;
pub mod gemini_cli;
pub mod http;
pub mod openai;
pub mod sse;

/// Per-dispatch context threaded through every executor call.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// The client's wire dialect.
    pub dialect: Dialect,
    /// The model the client asked for (before alias resolution).
    pub model: String,
    pub stream: bool,
    pub request_id: String,
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(dialect: Dialect, model: impl Into<String>, stream: bool) -> Self {
        Self {
            dialect,
            model: model.into(),
            stream,
            request_id: String::new(),
            cancel: CancellationToken::new(),
        }
    }
}

/// A stream of client-facing SSE events. Cross-provider executors translate
/// before yielding, so items are always in the dialect the caller asked for.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<SseEvent>> + Send>>;

/// One provider's wire protocol.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Provider tag this executor serves, e.g. `anthropic`.
    fn identifier(&self) -> &str;

    /// Whether this executor can serve the given client dialect.
    fn serves(&self, dialect: Dialect) -> bool;

    /// Perform a non-streaming call. Non-2xx responses surface as
    /// [`GatewayError::Upstream`] with the body untouched.
    async fn execute(
        &self,
        ctx: &RequestContext,
        auth: &Credential,
        payload: Value,
    ) -> Result<Value>;

    /// Perform a streaming call. Chunks are delivered in upstream order;
    /// cancelling `ctx.cancel` closes the upstream connection.
    async fn execute_stream(
        &self,
        ctx: &RequestContext,
        auth: &Credential,
        payload: Value,
    ) -> Result<EventStream>;

    /// Best-effort token counting.
    async fn count_tokens(
        &self,
        ctx: &RequestContext,
        auth: &Credential,
        payload: Value,
    ) -> Result<Value>;

    /// Refresh near-expiry OAuth material. Identity for API-key credentials.
    async fn refresh(&self, _ctx: &RequestContext, _auth: &Credential) -> Result<()> {
        Ok(())
    }
}

/// Turn a non-success upstream response into the pass-through error,
/// capturing `Retry-After` for quota responses.
pub(crate) async fn upstream_error(response: reqwest::Response) -> GatewayError {
    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let body = response.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
    GatewayError::Upstream {
        status,
        body,
        content_type,
        retry_after,
    }
}

pub(crate) fn network_error(e: reqwest::Error) -> GatewayError {
    GatewayError::Network(e.to_string())
}

/// Parse the usage block of a non-streaming response in the given dialect.
pub fn parse_usage(dialect: Dialect, response: &Value) -> Option<UsageReport> {
    match dialect {
        Dialect::AnthropicMessages => {
            let usage = response.get("usage")?;
            Some(UsageReport {
                input_tokens: usage.get("input_tokens")?.as_u64().unwrap_or(0),
                output_tokens: usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
            })
        }
        Dialect::OpenaiChat => {
            let usage = response.get("usage")?;
            Some(UsageReport {
                input_tokens: usage.get("prompt_tokens")?.as_u64().unwrap_or(0),
                output_tokens: usage
                    .get("completion_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
            })
        }
        Dialect::OpenaiResponses => {
            let usage = response.get("usage")?;
            Some(UsageReport {
                input_tokens: usage.get("input_tokens")?.as_u64().unwrap_or(0),
                output_tokens: usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
            })
        }
        Dialect::GeminiV1beta => {
            let usage = response.get("usageMetadata")?;
            Some(UsageReport {
                input_tokens: usage.get("promptTokenCount")?.as_u64().unwrap_or(0),
                output_tokens: usage
                    .get("candidatesTokenCount")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
            })
        }
    }
}
