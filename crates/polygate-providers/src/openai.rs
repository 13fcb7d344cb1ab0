//! OpenAI-compatible executor.
//!
//! Serves both the Chat Completions and Responses dialects, and doubles as
//! the executor for every `openai-compatibility` endpoint (OpenRouter and
//! friends) since those speak the same wire protocol with a different base
//! URL.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use polygate_core::auth::{Credential, attr};
use polygate_core::dialect::Dialect;
use polygate_core::error::{GatewayError, Result};

use crate::http::ClientPool;
use crate::sse::{STREAM_IDLE_TIMEOUT, guarded, parse_sse_stream};
use crate::{EventStream, Executor, RequestContext, network_error, upstream_error};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAiExecutor {
    pool: Arc<ClientPool>,
    identifier: String,
}

impl OpenAiExecutor {
    pub fn new(pool: Arc<ClientPool>) -> Self {
        Self {
            pool,
            identifier: "openai".into(),
        }
    }

    /// Executor for a named `openai-compatibility` endpoint.
    pub fn compat(pool: Arc<ClientPool>, name: &str) -> Self {
        Self {
            pool,
            identifier: format!("openai-compat:{name}"),
        }
    }

    fn base_url(auth: &Credential) -> &str {
        auth.attr(attr::BASE_URL)
            .filter(|u| !u.is_empty())
            .unwrap_or(DEFAULT_BASE_URL)
    }

    fn endpoint(dialect: Dialect) -> &'static str {
        match dialect {
            Dialect::OpenaiResponses => "/v1/responses",
            _ => "/v1/chat/completions",
        }
    }

    pub fn prepare(&self, auth: &Credential, path: &str) -> Result<reqwest::RequestBuilder> {
        let api_key = auth
            .attr(attr::API_KEY)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                GatewayError::Unauthenticated(format!("credential {} has no api_key", auth.id))
            })?;

        let base = Self::base_url(auth).trim_end_matches('/');
        // Compat base URLs often already carry /v1
        let path = if base.ends_with("/v1") {
            path.trim_start_matches("/v1")
        } else {
            path
        };
        let url = format!("{base}{path}");
        let client = self.pool.client(auth.proxy_url.as_deref())?;
        let mut req = client
            .post(url)
            .header("authorization", format!("Bearer {api_key}"))
            .header("content-type", "application/json");
        for (name, value) in auth.header_attributes() {
            req = req.header(name, value);
        }
        Ok(req)
    }

    async fn send(
        &self,
        ctx: &RequestContext,
        auth: &Credential,
        path: &str,
        payload: &Value,
    ) -> Result<reqwest::Response> {
        let req = self.prepare(auth, path)?.json(payload);
        debug!(credential = %auth.id, path, "openai upstream call");
        let response = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(GatewayError::ClientCancelled),
            r = req.send() => r.map_err(network_error)?,
        };
        if !response.status().is_success() {
            return Err(upstream_error(response).await);
        }
        Ok(response)
    }
}

#[async_trait]
impl Executor for OpenAiExecutor {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn serves(&self, dialect: Dialect) -> bool {
        matches!(dialect, Dialect::OpenaiChat | Dialect::OpenaiResponses)
    }

    async fn execute(
        &self,
        ctx: &RequestContext,
        auth: &Credential,
        mut payload: Value,
    ) -> Result<Value> {
        if let Some(map) = payload.as_object_mut() {
            map.remove("stream");
            map.insert(
                "model".into(),
                Value::String(auth.resolve_upstream_model(&ctx.model)),
            );
        }
        let response = self
            .send(ctx, auth, Self::endpoint(ctx.dialect), &payload)
            .await?;
        let body = response.bytes().await.map_err(network_error)?;
        serde_json::from_slice(&body)
            .map_err(|e| GatewayError::Translation(format!("invalid upstream JSON: {e}")))
    }

    async fn execute_stream(
        &self,
        ctx: &RequestContext,
        auth: &Credential,
        mut payload: Value,
    ) -> Result<EventStream> {
        if let Some(map) = payload.as_object_mut() {
            map.insert("stream".into(), Value::Bool(true));
            if ctx.dialect == Dialect::OpenaiChat {
                map.insert("stream_options".into(), json!({"include_usage": true}));
            }
            map.insert(
                "model".into(),
                Value::String(auth.resolve_upstream_model(&ctx.model)),
            );
        }
        let response = self
            .send(ctx, auth, Self::endpoint(ctx.dialect), &payload)
            .await?;
        Ok(guarded(
            parse_sse_stream(response),
            ctx.cancel.clone(),
            STREAM_IDLE_TIMEOUT,
        ))
    }

    /// OpenAI has no counting endpoint; estimate from the serialized prompt.
    async fn count_tokens(
        &self,
        _ctx: &RequestContext,
        _auth: &Credential,
        payload: Value,
    ) -> Result<Value> {
        let chars = payload
            .get("messages")
            .or_else(|| payload.get("input"))
            .map(|m| m.to_string().chars().count())
            .unwrap_or(0);
        Ok(json!({"input_tokens": (chars / 4) as u64}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> OpenAiExecutor {
        OpenAiExecutor::new(Arc::new(ClientPool::new(None)))
    }

    #[test]
    fn test_serves_both_openai_dialects() {
        let ex = executor();
        assert!(ex.serves(Dialect::OpenaiChat));
        assert!(ex.serves(Dialect::OpenaiResponses));
        assert!(!ex.serves(Dialect::GeminiV1beta));
    }

    #[test]
    fn test_compat_identifier() {
        let ex = OpenAiExecutor::compat(Arc::new(ClientPool::new(None)), "openrouter");
        assert_eq!(ex.identifier(), "openai-compat:openrouter");
    }

    #[test]
    fn test_endpoint_by_dialect() {
        assert_eq!(OpenAiExecutor::endpoint(Dialect::OpenaiChat), "/v1/chat/completions");
        assert_eq!(OpenAiExecutor::endpoint(Dialect::OpenaiResponses), "/v1/responses");
    }

    #[tokio::test]
    async fn test_count_tokens_estimate() {
        let ex = executor();
        let ctx = RequestContext::new(Dialect::OpenaiChat, "gpt-x", false);
        let cred = Credential::new("c".into(), "openai", "k");
        let payload = json!({"messages": [{"role": "user", "content": "hello world"}]});
        let out = ex.count_tokens(&ctx, &cred, payload).await.unwrap();
        assert!(out["input_tokens"].as_u64().unwrap() > 0);
    }
}
