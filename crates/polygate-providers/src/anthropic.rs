//! Anthropic Messages API executor.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use polygate_core::auth::{Credential, attr};
use polygate_core::dialect::Dialect;
use polygate_core::error::{GatewayError, Result};

use crate::http::ClientPool;
use crate::sse::{STREAM_IDLE_TIMEOUT, guarded, parse_sse_stream};
use crate::{EventStream, Executor, RequestContext, network_error, upstream_error};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicExecutor {
    pool: Arc<ClientPool>,
}

impl AnthropicExecutor {
    pub fn new(pool: Arc<ClientPool>) -> Self {
        Self { pool }
    }

    fn base_url(auth: &Credential) -> &str {
        auth.attr(attr::BASE_URL)
            .filter(|u| !u.is_empty())
            .unwrap_or(DEFAULT_BASE_URL)
    }

    /// Build a POST with provider auth headers and declared `header:*`
    /// attribute overrides applied.
    pub fn prepare(&self, auth: &Credential, path: &str) -> Result<reqwest::RequestBuilder> {
        let api_key = auth
            .attr(attr::API_KEY)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                GatewayError::Unauthenticated(format!("credential {} has no api_key", auth.id))
            })?;

        let url = format!("{}{}", Self::base_url(auth).trim_end_matches('/'), path);
        let client = self.pool.client(auth.proxy_url.as_deref())?;
        let mut req = client
            .post(url)
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
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
        debug!(credential = %auth.id, path, "anthropic upstream call");
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
impl Executor for AnthropicExecutor {
    fn identifier(&self) -> &str {
        "anthropic"
    }

    fn serves(&self, dialect: Dialect) -> bool {
        dialect == Dialect::AnthropicMessages
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
        let response = self.send(ctx, auth, "/v1/messages", &payload).await?;
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
            map.insert(
                "model".into(),
                Value::String(auth.resolve_upstream_model(&ctx.model)),
            );
        }
        let response = self.send(ctx, auth, "/v1/messages", &payload).await?;
        Ok(guarded(
            parse_sse_stream(response),
            ctx.cancel.clone(),
            STREAM_IDLE_TIMEOUT,
        ))
    }

    async fn count_tokens(
        &self,
        ctx: &RequestContext,
        auth: &Credential,
        mut payload: Value,
    ) -> Result<Value> {
        if let Some(map) = payload.as_object_mut() {
            map.remove("stream");
            map.remove("max_tokens");
            map.insert(
                "model".into(),
                Value::String(auth.resolve_upstream_model(&ctx.model)),
            );
        }
        let response = self
            .send(ctx, auth, "/v1/messages/count_tokens", &payload)
            .await?;
        let body = response.bytes().await.map_err(network_error)?;
        serde_json::from_slice(&body)
            .map_err(|e| GatewayError::Translation(format!("invalid upstream JSON: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> AnthropicExecutor {
        AnthropicExecutor::new(Arc::new(ClientPool::new(None)))
    }

    #[test]
    fn test_serves_only_messages_dialect() {
        let ex = executor();
        assert!(ex.serves(Dialect::AnthropicMessages));
        assert!(!ex.serves(Dialect::OpenaiChat));
    }

    #[test]
    fn test_prepare_requires_api_key() {
        let ex = executor();
        let cred = Credential::new("c1".into(), "anthropic", "no-key");
        let err = ex.prepare(&cred, "/v1/messages").unwrap_err();
        assert!(matches!(err, GatewayError::Unauthenticated(_)));
    }

    #[test]
    fn test_prepare_with_key_and_custom_base() {
        let ex = executor();
        let mut cred = Credential::new("c1".into(), "anthropic", "ok");
        cred.set_attr("api_key", "sk-ant-x");
        cred.set_attr("base_url", "https://claude.azure.example/");
        cred.set_attr("header:X-Route", "eastus");
        assert!(ex.prepare(&cred, "/v1/messages").is_ok());
    }
}
