//! Google Gemini v1beta executor.
//!
//! Auth is an API key in the query string; streaming uses
//! `streamGenerateContent` with `alt=sse`.

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

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiExecutor {
    pool: Arc<ClientPool>,
}

impl GeminiExecutor {
    pub fn new(pool: Arc<ClientPool>) -> Self {
        Self { pool }
    }

    fn base_url(auth: &Credential) -> &str {
        auth.attr(attr::BASE_URL)
            .filter(|u| !u.is_empty())
            .unwrap_or(DEFAULT_BASE_URL)
    }

    pub fn prepare(
        &self,
        auth: &Credential,
        model: &str,
        action: &str,
        sse: bool,
    ) -> Result<reqwest::RequestBuilder> {
        let api_key = auth
            .attr(attr::API_KEY)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                GatewayError::Unauthenticated(format!("credential {} has no api_key", auth.id))
            })?;

        let base = Self::base_url(auth).trim_end_matches('/');
        let mut url = format!("{base}/v1beta/models/{model}:{action}?key={api_key}");
        if sse {
            url.push_str("&alt=sse");
        }
        let client = self.pool.client(auth.proxy_url.as_deref())?;
        let mut req = client.post(url).header("content-type", "application/json");
        for (name, value) in auth.header_attributes() {
            req = req.header(name, value);
        }
        Ok(req)
    }

    async fn send(
        &self,
        ctx: &RequestContext,
        auth: &Credential,
        action: &str,
        sse: bool,
        payload: &Value,
    ) -> Result<reqwest::Response> {
        let model = auth.resolve_upstream_model(&ctx.model);
        let req = self.prepare(auth, &model, action, sse)?.json(payload);
        debug!(credential = %auth.id, %model, action, "gemini upstream call");
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
impl Executor for GeminiExecutor {
    fn identifier(&self) -> &str {
        "gemini"
    }

    fn serves(&self, dialect: Dialect) -> bool {
        dialect == Dialect::GeminiV1beta
    }

    async fn execute(
        &self,
        ctx: &RequestContext,
        auth: &Credential,
        payload: Value,
    ) -> Result<Value> {
        let response = self
            .send(ctx, auth, "generateContent", false, &payload)
            .await?;
        let body = response.bytes().await.map_err(network_error)?;
        serde_json::from_slice(&body)
            .map_err(|e| GatewayError::Translation(format!("invalid upstream JSON: {e}")))
    }

    async fn execute_stream(
        &self,
        ctx: &RequestContext,
        auth: &Credential,
        payload: Value,
    ) -> Result<EventStream> {
        let response = self
            .send(ctx, auth, "streamGenerateContent", true, &payload)
            .await?;
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
        payload: Value,
    ) -> Result<Value> {
        let response = self.send(ctx, auth, "countTokens", false, &payload).await?;
        let body = response.bytes().await.map_err(network_error)?;
        serde_json::from_slice(&body)
            .map_err(|e| GatewayError::Translation(format!("invalid upstream JSON: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serves_gemini_only() {
        let ex = GeminiExecutor::new(Arc::new(ClientPool::new(None)));
        assert!(ex.serves(Dialect::GeminiV1beta));
        assert!(!ex.serves(Dialect::OpenaiChat));
    }

    #[test]
    fn test_prepare_requires_key() {
        let ex = GeminiExecutor::new(Arc::new(ClientPool::new(None)));
        let cred = Credential::new("c".into(), "gemini", "no-key");
        assert!(matches!(
            ex.prepare(&cred, "gemini-2.5-pro", "generateContent", false),
            Err(GatewayError::Unauthenticated(_))
        ));
    }
}
