//! Gemini OAuth executor (Code Assist endpoint).
//!
//! File-backed `gemini-oauth` credentials talk to Google's internal CLI
//! endpoint with a bearer token and the `{model, project, request}`
//! envelope. Token refresh is serialized per credential through the shared
//! [`RefreshRuntime`] so virtual per-project children never race each other.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::Value;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use polygate_core::auth::{Credential, attr};
use polygate_core::dialect::Dialect;
use polygate_core::error::{GatewayError, Result};
use polygate_translate::gemini_cli::{unwrap_code_assist, wrap_code_assist};

use crate::http::ClientPool;
use crate::sse::{STREAM_IDLE_TIMEOUT, guarded, parse_sse_stream};
use crate::{EventStream, Executor, RequestContext, network_error, upstream_error};

const CODE_ASSIST_ENDPOINT: &str = "https://cloudcode-pa.googleapis.com";
const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
const CLIENT_ID_ENV: &str = "GEMINI_OAUTH_CLIENT_ID";
const CLIENT_SECRET_ENV: &str = "GEMINI_OAUTH_CLIENT_SECRET";

/// Refresh when the access token expires within this window.
const REFRESH_MARGIN_SECS: i64 = 60;

pub struct GeminiCliExecutor {
    pool: Arc<ClientPool>,
}

impl GeminiCliExecutor {
    pub fn new(pool: Arc<ClientPool>) -> Self {
        Self { pool }
    }

    async fn access_token(&self, ctx: &RequestContext, auth: &Credential) -> Result<String> {
        self.refresh(ctx, auth).await?;
        let runtime = auth.runtime.as_ref().ok_or_else(|| {
            GatewayError::Unauthenticated(format!("credential {} has no token runtime", auth.id))
        })?;
        let state = runtime.state.lock().await;
        if state.access_token.is_empty() {
            return Err(GatewayError::Unauthenticated(format!(
                "credential {} has no access token",
                auth.id
            )));
        }
        Ok(state.access_token.clone())
    }

    async fn send(
        &self,
        ctx: &RequestContext,
        auth: &Credential,
        action: &str,
        sse: bool,
        payload: &Value,
    ) -> Result<reqwest::Response> {
        let token = self.access_token(ctx, auth).await?;
        let model = auth.resolve_upstream_model(&ctx.model);
        let project = auth.attr("project_id");
        let envelope = wrap_code_assist(&model, project, payload);

        let mut url = format!("{CODE_ASSIST_ENDPOINT}/v1internal:{action}");
        if sse {
            url.push_str("?alt=sse");
        }
        let client = self.pool.client(auth.proxy_url.as_deref())?;
        let mut req = client
            .post(url)
            .header("authorization", format!("Bearer {token}"))
            .header("content-type", "application/json");
        for (name, value) in auth.header_attributes() {
            req = req.header(name, value);
        }

        debug!(credential = %auth.id, %model, action, "gemini-cli upstream call");
        let response = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(GatewayError::ClientCancelled),
            r = req.json(&envelope).send() => r.map_err(network_error)?,
        };
        if !response.status().is_success() {
            return Err(upstream_error(response).await);
        }
        Ok(response)
    }
}

#[async_trait]
impl Executor for GeminiCliExecutor {
    fn identifier(&self) -> &str {
        "gemini-oauth"
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
        let enveloped: Value = serde_json::from_slice(&body)
            .map_err(|e| GatewayError::Translation(format!("invalid upstream JSON: {e}")))?;
        Ok(unwrap_code_assist(&enveloped))
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
        // Each SSE event carries the Code Assist envelope; peel it off so
        // downstream sees plain gemini-v1beta chunks.
        let unwrapped = parse_sse_stream(response).map(|item| {
            item.map(|mut event| {
                if let Ok(value) = serde_json::from_str::<Value>(&event.data) {
                    event.data = unwrap_code_assist(&value).to_string();
                }
                event
            })
        });
        Ok(guarded(unwrapped, ctx.cancel.clone(), STREAM_IDLE_TIMEOUT))
    }

    async fn count_tokens(
        &self,
        ctx: &RequestContext,
        auth: &Credential,
        payload: Value,
    ) -> Result<Value> {
        let response = self.send(ctx, auth, "countTokens", false, &payload).await?;
        let body = response.bytes().await.map_err(network_error)?;
        let enveloped: Value = serde_json::from_slice(&body)
            .map_err(|e| GatewayError::Translation(format!("invalid upstream JSON: {e}")))?;
        Ok(unwrap_code_assist(&enveloped))
    }

    /// Refresh the access token when it is near expiry. The credential-scoped
    /// mutex serializes refreshes across concurrent requests and virtual
    /// children sharing this runtime.
    async fn refresh(&self, ctx: &RequestContext, auth: &Credential) -> Result<()> {
        let Some(runtime) = auth.runtime.as_ref() else {
            return Ok(());
        };
        let mut state = runtime.state.lock().await;

        let near_expiry = match state.expiry {
            Some(expiry) => expiry - Utc::now() < Duration::seconds(REFRESH_MARGIN_SECS),
            None => state.access_token.is_empty(),
        };
        if !near_expiry {
            return Ok(());
        }
        let Some(refresh_token) = state.refresh_token.clone() else {
            return Ok(());
        };

        let client_id = std::env::var(CLIENT_ID_ENV).unwrap_or_default();
        let client_secret = std::env::var(CLIENT_SECRET_ENV).unwrap_or_default();
        if client_id.is_empty() || client_secret.is_empty() {
            return Err(GatewayError::Unauthenticated(
                "gemini OAuth client id/secret not configured".into(),
            ));
        }

        let client = self.pool.client(auth.proxy_url.as_deref())?;
        let params = [
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
            ("refresh_token", refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];
        let response = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(GatewayError::ClientCancelled),
            r = client.post(TOKEN_ENDPOINT).form(&params).send() => r.map_err(network_error)?,
        };
        if !response.status().is_success() {
            return Err(upstream_error(response).await);
        }
        let body: Value = response.json().await.map_err(network_error)?;

        if let Some(token) = body.get("access_token").and_then(Value::as_str) {
            state.access_token = token.to_string();
        }
        let expires_in = body
            .get("expires_in")
            .and_then(Value::as_i64)
            .unwrap_or(3600);
        state.expiry = Some(Utc::now() + Duration::seconds(expires_in));
        info!(credential = %auth.id, "refreshed gemini OAuth token");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polygate_core::auth::{RefreshRuntime, TokenState};

    #[tokio::test]
    async fn test_refresh_noop_when_token_fresh() {
        let ex = GeminiCliExecutor::new(Arc::new(ClientPool::new(None)));
        let ctx = RequestContext::new(Dialect::GeminiV1beta, "gemini-2.5-pro", false);
        let mut cred = Credential::new("c".into(), "gemini-oauth", "acct");
        cred.runtime = Some(RefreshRuntime::new(TokenState {
            access_token: "tok".into(),
            refresh_token: Some("r".into()),
            expiry: Some(Utc::now() + Duration::hours(1)),
        }));

        ex.refresh(&ctx, &cred).await.unwrap();
        let state = cred.runtime.as_ref().unwrap().state.lock().await;
        assert_eq!(state.access_token, "tok");
    }

    #[tokio::test]
    async fn test_refresh_without_runtime_is_identity() {
        let ex = GeminiCliExecutor::new(Arc::new(ClientPool::new(None)));
        let ctx = RequestContext::new(Dialect::GeminiV1beta, "m", false);
        let cred = Credential::new("c".into(), "gemini-oauth", "acct");
        assert!(ex.refresh(&ctx, &cred).await.is_ok());
    }

    #[tokio::test]
    async fn test_access_token_requires_runtime() {
        let ex = GeminiCliExecutor::new(Arc::new(ClientPool::new(None)));
        let ctx = RequestContext::new(Dialect::GeminiV1beta, "m", false);
        let cred = Credential::new("c".into(), "gemini-oauth", "acct");
        assert!(matches!(
            ex.access_token(&ctx, &cred).await,
            Err(GatewayError::Unauthenticated(_))
        ));
    }
}
