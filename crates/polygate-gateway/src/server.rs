//! The axum server: routes, client auth, and startup.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tower_http::trace::TraceLayer;
use tracing::info;

use polygate_core::config::Config;
use polygate_core::dialect::Dialect;
use polygate_providers::http::ClientPool;
use polygate_translate::TranslatorRegistry;

use crate::dispatch::{
    self, GeminiAction, dispatch_count_tokens, dispatch_legacy, extract_model, split_model_action,
};
use crate::manager::{CredentialManager, ExecutorSet};
use crate::state::GatewayState;
use crate::watcher::{Reconciler, start_watching};

/// Startup failures, mapped onto process exit codes by the CLI.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("invalid config: {0}")]
    Config(String),

    #[error("port {0} is already in use")]
    PortInUse(u16),

    #[error("auth dir unreadable: {0}")]
    AuthDir(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ServeError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ServeError::Config(_) => 1,
            ServeError::PortInUse(_) => 2,
            ServeError::AuthDir(_) => 3,
            ServeError::Other(_) => 1,
        }
    }
}

/// Load config, bootstrap credentials, start the watcher, and serve.
pub async fn serve(config_path: PathBuf, port_override: Option<u16>) -> Result<(), ServeError> {
    let config =
        Config::load(&config_path).map_err(|e| ServeError::Config(e.to_string()))?;

    let auth_dir = config.auth_dir_path();
    if !auth_dir.exists() {
        std::fs::create_dir_all(&auth_dir)
            .map_err(|e| ServeError::AuthDir(format!("{}: {e}", auth_dir.display())))?;
    }
    std::fs::read_dir(&auth_dir)
        .map_err(|e| ServeError::AuthDir(format!("{}: {e}", auth_dir.display())))?;

    let port = port_override.unwrap_or(config.port());
    let pool = Arc::new(ClientPool::new(config.proxy_url.clone()));
    let translators = Arc::new(TranslatorRegistry::new());
    let manager = Arc::new(CredentialManager::new(
        ExecutorSet::new(pool.clone()),
        translators.clone(),
        config.request_retry(),
        config.max_retry_interval(),
    ));

    let shared_config = Arc::new(tokio::sync::RwLock::new(Arc::new(config)));
    let reconciler = Arc::new(Reconciler::new(
        config_path,
        auth_dir,
        shared_config.clone(),
        manager.clone(),
    ));
    reconciler.bootstrap().await;
    info!(
        credentials = manager.snapshot().await.len(),
        "credential store loaded"
    );

    let _watch = start_watching(reconciler).map_err(ServeError::Other)?;
    let _recovery = manager.spawn_cooldown_recovery();

    let state = Arc::new(GatewayState::new(shared_config, manager, translators, pool));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                ServeError::PortInUse(port)
            } else {
                ServeError::Other(e.into())
            }
        })?;
    info!(port, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| ServeError::Other(e.into()))?;

    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
    }
}

pub fn build_router(state: Arc<GatewayState>) -> Router {
    let api = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(legacy_completions))
        .route("/v1/responses", post(responses))
        .route("/v1/messages", post(messages))
        .route("/v1/messages/count_tokens", post(messages_count_tokens))
        .route("/v1/models", get(list_models))
        .route("/v1beta/models", get(gemini_list_models))
        .route("/v1beta/models/{maction}", post(gemini_generate))
        // Provider-scoped aliases for clients that embed the provider in
        // the path.
        .route("/api/provider/openai/v1/chat/completions", post(chat_completions))
        .route("/api/provider/openai/v1/completions", post(legacy_completions))
        .route("/api/provider/openai/v1/responses", post(responses))
        .route("/api/provider/openai/v1/models", get(list_models))
        .route("/api/provider/anthropic/v1/messages", post(messages))
        .route(
            "/api/provider/anthropic/v1/messages/count_tokens",
            post(messages_count_tokens),
        )
        .route("/api/provider/google/v1beta/models", get(gemini_list_models))
        .route("/api/provider/google/v1beta/models/{maction}", post(gemini_generate))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_client_auth,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// --- Client auth ---

/// Compare in constant time via fixed-length digests.
fn key_matches(expected: &str, presented: &str) -> bool {
    let a = Sha256::digest(expected.as_bytes());
    let b = Sha256::digest(presented.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn presented_key(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }
    for header in ["x-api-key", "x-goog-api-key"] {
        if let Some(key) = headers.get(header).and_then(|v| v.to_str().ok()) {
            return Some(key.trim().to_string());
        }
    }
    query.and_then(|q| {
        q.split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(name, _)| *name == "key")
            .map(|(_, value)| value.to_string())
    })
}

async fn require_client_auth(
    State(state): State<Arc<GatewayState>>,
    request: Request,
    next: Next,
) -> Response {
    let keys = state.client_keys().await;
    if keys.is_empty() {
        // Unset key disables client auth.
        return next.run(request).await;
    }
    let presented = presented_key(request.headers(), request.uri().query());
    let authorized = presented
        .as_deref()
        .is_some_and(|p| keys.iter().any(|k| key_matches(k, p)));
    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": {"type": "unauthorized", "message": "invalid or missing API key"}})),
        )
            .into_response();
    }
    next.run(request).await
}

// --- Handlers ---

async fn health(State(state): State<Arc<GatewayState>>) -> Response {
    let credentials = state.manager.snapshot().await.len();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "credentials": credentials,
        "started_at": state.started_at.to_rfc3339(),
    }))
    .into_response()
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": {"type": "invalid_request_error", "message": message}})),
    )
        .into_response()
}

fn model_and_stream(body: &Value) -> Result<(String, bool), Response> {
    let model = match extract_model(body) {
        Some(m) if !m.is_empty() => m,
        _ => return Err(bad_request("missing model")),
    };
    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    Ok((model, stream))
}

async fn chat_completions(
    State(state): State<Arc<GatewayState>>,
    Json(body): Json<Value>,
) -> Response {
    match body.get("messages").and_then(Value::as_array) {
        Some(messages) if !messages.is_empty() => {}
        _ => return bad_request("messages must be a non-empty array"),
    }
    match model_and_stream(&body) {
        Ok((model, stream)) => {
            dispatch::dispatch(state, Dialect::OpenaiChat, model, body, stream).await
        }
        Err(resp) => resp,
    }
}

async fn legacy_completions(
    State(state): State<Arc<GatewayState>>,
    Json(body): Json<Value>,
) -> Response {
    match model_and_stream(&body) {
        Ok((model, stream)) => dispatch_legacy(state, model, body, stream).await,
        Err(resp) => resp,
    }
}

async fn responses(State(state): State<Arc<GatewayState>>, Json(body): Json<Value>) -> Response {
    match model_and_stream(&body) {
        Ok((model, stream)) => {
            dispatch::dispatch(state, Dialect::OpenaiResponses, model, body, stream).await
        }
        Err(resp) => resp,
    }
}

async fn messages(State(state): State<Arc<GatewayState>>, Json(body): Json<Value>) -> Response {
    match body.get("messages").and_then(Value::as_array) {
        Some(messages) if !messages.is_empty() => {}
        _ => return bad_request("messages must be a non-empty array"),
    }
    match model_and_stream(&body) {
        Ok((model, stream)) => {
            dispatch::dispatch(state, Dialect::AnthropicMessages, model, body, stream).await
        }
        Err(resp) => resp,
    }
}

async fn messages_count_tokens(
    State(state): State<Arc<GatewayState>>,
    Json(body): Json<Value>,
) -> Response {
    match model_and_stream(&body) {
        Ok((model, _)) => {
            dispatch_count_tokens(state, Dialect::AnthropicMessages, model, body).await
        }
        Err(resp) => resp,
    }
}

async fn list_models(State(state): State<Arc<GatewayState>>) -> Response {
    let registry = state.manager.registry().await;
    let data: Vec<Value> = registry
        .model_names()
        .into_iter()
        .map(|name| {
            json!({
                "id": name,
                "object": "model",
                "owned_by": "polygate",
            })
        })
        .collect();
    Json(json!({"object": "list", "data": data})).into_response()
}

async fn gemini_list_models(State(state): State<Arc<GatewayState>>) -> Response {
    let registry = state.manager.registry().await;
    let models: Vec<Value> = registry
        .model_names()
        .into_iter()
        .map(|name| {
            json!({
                "name": format!("models/{name}"),
                "displayName": name,
                "supportedGenerationMethods": ["generateContent", "streamGenerateContent", "countTokens"],
            })
        })
        .collect();
    Json(json!({"models": models})).into_response()
}

/// `POST /v1beta/models/{model}:{action}` — the model rides in the path.
async fn gemini_generate(
    State(state): State<Arc<GatewayState>>,
    Path(maction): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let Some((model, action)) = split_model_action(&maction) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": {"type": "not_found", "message": "unknown model action"}})),
        )
            .into_response();
    };
    match action {
        GeminiAction::Generate => {
            dispatch::dispatch(state, Dialect::GeminiV1beta, model, body, false).await
        }
        GeminiAction::StreamGenerate => {
            dispatch::dispatch(state, Dialect::GeminiV1beta, model, body, true).await
        }
        GeminiAction::CountTokens => {
            dispatch_count_tokens(state, Dialect::GeminiV1beta, model, body).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_matches_constant_time_shape() {
        assert!(key_matches("sk-secret", "sk-secret"));
        assert!(!key_matches("sk-secret", "sk-other"));
        assert!(!key_matches("sk-secret", ""));
    }

    #[test]
    fn test_presented_key_sources() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer sk-1".parse().unwrap());
        assert_eq!(presented_key(&headers, None).as_deref(), Some("sk-1"));

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "sk-2".parse().unwrap());
        assert_eq!(presented_key(&headers, None).as_deref(), Some("sk-2"));

        let headers = HeaderMap::new();
        assert_eq!(
            presented_key(&headers, Some("alt=sse&key=sk-3")).as_deref(),
            Some("sk-3")
        );
        assert_eq!(presented_key(&headers, Some("alt=sse")), None);
    }

    #[test]
    fn test_serve_error_exit_codes() {
        assert_eq!(ServeError::Config("x".into()).exit_code(), 1);
        assert_eq!(ServeError::PortInUse(8317).exit_code(), 2);
        assert_eq!(ServeError::AuthDir("x".into()).exit_code(), 3);
    }
}
