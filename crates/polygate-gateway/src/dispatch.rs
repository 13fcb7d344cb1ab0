//! Request dispatch: parse just enough of the body, run the selector, and
//! proxy the result back in the client's dialect, streaming or not.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{Value, json};
use tracing::{info, warn};

use polygate_core::dialect::Dialect;
use polygate_core::error::GatewayError;
use polygate_providers::RequestContext;
use polygate_translate::SseEvent;

use crate::state::GatewayState;

/// What a Gemini URL's `:action` segment asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeminiAction {
    Generate,
    StreamGenerate,
    CountTokens,
}

impl GeminiAction {
    pub fn parse(action: &str) -> Option<Self> {
        match action {
            "generateContent" => Some(Self::Generate),
            "streamGenerateContent" => Some(Self::StreamGenerate),
            "countTokens" => Some(Self::CountTokens),
            _ => None,
        }
    }
}

pub fn extract_model(body: &Value) -> Option<String> {
    body.get("model")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Split a Gemini path segment `models/{name}:{action}`.
pub fn split_model_action(segment: &str) -> Option<(String, GeminiAction)> {
    let (model, action) = segment.rsplit_once(':')?;
    Some((model.to_string(), GeminiAction::parse(action)?))
}

fn request_context(dialect: Dialect, model: &str, stream: bool) -> RequestContext {
    RequestContext {
        dialect,
        model: model.to_string(),
        stream,
        request_id: uuid::Uuid::new_v4().to_string(),
        cancel: tokio_util::sync::CancellationToken::new(),
    }
}

/// Wrap a legacy `/v1/completions` body as a chat request.
pub fn wrap_legacy_completion(body: &Value) -> Value {
    if body.get("messages").is_some() {
        return body.clone();
    }
    let prompt = match body.get("prompt") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    };
    let mut out = body.clone();
    if let Some(map) = out.as_object_mut() {
        map.remove("prompt");
        map.insert(
            "messages".into(),
            json!([{"role": "user", "content": prompt}]),
        );
    }
    out
}

/// Convert a chat response into the legacy text-completion shape.
pub fn chat_to_legacy_response(response: &Value) -> Value {
    let Some(choices) = response.get("choices").and_then(Value::as_array) else {
        return response.clone();
    };
    let converted: Vec<Value> = choices
        .iter()
        .map(|c| {
            let text = c
                .get("message")
                .and_then(|m| m.get("content"))
                .or_else(|| c.get("delta").and_then(|d| d.get("content")))
                .and_then(Value::as_str)
                .unwrap_or_default();
            json!({
                "index": c.get("index").cloned().unwrap_or(json!(0)),
                "text": text,
                "finish_reason": c.get("finish_reason").cloned().unwrap_or(Value::Null),
                "logprobs": Value::Null,
            })
        })
        .collect();

    let mut out = response.clone();
    if let Some(map) = out.as_object_mut() {
        map.insert("object".into(), json!("text_completion"));
        map.insert("choices".into(), json!(converted));
    }
    out
}

/// The main entry point for every JSON route.
pub async fn dispatch(
    state: Arc<GatewayState>,
    dialect: Dialect,
    model: String,
    body: Value,
    stream: bool,
) -> Response {
    let started = Instant::now();
    let ctx = request_context(dialect, &model, stream);
    info!(
        request_id = %ctx.request_id,
        dialect = %dialect,
        model = %model,
        stream,
        "dispatch start"
    );

    if stream {
        match state.manager.dispatch_stream(&ctx, &body).await {
            Ok((events, cred)) => {
                info!(
                    request_id = %ctx.request_id,
                    credential = %cred.id,
                    latency_ms = started.elapsed().as_millis() as u64,
                    "stream opened"
                );
                sse_response(events, ctx)
            }
            Err(e) => failure_response(state, dialect, &model, &body, e, &ctx, started).await,
        }
    } else {
        match state.manager.dispatch(&ctx, &body).await {
            Ok((value, cred)) => {
                let usage = polygate_providers::parse_usage(dialect, &value);
                info!(
                    request_id = %ctx.request_id,
                    credential = %cred.id,
                    status = 200,
                    latency_ms = started.elapsed().as_millis() as u64,
                    input_tokens = usage.map(|u| u.input_tokens),
                    output_tokens = usage.map(|u| u.output_tokens),
                    "dispatch done"
                );
                json_response(StatusCode::OK, &value, &ctx.request_id)
            }
            Err(e) => failure_response(state, dialect, &model, &body, e, &ctx, started).await,
        }
    }
}

/// Legacy `/v1/completions`: wrap the prompt as a chat request and convert
/// non-streaming responses back to the text-completion shape. Streams are
/// proxied as chat chunks.
pub async fn dispatch_legacy(
    state: Arc<GatewayState>,
    model: String,
    body: Value,
    stream: bool,
) -> Response {
    let wrapped = wrap_legacy_completion(&body);
    if stream {
        return dispatch(state, Dialect::OpenaiChat, model, wrapped, true).await;
    }

    let started = Instant::now();
    let ctx = request_context(Dialect::OpenaiChat, &model, false);
    match state.manager.dispatch(&ctx, &wrapped).await {
        Ok((value, cred)) => {
            info!(
                request_id = %ctx.request_id,
                credential = %cred.id,
                status = 200,
                latency_ms = started.elapsed().as_millis() as u64,
                "dispatch done"
            );
            json_response(
                StatusCode::OK,
                &chat_to_legacy_response(&value),
                &ctx.request_id,
            )
        }
        Err(e) => {
            failure_response(state, Dialect::OpenaiChat, &model, &wrapped, e, &ctx, started).await
        }
    }
}

/// Token counting (Anthropic and Gemini surfaces).
pub async fn dispatch_count_tokens(
    state: Arc<GatewayState>,
    dialect: Dialect,
    model: String,
    body: Value,
) -> Response {
    let ctx = request_context(dialect, &model, false);
    match state.manager.dispatch_count_tokens(&ctx, &body).await {
        Ok((value, _)) => json_response(StatusCode::OK, &value, &ctx.request_id),
        Err(e) => error_response(dialect, &model, &e),
    }
}

async fn failure_response(
    state: Arc<GatewayState>,
    dialect: Dialect,
    model: &str,
    body: &Value,
    error: GatewayError,
    ctx: &RequestContext,
    started: Instant,
) -> Response {
    info!(
        request_id = %ctx.request_id,
        dialect = %dialect,
        model = %model,
        status = error.http_status(),
        latency_ms = started.elapsed().as_millis() as u64,
        "dispatch failed"
    );

    // A model nobody serves may still be forwardable to the operator's
    // fallback upstream.
    if matches!(error, GatewayError::NoEligibleCredential { .. }) {
        let fallback = state.config.read().await.fallback_upstream.clone();
        if let Some(upstream) = fallback {
            return forward_to_fallback(&state, &upstream, dialect, body).await;
        }
    }

    error_response(dialect, model, &error)
}

/// Forward the raw request to the configured external upstream as-is.
async fn forward_to_fallback(
    state: &Arc<GatewayState>,
    upstream: &str,
    dialect: Dialect,
    body: &Value,
) -> Response {
    let url = format!(
        "{}{}",
        upstream.trim_end_matches('/'),
        dialect.endpoint_path()
    );
    info!(%url, "forwarding to fallback upstream");

    let client = match state.pool.client(None) {
        Ok(c) => c,
        Err(e) => return error_response(dialect, "", &e),
    };
    match client.post(&url).json(body).send().await {
        Ok(resp) => {
            let status =
                StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            let content_type = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("application/json")
                .to_string();
            let bytes = resp.bytes().await.unwrap_or_default();
            let mut response = Response::new(Body::from(bytes));
            *response.status_mut() = status;
            if let Ok(ct) = HeaderValue::from_str(&content_type) {
                response.headers_mut().insert(header::CONTENT_TYPE, ct);
            }
            response
        }
        Err(e) => error_response(dialect, "", &GatewayError::Network(e.to_string())),
    }
}

pub fn json_response(status: StatusCode, value: &Value, request_id: &str) -> Response {
    let mut response = (status, axum::Json(value.clone())).into_response();
    if let Ok(id) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert("x-request-id", id);
    }
    response
}

/// One SSE wire frame from a translated event.
pub fn sse_frame(event: &SseEvent) -> String {
    match &event.event {
        Some(name) => format!("event: {name}\ndata: {}\n\n", event.data),
        None => format!("data: {}\n\n", event.data),
    }
}

/// Stream events to the client. Dropping the response body (client
/// disconnect) cancels the upstream via the context's drop guard.
pub fn sse_response(events: polygate_providers::EventStream, ctx: RequestContext) -> Response {
    let guard = ctx.cancel.clone().drop_guard();
    let request_id = ctx.request_id.clone();

    let body_stream = events.scan((guard, false), |(_guard, failed), item| {
        if *failed {
            return futures::future::ready(None);
        }
        match item {
            Ok(event) => futures::future::ready(Some(Ok::<Bytes, Infallible>(Bytes::from(
                sse_frame(&event),
            )))),
            Err(e) => {
                // Partial stream already delivered; end it cleanly.
                warn!(%e, "upstream stream error, ending response");
                *failed = true;
                futures::future::ready(None)
            }
        }
    });

    let mut response = Response::new(Body::from_stream(body_stream));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    if let Ok(id) = HeaderValue::from_str(&request_id) {
        headers.insert("x-request-id", id);
    }
    response
}

/// Map a gateway error onto the client surface. Upstream bodies pass
/// through verbatim with their content type.
pub fn error_response(dialect: Dialect, model: &str, error: &GatewayError) -> Response {
    match error {
        GatewayError::Upstream {
            status,
            body,
            content_type,
            ..
        } => {
            let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut response = Response::new(Body::from(body.clone()));
            *response.status_mut() = status;
            let ct = content_type.as_deref().unwrap_or("application/json");
            if let Ok(value) = HeaderValue::from_str(ct) {
                response.headers_mut().insert(header::CONTENT_TYPE, value);
            }
            response
        }
        GatewayError::NoEligibleCredential { .. } => {
            let body = json!({
                "error": {
                    "type": "no_eligible_credential",
                    "message": format!("no eligible credential for model '{model}'"),
                    "dialect": dialect.name(),
                    "model": model,
                }
            });
            (StatusCode::SERVICE_UNAVAILABLE, axum::Json(body)).into_response()
        }
        _ => {
            let status =
                StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let body = json!({
                "error": {
                    "type": error_type(error),
                    "message": error.to_string(),
                }
            });
            (status, axum::Json(body)).into_response()
        }
    }
}

fn error_type(error: &GatewayError) -> &'static str {
    match error {
        GatewayError::Config(_) => "config_error",
        GatewayError::Unauthenticated(_) => "unauthenticated",
        GatewayError::Cooldown { .. } => "cooldown",
        GatewayError::Upstream { .. } => "upstream_error",
        GatewayError::Network(_) => "network_error",
        GatewayError::Translation(_) => "translation_error",
        GatewayError::ClientCancelled => "client_cancelled",
        GatewayError::NoEligibleCredential { .. } => "no_eligible_credential",
        GatewayError::Io(_) | GatewayError::Json(_) | GatewayError::Other(_) => "internal_error",
    }
}
