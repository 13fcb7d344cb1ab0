//! SSE parsing for upstream response bodies.
//!
//! Converts a `reqwest::Response` body into a stream of [`SseEvent`]s, with
//! partial lines accumulated across chunks. [`guarded`] layers cancellation
//! and an inter-chunk watchdog on top; streaming models may legitimately be
//! silent for a while, so the watchdog default is generous.

use std::time::Duration;

use futures::Stream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use polygate_core::error::{GatewayError, Result};
use polygate_translate::SseEvent;

use crate::EventStream;

/// Streams must tolerate very large single events (whole images arrive as
/// one `data:` line), but a runaway line without a newline is an upstream
/// bug, not a payload.
const MAX_LINE_BYTES: usize = 64 * 1024 * 1024;

/// Default inter-chunk watchdog.
pub const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Parse a reqwest response body as an SSE stream.
pub fn parse_sse_stream(response: reqwest::Response) -> impl Stream<Item = Result<SseEvent>> {
    let byte_stream = response.bytes_stream();

    futures::stream::unfold(
        SseState {
            byte_stream: Box::pin(byte_stream),
            buffer: String::new(),
            current_event: None,
            current_data: Vec::new(),
        },
        |mut state| async move {
            loop {
                if let Some(newline_pos) = state.buffer.find('\n') {
                    let line = state.buffer[..newline_pos].trim_end_matches('\r').to_string();
                    state.buffer.drain(..=newline_pos);

                    if line.is_empty() {
                        // Empty line = dispatch event
                        if !state.current_data.is_empty() {
                            let event = SseEvent {
                                event: state.current_event.take(),
                                data: state.current_data.join("\n"),
                            };
                            state.current_data.clear();
                            return Some((Ok(event), state));
                        }
                        state.current_event = None;
                        continue;
                    }

                    if line.starts_with(':') {
                        // Comment, skip
                        continue;
                    }

                    if let Some(value) = line.strip_prefix("event:") {
                        state.current_event = Some(value.trim_start().to_string());
                    } else if let Some(value) = line.strip_prefix("data:") {
                        state.current_data.push(value.trim_start().to_string());
                    }
                    // Ignore unknown fields (id:, retry:)
                    continue;
                }

                if state.buffer.len() > MAX_LINE_BYTES {
                    return Some((
                        Err(GatewayError::Translation(
                            "SSE line exceeds maximum buffer size".into(),
                        )),
                        state,
                    ));
                }

                match state.byte_stream.next().await {
                    Some(Ok(chunk)) => {
                        state.buffer.push_str(&String::from_utf8_lossy(&chunk));
                    }
                    Some(Err(e)) => {
                        return Some((Err(GatewayError::Network(e.to_string())), state));
                    }
                    None => {
                        // Stream ended. Dispatch any remaining data.
                        if !state.current_data.is_empty() {
                            let event = SseEvent {
                                event: state.current_event.take(),
                                data: state.current_data.join("\n"),
                            };
                            state.current_data.clear();
                            return Some((Ok(event), state));
                        }
                        return None;
                    }
                }
            }
        },
    )
}

struct SseState {
    byte_stream:
        std::pin::Pin<Box<dyn Stream<Item = std::result::Result<bytes::Bytes, reqwest::Error>> + Send>>,
    buffer: String,
    current_event: Option<String>,
    current_data: Vec<String>,
}

/// Layer cancellation and the inter-chunk watchdog over an event stream.
///
/// Cancellation drops the inner stream (closing the upstream connection)
/// before the returned stream ends. A watchdog expiry yields one terminal
/// `Network` error.
pub fn guarded<S>(stream: S, cancel: CancellationToken, idle: Duration) -> EventStream
where
    S: Stream<Item = Result<SseEvent>> + Send + 'static,
{
    let stream = Box::pin(stream);
    Box::pin(futures::stream::unfold(
        Some((stream, cancel, idle)),
        |state| async move {
            let (mut stream, cancel, idle) = state?;
            tokio::select! {
                _ = cancel.cancelled() => None,
                next = tokio::time::timeout(idle, stream.next()) => match next {
                    Ok(Some(item)) => Some((item, Some((stream, cancel, idle)))),
                    Ok(None) => None,
                    Err(_) => Some((
                        Err(GatewayError::Network("stream idle timeout".into())),
                        None,
                    )),
                },
            }
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guarded_passes_items_through() {
        let inner = futures::stream::iter(vec![
            Ok(SseEvent::data("a")),
            Ok(SseEvent::named("message_stop", "{}")),
        ]);
        let cancel = CancellationToken::new();
        let events: Vec<_> = guarded(inner, cancel, Duration::from_secs(5))
            .collect()
            .await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_ref().unwrap().data, "a");
        assert_eq!(
            events[1].as_ref().unwrap().event.as_deref(),
            Some("message_stop")
        );
    }

    #[tokio::test]
    async fn test_guarded_stops_on_cancel() {
        let inner = futures::stream::pending::<Result<SseEvent>>();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let events: Vec<_> = guarded(inner, cancel, Duration::from_secs(5))
            .collect()
            .await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_guarded_watchdog_fires() {
        let inner = futures::stream::pending::<Result<SseEvent>>();
        let cancel = CancellationToken::new();
        let events: Vec<_> = guarded(inner, cancel, Duration::from_millis(10))
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_err());
    }
}
