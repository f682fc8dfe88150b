use crate::app::AppState;
use crate::upstream::{self, UpstreamError};
use axum::response::sse::Event;
use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures_util::{Stream, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;

const DONE_MARKER: &str = "[DONE]";

/// Opens the backend call and relays its SSE stream to the caller frame by
/// frame.
///
/// The returned stream goes straight into `Sse::new`; a spawned producer
/// task owns the backend response and the measurement scope. The bounded
/// channel gives natural backpressure: a slow caller pauses the producer,
/// a disconnected caller fails the send and ends it. Whichever way the
/// producer exits, the scope is stopped exactly once.
pub async fn forward_stream(
    state: AppState,
    payload: Value,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> + Send + 'static {
    let (tx, rx) = mpsc::channel::<String>(64);
    tokio::spawn(async move {
        let scope = match state.tracker.start().await {
            Ok(scope) => Some(scope),
            Err(err) => {
                tracing::warn!(error = %err, "emissions tracker failed to start");
                None
            }
        };

        if let Err(err) = relay_backend(&state, &payload, &tx).await {
            emit_proxy_error(&tx, &err).await;
        }

        if let Some(scope) = scope {
            if let Err(err) = state.tracker.stop(scope).await {
                tracing::warn!(error = %err, "emissions tracker failed to stop");
            }
        }
    });
    tokio_stream::wrappers::ReceiverStream::new(rx).map(|data| Ok(Event::default().data(data)))
}

async fn relay_backend(
    state: &AppState,
    payload: &Value,
    tx: &mpsc::Sender<String>,
) -> Result<(), UpstreamError> {
    let resp = upstream::call_chat_completions_stream(
        &state.http,
        &state.runtime.llama_base_url,
        &state.runtime.llama_api_key,
        payload,
    )
    .await?;
    pump_events(resp.bytes_stream(), tx).await
}

/// Forwards every `data:` payload from the backend verbatim, terminating
/// after the `[DONE]` marker. Keep-alive comments and blank separators never
/// come out of the parser and are dropped. A mid-stream transport or decode
/// failure bubbles up so one synthetic error frame can close the stream.
async fn pump_events<S, E>(byte_stream: S, tx: &mpsc::Sender<String>) -> Result<(), UpstreamError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let mut events = Box::pin(byte_stream.eventsource());
    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                return Err(UpstreamError::network(format!(
                    "stream decode failed: {err}"
                )));
            }
        };
        if event.data.is_empty() {
            continue;
        }
        let done = event.data.trim() == DONE_MARKER;
        if tx.send(event.data).await.is_err() {
            tracing::debug!("caller disconnected, aborting relay");
            return Ok(());
        }
        metrics::counter!("wattrelay_relay_frames_total").increment(1);
        if done {
            break;
        }
    }
    Ok(())
}

async fn emit_proxy_error(tx: &mpsc::Sender<String>, err: &UpstreamError) {
    tracing::warn!(
        status = ?err.status,
        error = %err.message,
        "relay failed, emitting proxy error event"
    );
    metrics::counter!("wattrelay_relay_errors_total").increment(1);
    let body = json!({
        "error": {
            "message": err.message,
            "type": "proxy_error",
        }
    });
    let _ = tx.send(body.to_string()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn chunks(parts: &[&str]) -> Vec<Result<Bytes, std::io::Error>> {
        parts
            .iter()
            .map(|part| Ok(Bytes::from(part.to_string())))
            .collect()
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(frame);
        }
        out
    }

    #[tokio::test]
    async fn forwards_data_frames_and_stops_at_done() {
        let (tx, mut rx) = mpsc::channel(64);
        let input = chunks(&[
            "data: {\"choices\":[]}\n\n",
            "data: [DONE]\n\n",
            "data: after-the-end\n\n",
        ]);
        pump_events(stream::iter(input), &tx).await.unwrap();
        drop(tx);

        let frames = drain(&mut rx);
        assert_eq!(frames, vec!["{\"choices\":[]}", "[DONE]"]);
    }

    #[tokio::test]
    async fn drops_comment_and_blank_lines() {
        let (tx, mut rx) = mpsc::channel(64);
        let input = chunks(&[
            ": keep-alive\n\n",
            "\n",
            "data: one\n\n",
            "data: [DONE]\n\n",
        ]);
        pump_events(stream::iter(input), &tx).await.unwrap();
        drop(tx);

        let frames = drain(&mut rx);
        assert_eq!(frames, vec!["one", "[DONE]"]);
    }

    #[tokio::test]
    async fn split_chunks_reassemble_into_one_frame() {
        let (tx, mut rx) = mpsc::channel(64);
        let input = chunks(&["data: hel", "lo\n\n", "data: [DONE]\n\n"]);
        pump_events(stream::iter(input), &tx).await.unwrap();
        drop(tx);

        let frames = drain(&mut rx);
        assert_eq!(frames, vec!["hello", "[DONE]"]);
    }

    #[tokio::test]
    async fn transport_error_maps_to_network_failure() {
        let (tx, mut rx) = mpsc::channel(64);
        let input: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from("data: one\n\n")),
            Err(std::io::Error::other("connection reset")),
        ];
        let err = pump_events(stream::iter(input), &tx).await.unwrap_err();
        drop(tx);

        assert_eq!(err.kind, crate::upstream::UpstreamErrorKind::Network);
        assert!(err.message.contains("connection reset"));
        // the frame received before the failure was already forwarded
        assert_eq!(drain(&mut rx), vec!["one"]);
    }

    #[tokio::test]
    async fn closed_receiver_ends_pump_without_error() {
        let (tx, rx) = mpsc::channel(64);
        drop(rx);
        let input = chunks(&["data: one\n\n", "data: [DONE]\n\n"]);
        pump_events(stream::iter(input), &tx).await.unwrap();
    }
}
