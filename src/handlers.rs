use crate::app::AppState;
use crate::error::{AppError, AppResult};
use crate::relay;
use crate::rewrite;
use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response, Sse};
use serde_json::{Value, json};

/// Header through which Chat UI passes the conversation id for replay.
const CONVERSATION_ID_HEADER: &str = "chatui-conversation-id";

const MODEL_ID: &str = "llamantino";

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn list_models() -> impl IntoResponse {
    Json(json!({
        "object": "list",
        "data": [
            {
                "id": MODEL_ID,
                "object": "model",
                "owned_by": "local",
            }
        ],
    }))
}

/// Chat-completion front: rewrite the request (replay + forced streaming),
/// then hand it to the relay. The response always commits to an SSE stream;
/// once headers are out, backend failures can only be reported in-band as
/// `proxy_error` frames.
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    if !body.is_object() {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "body must be object",
        ));
    }
    let conversation_id = headers
        .get(CONVERSATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    tracing::debug!(conversation_id = %conversation_id, "chat completion accepted");
    metrics::counter!("wattrelay_chat_requests_total").increment(1);

    let payload = rewrite::rewrite_request(state.events.as_ref(), body, &conversation_id).await;
    let stream = relay::forward_stream(state, payload).await;
    Ok(Sse::new(stream).into_response())
}
