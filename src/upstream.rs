use axum::http::StatusCode;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Http,
}

#[derive(Debug, Clone)]
pub struct UpstreamError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub message: String,
}

impl UpstreamError {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: UpstreamErrorKind::Network,
            status: None,
            message: message.into(),
        }
    }

    pub fn http(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            kind: UpstreamErrorKind::Http,
            status: Some(status),
            message: message.into(),
        }
    }
}

/// Opens the streaming chat-completion call against the inference backend.
///
/// No request timeout: generation streams token by token and may legitimately
/// run for minutes. llama.cpp accepts any bearer token, so the key is
/// forwarded unvalidated.
pub async fn call_chat_completions_stream(
    client: &reqwest::Client,
    base_url: &str,
    api_key: &str,
    body: &Value,
) -> Result<reqwest::Response, UpstreamError> {
    let url = join_url(base_url, "v1/chat/completions");
    let resp = client
        .post(url)
        .bearer_auth(api_key)
        .json(body)
        .send()
        .await
        .map_err(|err| UpstreamError::network(err.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(UpstreamError::http(
            status,
            format!("upstream status {}: {}", status, text),
        ));
    }
    Ok(resp)
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{}/{}", base, path)
}
