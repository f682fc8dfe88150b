use crate::events::{EventStore, EventStoreError};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Stored event shapes vary across Chat UI builds: role/content may live at
/// the top level or nested under `message` or `data`. Each extractor handles
/// one shape; the first that resolves a content value wins.
type Extractor = fn(&Value) -> Option<(String, Value)>;

const EXTRACTORS: &[Extractor] = &[extract_top_level, extract_message, extract_data];

fn extract_top_level(payload: &Value) -> Option<(String, Value)> {
    let content = payload.get("content").filter(|v| !v.is_null())?;
    let role = top_level_role(payload)?;
    Some((role, content.clone()))
}

fn extract_message(payload: &Value) -> Option<(String, Value)> {
    extract_nested(payload, "message")
}

fn extract_data(payload: &Value) -> Option<(String, Value)> {
    extract_nested(payload, "data")
}

fn extract_nested(payload: &Value, key: &str) -> Option<(String, Value)> {
    let nested = payload.get(key)?.as_object()?;
    let content = nested.get("content").filter(|v| !v.is_null())?;
    // The top-level role still wins when both are present.
    let role = top_level_role(payload).or_else(|| nested_role(nested))?;
    Some((role, content.clone()))
}

fn top_level_role(payload: &Value) -> Option<String> {
    payload
        .get("role")
        .and_then(Value::as_str)
        .filter(|role| !role.is_empty())
        .map(str::to_string)
}

fn nested_role(nested: &serde_json::Map<String, Value>) -> Option<String> {
    nested
        .get("role")
        .and_then(Value::as_str)
        .filter(|role| !role.is_empty())
        .map(str::to_string)
}

/// Resolves `(role, content)` from one stored event, or `None` when the
/// event carries neither a usable role nor content and must be dropped.
pub fn extract_role_content(payload: &Value) -> Option<(String, String)> {
    for extract in EXTRACTORS {
        if let Some((role, content)) = extract(payload) {
            return Some((role, coerce_content(&content)));
        }
    }
    None
}

// Coercion only; wrapper stripping happens once at rewrite time, on the
// outbound last user message.
fn coerce_content(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Rebuilds the ordered message list for a conversation from its persisted
/// events. An unknown or eventless conversation yields an empty list, which
/// callers treat as "no replay available", not as an error.
pub async fn rebuild_history(
    store: &dyn EventStore,
    conversation_id: &str,
) -> Result<Vec<ChatMessage>, EventStoreError> {
    if conversation_id.is_empty() {
        return Ok(Vec::new());
    }
    let events = store.list_events(conversation_id).await?;
    let mut messages = Vec::with_capacity(events.len());
    for event in &events {
        match extract_role_content(&event.payload) {
            Some((role, content)) => messages.push(ChatMessage { role, content }),
            None => {
                tracing::debug!(
                    conversation_id,
                    created_at = event.created_at,
                    "dropping event without resolvable role/content"
                );
            }
        }
    }
    Ok(messages)
}
