use crate::events::EventStore;
use crate::history;
use crate::normalize;
use serde_json::{Value, json};

/// Rewrites an inbound chat-completion body before it goes upstream.
///
/// Streaming is forced unconditionally. When the Chat UI supplied a
/// conversation id and the event store has history for it, the caller's
/// `messages` are replaced with the replayed history; otherwise they pass
/// through untouched (the first turn of a conversation has no events yet,
/// and a failing store must not take the request down with it).
pub async fn rewrite_request(
    store: &dyn EventStore,
    mut payload: Value,
    conversation_id: &str,
) -> Value {
    payload["stream"] = Value::Bool(true);

    if conversation_id.is_empty() {
        tracing::debug!("replay skipped: conversation id empty (normal on first message)");
    } else {
        match history::rebuild_history(store, conversation_id).await {
            Ok(messages) if !messages.is_empty() => {
                tracing::debug!(
                    conversation_id,
                    count = messages.len(),
                    "replayed conversation history"
                );
                payload["messages"] = json!(messages);
            }
            Ok(_) => {
                tracing::debug!(conversation_id, "replay found no events");
            }
            Err(err) => {
                tracing::warn!(
                    conversation_id,
                    error = %err,
                    "history unavailable, forwarding caller messages"
                );
            }
        }
    }

    normalize_last_user_message(&mut payload);
    payload
}

// Older Chat UI builds persist user turns with a `User message: "..."`
// wrapper; scrub it from the turn the model is being asked to answer.
fn normalize_last_user_message(payload: &mut Value) {
    let Some(messages) = payload.get_mut("messages").and_then(Value::as_array_mut) else {
        return;
    };
    for message in messages.iter_mut().rev() {
        if message.get("role").and_then(Value::as_str) != Some("user") {
            continue;
        }
        if let Some(object) = message.as_object_mut() {
            let cleaned = object
                .get("content")
                .map(normalize::normalize)
                .unwrap_or_default();
            object.insert("content".to_string(), Value::String(cleaned));
        }
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventStore;
    use serde_json::json;

    #[tokio::test]
    async fn forces_streaming_and_replays_history() {
        let store = MemoryEventStore::default();
        store
            .push("c1", 1, json!({"role": "user", "content": "a"}))
            .await;
        store
            .push("c1", 2, json!({"role": "assistant", "content": "b"}))
            .await;

        let payload = rewrite_request(
            &store,
            json!({"messages": [{"role": "user", "content": "latest"}]}),
            "c1",
        )
        .await;

        assert_eq!(payload["stream"], json!(true));
        assert_eq!(
            payload["messages"],
            json!([
                {"role": "user", "content": "a"},
                {"role": "assistant", "content": "b"},
            ])
        );
    }

    #[tokio::test]
    async fn empty_conversation_id_keeps_caller_messages() {
        let store = MemoryEventStore::default();
        let payload = rewrite_request(
            &store,
            json!({"messages": [{"role": "user", "content": "hello"}], "stream": false}),
            "",
        )
        .await;

        assert_eq!(payload["stream"], json!(true));
        assert_eq!(payload["messages"], json!([{"role": "user", "content": "hello"}]));
    }

    #[tokio::test]
    async fn eventless_conversation_falls_back_to_caller_messages() {
        let store = MemoryEventStore::default();
        let payload = rewrite_request(
            &store,
            json!({"messages": [{"role": "user", "content": "first turn"}]}),
            "fresh",
        )
        .await;

        assert_eq!(payload["stream"], json!(true));
        assert_eq!(
            payload["messages"],
            json!([{"role": "user", "content": "first turn"}])
        );
    }

    #[tokio::test]
    async fn scrubs_legacy_wrapper_from_last_user_turn() {
        let store = MemoryEventStore::default();
        let payload = rewrite_request(
            &store,
            json!({"messages": [
                {"role": "user", "content": "User message: \"keep me\""},
                {"role": "assistant", "content": "User message: untouched"},
            ]}),
            "",
        )
        .await;

        assert_eq!(payload["messages"][0]["content"], json!("keep me"));
        assert_eq!(
            payload["messages"][1]["content"],
            json!("User message: untouched")
        );
    }

    #[tokio::test]
    async fn passthrough_fields_survive_rewrite() {
        let store = MemoryEventStore::default();
        let payload = rewrite_request(
            &store,
            json!({"model": "llamantino", "temperature": 0.2, "messages": []}),
            "",
        )
        .await;

        assert_eq!(payload["model"], json!("llamantino"));
        assert_eq!(payload["temperature"], json!(0.2));
    }
}
