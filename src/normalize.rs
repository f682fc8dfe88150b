use serde_json::Value;

/// Wrapper that older Chat UI builds prepend to user turns before persisting
/// them, e.g. `User message: "hello"`.
const LEGACY_WRAPPER_PREFIX: &str = "User message:";

/// Maps a raw message-content value to a canonical trimmed string.
///
/// Total over all inputs: null becomes the empty string, non-strings fall
/// back to their JSON representation, and strings get the legacy wrapper
/// stripped once.
pub fn normalize(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(text) => normalize_str(text),
        other => other.to_string().trim().to_string(),
    }
}

pub fn normalize_str(content: &str) -> String {
    let mut text = content;
    if let Some(stripped) = text.strip_prefix(LEGACY_WRAPPER_PREFIX) {
        text = stripped.trim();
        // A single matching pair of surrounding quotes belongs to the
        // wrapper, not the message.
        if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') {
            text = &text[1..text.len() - 1];
        }
    }
    text.trim().to_string()
}
