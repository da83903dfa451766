//! Normalization of non-conforming OpenAI-style chunk streams.
//!
//! Compatible servers disagree on small details of the chunk format: a
//! missing space after `data:`, full `message` objects instead of `delta`,
//! empty keep-alive choices, missing or non-zero `index` on the only choice.
//! The fixer rewrites those records into the canonical shape and leaves
//! everything else byte-identical.

use std::borrow::Cow;

use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Normalize a block of decoded SSE text.
///
/// Lines are rewritten only when a rule applies; untouched input is returned
/// borrowed.
#[must_use]
pub fn fix_sse_text(text: &str) -> Cow<'_, str> {
    let mut fixed: Option<String> = None;
    let mut copied_up_to = 0;

    let mut line_start = 0;
    for line in text.split_inclusive('\n') {
        let start = line_start;
        line_start += line.len();

        let body = line.trim_end_matches(['\r', '\n']);
        let ending = &line[body.len()..];
        let Some(raw_payload) = body.strip_prefix("data:") else {
            continue;
        };
        let had_space = raw_payload.starts_with(' ');
        let payload = raw_payload.strip_prefix(' ').unwrap_or(raw_payload);
        let normalized = fix_data_payload(payload);
        let needs_space = !had_space && payload.starts_with('{');
        if !needs_space && matches!(normalized, Cow::Borrowed(_)) {
            continue;
        }

        let buffer = fixed.get_or_insert_with(|| String::with_capacity(text.len() + 16));
        buffer.push_str(&text[copied_up_to..start]);
        buffer.push_str("data: ");
        buffer.push_str(&normalized);
        buffer.push_str(ending);
        copied_up_to = line_start;
    }

    match fixed {
        Some(mut buffer) => {
            buffer.push_str(&text[copied_up_to..]);
            Cow::Owned(buffer)
        }
        None => Cow::Borrowed(text),
    }
}

/// Normalize one `data:` payload.
///
/// Rules applied per choice:
/// - a `message` with no non-empty `delta` is copied into `delta`;
/// - an empty `delta` with no `finish_reason` is a keep-alive and is dropped;
/// - a `finish_reason` with a missing or empty `delta` gets an empty
///   assistant delta;
/// - a single remaining choice always gets `index: 0`.
///
/// Payloads that are not JSON objects (including `[DONE]`) pass through
/// untouched. Malformed JSON is logged and returned as-is for the decoder
/// to skip.
#[must_use]
pub fn fix_data_payload(payload: &str) -> Cow<'_, str> {
    let trimmed = payload.trim();
    if !trimmed.starts_with('{') {
        return Cow::Borrowed(payload);
    }
    let mut value: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, payload_len = payload.len(), "malformed openai data record");
            return Cow::Borrowed(payload);
        }
    };

    if !normalize_chunk(&mut value) {
        return Cow::Borrowed(payload);
    }
    match serde_json::to_string(&value) {
        Ok(rewritten) => Cow::Owned(rewritten),
        Err(err) => {
            warn!(error = %err, "failed to re-serialize normalized chunk");
            Cow::Borrowed(payload)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeltaState {
    Missing,
    Empty,
    Present,
}

fn delta_state(choice: &Map<String, Value>) -> DeltaState {
    match choice.get("delta") {
        None | Some(Value::Null) => DeltaState::Missing,
        Some(Value::Object(delta)) if delta.is_empty() => DeltaState::Empty,
        Some(_) => DeltaState::Present,
    }
}

/// Apply the choice rules in place. Returns `true` if anything changed.
fn normalize_chunk(value: &mut Value) -> bool {
    let Some(choices) = value.get_mut("choices").and_then(Value::as_array_mut) else {
        return false;
    };

    let mut modified = false;
    let mut kept = Vec::with_capacity(choices.len());
    for mut choice in std::mem::take(choices) {
        let Some(fields) = choice.as_object_mut() else {
            kept.push(choice);
            continue;
        };

        if delta_state(fields) != DeltaState::Present {
            if let Some(message) = fields.get("message").filter(|m| m.is_object()).cloned() {
                fields.insert("delta".to_string(), message);
                modified = true;
            }
        }

        let finish_set = fields
            .get("finish_reason")
            .is_some_and(|reason| !reason.is_null());
        match delta_state(fields) {
            DeltaState::Empty if !finish_set => {
                debug!("dropping empty keep-alive choice");
                modified = true;
                continue;
            }
            DeltaState::Missing | DeltaState::Empty if finish_set => {
                fields.insert(
                    "delta".to_string(),
                    serde_json::json!({"role": "assistant", "content": ""}),
                );
                modified = true;
            }
            _ => {}
        }
        kept.push(choice);
    }

    if let [only] = kept.as_mut_slice() {
        if let Some(fields) = only.as_object_mut() {
            let is_zero = fields
                .get("index")
                .and_then(Value::as_u64)
                .is_some_and(|index| index == 0);
            if !is_zero {
                fields.insert("index".to_string(), Value::from(0));
                modified = true;
            }
        }
    }

    *choices = kept;
    modified
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixed_json(payload: &str) -> Value {
        serde_json::from_str(&fix_data_payload(payload)).unwrap()
    }

    #[test]
    fn test_conforming_payload_is_borrowed() {
        let payload = r#"{"id":"c1","choices":[{"index":0,"delta":{"content":"hi"},"finish_reason":null}]}"#;
        assert!(matches!(fix_data_payload(payload), Cow::Borrowed(p) if p == payload));
    }

    #[test]
    fn test_message_copied_into_delta() {
        let value = fixed_json(r#"{"choices":[{"index":0,"message":{"role":"assistant","content":"full"}}]}"#);
        assert_eq!(value["choices"][0]["delta"]["content"], "full");
    }

    #[test]
    fn test_empty_delta_without_finish_is_dropped() {
        let value = fixed_json(r#"{"choices":[{"index":0,"delta":{}}],"usage":null}"#);
        assert_eq!(value["choices"], json!([]));
    }

    #[test]
    fn test_finish_with_missing_delta_gets_empty_delta() {
        let value = fixed_json(r#"{"choices":[{"index":0,"finish_reason":"stop"}]}"#);
        assert_eq!(
            value["choices"][0]["delta"],
            json!({"role": "assistant", "content": ""})
        );
    }

    #[test]
    fn test_single_choice_index_forced_to_zero() {
        let value = fixed_json(r#"{"choices":[{"index":3,"delta":{"content":"x"}}]}"#);
        assert_eq!(value["choices"][0]["index"], 0);
        let value = fixed_json(r#"{"choices":[{"delta":{"content":"x"}}]}"#);
        assert_eq!(value["choices"][0]["index"], 0);
    }

    #[test]
    fn test_done_and_malformed_pass_through() {
        assert!(matches!(fix_data_payload("[DONE]"), Cow::Borrowed("[DONE]")));
        let broken = r#"{"choices":[{"delta":"#;
        assert!(matches!(fix_data_payload(broken), Cow::Borrowed(p) if p == broken));
    }

    #[test]
    fn test_fix_sse_text_adds_space_after_data() {
        let text = "data:{\"choices\":[{\"index\":0,\"delta\":{\"content\":\"a\"}}]}\n\n";
        let fixed = fix_sse_text(text);
        assert_eq!(
            fixed,
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"a\"}}]}\n\n"
        );
    }

    #[test]
    fn test_fix_sse_text_untouched_is_borrowed() {
        let text = ": ping\n\ndata: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"a\"}}]}\r\n\r\ndata: [DONE]\n\n";
        assert!(matches!(fix_sse_text(text), Cow::Borrowed(_)));
    }

    #[test]
    fn test_malformed_record_does_not_stop_later_fixes() {
        let text = "data: {oops\n\ndata: {\"choices\":[{\"index\":2,\"delta\":{\"content\":\"b\"}}]}\n\n";
        let fixed = fix_sse_text(text);
        assert!(fixed.starts_with("data: {oops\n\n"));
        assert!(fixed.contains("\"index\":0"));
    }
}
