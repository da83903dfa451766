pub mod conformance;
pub mod stream;

use serde::Deserialize;

use crate::error::ErrorKind;

/// A streaming chunk.
///
/// Every field is optional: compatible upstreams routinely omit `id`,
/// `model`, or `index`, and some send a final usage-only chunk with no
/// choices at all.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenAiStreamChunk {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    pub usage: Option<OpenAiUsage>,
    #[serde(default)]
    pub error: Option<OpenAiErrorBody>,
}

/// A choice within a stream chunk.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenAiStreamChoice {
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub delta: Option<OpenAiDelta>,
    /// Legacy non-delta shape sent by some compatible servers.
    #[serde(default)]
    pub message: Option<OpenAiDelta>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Delta content within a stream choice.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenAiDelta {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub reasoning_content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<OpenAiStreamToolCall>>,
    #[serde(default)]
    pub refusal: Option<String>,
}

/// A tool call delta in streaming.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenAiStreamToolCall {
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<OpenAiStreamToolCallFunction>,
}

/// Function delta within a streaming tool call.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenAiStreamToolCallFunction {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

/// Usage info; cumulative across chunks.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct OpenAiUsage {
    #[serde(default)]
    pub prompt_tokens: Option<u64>,
    #[serde(default)]
    pub completion_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
}

/// In-band `{"error": {...}}` payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenAiErrorBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(rename = "type", default)]
    pub type_: Option<String>,
    #[serde(default)]
    pub code: Option<serde_json::Value>,
}

impl OpenAiErrorBody {
    #[must_use]
    pub fn code_str(&self) -> Option<String> {
        match &self.code {
            Some(serde_json::Value::String(code)) => Some(code.clone()),
            Some(serde_json::Value::Number(code)) => Some(code.to_string()),
            _ => None,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        let code = self.code_str().unwrap_or_default();
        let type_ = self.type_.as_deref().unwrap_or_default();
        error_kind_from_code(&code, type_)
    }

    #[must_use]
    pub fn message_or_default(&self) -> String {
        self.message
            .clone()
            .filter(|message| !message.is_empty())
            .unwrap_or_else(|| "upstream reported an error".to_string())
    }
}

/// Classify an OpenAI-family error `code`/`type` pair.
#[must_use]
pub fn error_kind_from_code(code: &str, type_: &str) -> ErrorKind {
    match (code, type_) {
        ("rate_limit_exceeded" | "usage_limit_reached" | "insufficient_quota" | "429", _)
        | (_, "rate_limit_error" | "insufficient_quota" | "usage_limit_reached") => {
            ErrorKind::RateLimited
        }
        ("invalid_api_key" | "401" | "403", _)
        | (_, "authentication_error" | "permission_error") => ErrorKind::AuthInvalid,
        ("server_is_overloaded" | "slow_down" | "503", _) => ErrorKind::Transient,
        (_, "invalid_request_error") | ("invalid_prompt" | "context_length_exceeded", _) => {
            ErrorKind::InvalidRequest
        }
        _ => ErrorKind::ServerError,
    }
}
