use serde::{Serialize, Serializer};

use crate::error::ErrorKind;
use crate::transport::rate_limit::RateLimitSnapshot;

/// Which upstream wire protocol a stream speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Anthropic,
    OpenAiChat,
    OpenAiResponses,
}

impl Protocol {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Anthropic => "anthropic",
            Protocol::OpenAiChat => "openai",
            Protocol::OpenAiResponses => "openai-responses",
        }
    }

    /// Parse the protocol names accepted in config files and on the command line.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "anthropic" => Some(Protocol::Anthropic),
            "openai" | "openai-chat" => Some(Protocol::OpenAiChat),
            "openai-responses" | "responses" => Some(Protocol::OpenAiResponses),
            _ => None,
        }
    }
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

impl Usage {
    #[must_use]
    pub fn new(input_tokens: Option<u64>, output_tokens: Option<u64>) -> Self {
        let total_tokens = match (input_tokens, output_tokens) {
            (None, None) => None,
            (input, output) => Some(input.unwrap_or(0).saturating_add(output.unwrap_or(0))),
        };
        Self {
            input_tokens,
            output_tokens,
            total_tokens,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.input_tokens.is_none() && self.output_tokens.is_none() && self.total_tokens.is_none()
    }
}

/// Materialized arguments of a completed tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolArguments {
    Parsed(serde_json::Value),
    /// Arguments that never became valid JSON; reported as `{"raw": "..."}`.
    Raw(String),
}

impl ToolArguments {
    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            ToolArguments::Parsed(value) => value.clone(),
            ToolArguments::Raw(raw) => serde_json::json!({ "raw": raw }),
        }
    }

    #[must_use]
    pub fn to_json_string(&self) -> String {
        match self {
            ToolArguments::Parsed(value) => value.to_string(),
            ToolArguments::Raw(_) => self.to_value().to_string(),
        }
    }

    #[must_use]
    pub fn is_raw(&self) -> bool {
        matches!(self, ToolArguments::Raw(_))
    }
}

impl Serialize for ToolArguments {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ToolArguments::Parsed(value) => value.serialize(serializer),
            ToolArguments::Raw(_) => self.to_value().serialize(serializer),
        }
    }
}

/// One canonical output event, independent of the upstream protocol.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputEvent {
    TextDelta {
        text: String,
    },
    ThinkingDelta {
        text: String,
        thread_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ThinkingClosed {
        thread_id: String,
    },
    ToolCallStart {
        id: String,
        name: String,
    },
    ToolCallComplete {
        id: String,
        name: String,
        arguments: ToolArguments,
    },
    Usage(Usage),
    Error {
        kind: ErrorKind,
        message: String,
    },
    RateLimits(RateLimitSnapshot),
    AccountRotated {
        account_id: String,
    },
}

impl OutputEvent {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        OutputEvent::TextDelta { text: text.into() }
    }

    #[must_use]
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        OutputEvent::Error {
            kind,
            message: message.into(),
        }
    }

    /// Whether this event is visible assistant output (text or a tool call).
    #[must_use]
    pub fn is_visible_content(&self) -> bool {
        matches!(
            self,
            OutputEvent::TextDelta { .. }
                | OutputEvent::ToolCallStart { .. }
                | OutputEvent::ToolCallComplete { .. }
        )
    }
}
