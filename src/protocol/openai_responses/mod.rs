pub mod stream;

use serde::Deserialize;

use crate::error::ErrorKind;
use crate::protocol::openai_chat::error_kind_from_code;
use crate::stream::SseEvent;

/// Responses API SSE stream event.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ResponsesStreamEvent {
    #[serde(rename = "response.output_text.delta")]
    OutputTextDelta {
        #[serde(default)]
        delta: String,
    },
    #[serde(rename = "response.reasoning_summary_text.delta")]
    ReasoningSummaryTextDelta {
        #[serde(default)]
        delta: String,
    },
    #[serde(rename = "response.reasoning_summary_text.done")]
    ReasoningSummaryTextDone {
        #[serde(default)]
        text: Option<String>,
    },
    #[serde(rename = "response.reasoning_text.delta")]
    ReasoningTextDelta {
        #[serde(default)]
        delta: String,
    },
    #[serde(rename = "response.reasoning_text.done")]
    ReasoningTextDone {
        #[serde(default)]
        text: Option<String>,
    },
    #[serde(rename = "response.output_item.added")]
    OutputItemAdded {
        #[serde(default)]
        output_index: Option<u32>,
        item: ResponsesItem,
    },
    #[serde(rename = "response.output_item.done")]
    OutputItemDone {
        #[serde(default)]
        output_index: Option<u32>,
        item: ResponsesItem,
    },
    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        output_index: Option<u32>,
        #[serde(default)]
        call_id: Option<String>,
        #[serde(default)]
        delta: String,
    },
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        output_index: Option<u32>,
        #[serde(default)]
        call_id: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        arguments: Option<String>,
    },
    #[serde(rename = "response.completed")]
    Completed {
        #[serde(default)]
        response: Option<ResponsesResponseBody>,
    },
    #[serde(rename = "response.incomplete")]
    Incomplete {
        #[serde(default)]
        response: Option<ResponsesResponseBody>,
    },
    #[serde(rename = "response.failed")]
    Failed {
        #[serde(default)]
        response: Option<ResponsesResponseBody>,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        code: Option<serde_json::Value>,
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// An output item as carried by `output_item.added/done`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponsesItem {
    #[serde(rename = "type", default)]
    pub type_: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

impl ResponsesItem {
    #[must_use]
    pub fn is_function_call(&self) -> bool {
        self.type_ == "function_call"
    }

    #[must_use]
    pub fn is_reasoning(&self) -> bool {
        self.type_ == "reasoning"
    }
}

/// The `response` envelope on terminal events.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponsesResponseBody {
    #[serde(default)]
    pub usage: Option<ResponsesUsage>,
    #[serde(default)]
    pub error: Option<ResponsesErrorBody>,
    #[serde(default)]
    pub incomplete_details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ResponsesUsage {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponsesErrorBody {
    #[serde(default)]
    pub code: Option<serde_json::Value>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Classify a Responses error `code`, which may be a string or a number.
#[must_use]
pub fn error_kind_from_value(code: Option<&serde_json::Value>) -> ErrorKind {
    let code = match code {
        Some(serde_json::Value::String(code)) => code.clone(),
        Some(serde_json::Value::Number(code)) => code.to_string(),
        _ => String::new(),
    };
    error_kind_from_code(&code, "")
}

/// Parse one Responses SSE record.
///
/// The payload normally repeats its event name in `type`; when it doesn't,
/// the SSE `event:` name is used instead.
///
/// # Errors
///
/// Returns the JSON error when the payload is not a JSON object or does not
/// match its event's shape.
pub fn parse_responses_record(record: &SseEvent) -> Result<ResponsesStreamEvent, serde_json::Error> {
    let mut value: serde_json::Value = serde_json::from_str(&record.data)?;
    if let (Some(object), Some(event)) = (value.as_object_mut(), record.event.as_deref()) {
        if !object.contains_key("type") {
            object.insert(
                "type".to_string(),
                serde_json::Value::String(event.to_string()),
            );
        }
    }
    serde_json::from_value(value)
}
