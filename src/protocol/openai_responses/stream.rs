use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use crate::config::DecoderConfig;
use crate::protocol::canonical::{OutputEvent, Usage};
use crate::stream::tool_calls::finalize_entry;
use crate::stream::{CallKey, SseEvent, StreamDecoder, ThinkingBuffer, ToolCallAccumulator, ToolCallEntry};
use crate::util::next_call_id;

use super::{
    error_kind_from_value, parse_responses_record, ResponsesItem, ResponsesResponseBody,
    ResponsesStreamEvent,
};

/// Which reasoning channel a fragment came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReasoningChannel {
    Summary,
    Full,
}

/// Decoder for Responses-style item/event streams.
///
/// Function calls are keyed by item id. A call is reported when its
/// `output_item.done` arrives; `function_call_arguments.done` only records
/// the final arguments. Each `(call_id, name)` pair is reported once, and
/// events naming an item that already completed are ignored.
pub struct ResponsesStreamDecoder {
    thinking: ThinkingBuffer,
    summary_streamed: bool,
    full_streamed: bool,
    tools: ToolCallAccumulator,
    item_by_output_index: FxHashMap<u32, String>,
    announced: FxHashSet<String>,
    completed_items: FxHashSet<String>,
    arguments_done: FxHashSet<String>,
    reported: FxHashSet<(String, String)>,
    usage: Usage,
    finished: bool,
}

impl ResponsesStreamDecoder {
    #[must_use]
    pub fn new(config: &DecoderConfig) -> Self {
        Self {
            thinking: ThinkingBuffer::new(config.responses_thinking_flush_chars),
            summary_streamed: false,
            full_streamed: false,
            tools: ToolCallAccumulator::plain(),
            item_by_output_index: FxHashMap::default(),
            announced: FxHashSet::default(),
            completed_items: FxHashSet::default(),
            arguments_done: FxHashSet::default(),
            reported: FxHashSet::default(),
            usage: Usage::default(),
            finished: false,
        }
    }

    /// Decode one parsed event.
    pub fn decode_event(&mut self, event: ResponsesStreamEvent, out: &mut Vec<OutputEvent>) {
        if self.finished {
            return;
        }
        match event {
            ResponsesStreamEvent::OutputTextDelta { delta } => {
                self.thinking.close(out);
                if !delta.is_empty() {
                    out.push(OutputEvent::text(delta));
                }
            }
            ResponsesStreamEvent::ReasoningSummaryTextDelta { delta } => {
                self.on_reasoning_delta(ReasoningChannel::Summary, &delta, out);
            }
            ResponsesStreamEvent::ReasoningTextDelta { delta } => {
                self.on_reasoning_delta(ReasoningChannel::Full, &delta, out);
            }
            ResponsesStreamEvent::ReasoningSummaryTextDone { text } => {
                self.on_reasoning_done(ReasoningChannel::Summary, text.as_deref(), out);
            }
            ResponsesStreamEvent::ReasoningTextDone { text } => {
                self.on_reasoning_done(ReasoningChannel::Full, text.as_deref(), out);
            }
            ResponsesStreamEvent::OutputItemAdded { output_index, item } => {
                self.on_item_added(output_index, item, out);
            }
            ResponsesStreamEvent::OutputItemDone { output_index, item } => {
                self.on_item_done(output_index, item, out);
            }
            ResponsesStreamEvent::FunctionCallArgumentsDelta {
                item_id,
                output_index,
                call_id,
                delta,
            } => {
                let Some(key) = self.resolve_item(item_id, output_index, call_id.as_deref()) else {
                    debug!("function_call_arguments.delta without an item reference");
                    return;
                };
                if self.completed_items.contains(&key) {
                    debug!(item_id = %key, "ignoring arguments for a completed function call");
                    return;
                }
                if !self.tools.contains(&CallKey::Id(key.clone())) {
                    self.thinking.close(out);
                }
                self.tools
                    .append(CallKey::Id(key), call_id.as_deref(), None, &delta);
            }
            ResponsesStreamEvent::FunctionCallArgumentsDone {
                item_id,
                output_index,
                call_id,
                name,
                arguments,
            } => {
                let Some(key) = self.resolve_item(item_id, output_index, call_id.as_deref()) else {
                    debug!("function_call_arguments.done without an item reference");
                    return;
                };
                if self.completed_items.contains(&key) {
                    debug!(item_id = %key, "ignoring arguments for a completed function call");
                    return;
                }
                let call_key = CallKey::Id(key.clone());
                self.tools
                    .start(call_key.clone(), call_id.as_deref(), name.as_deref());
                if let Some(arguments) = arguments {
                    self.tools.set_arguments(&call_key, &arguments);
                }
                self.arguments_done.insert(key);
            }
            ResponsesStreamEvent::Completed { response } => {
                self.on_terminal(response.as_ref(), out);
            }
            ResponsesStreamEvent::Incomplete { response } => {
                warn!(
                    details = ?response.as_ref().and_then(|r| r.incomplete_details.as_ref()),
                    "response finished incomplete"
                );
                self.on_terminal(response.as_ref(), out);
            }
            ResponsesStreamEvent::Failed { response } => {
                let error = response.and_then(|r| r.error).unwrap_or_default();
                let message = error
                    .message
                    .unwrap_or_else(|| "response failed".to_string());
                self.fail(error_kind_from_value(error.code.as_ref()), message, out);
            }
            ResponsesStreamEvent::Error { code, message } => {
                let message = message.unwrap_or_else(|| "upstream reported an error".to_string());
                self.fail(error_kind_from_value(code.as_ref()), message, out);
            }
            ResponsesStreamEvent::Unknown => {
                debug!("ignoring unknown responses stream event");
            }
        }
    }

    fn on_reasoning_delta(&mut self, channel: ReasoningChannel, delta: &str, out: &mut Vec<OutputEvent>) {
        match channel {
            ReasoningChannel::Summary => self.summary_streamed = true,
            ReasoningChannel::Full => self.full_streamed = true,
        }
        self.thinking.push(delta, out);
    }

    fn on_reasoning_done(
        &mut self,
        channel: ReasoningChannel,
        text: Option<&str>,
        out: &mut Vec<OutputEvent>,
    ) {
        let streamed = match channel {
            ReasoningChannel::Summary => std::mem::take(&mut self.summary_streamed),
            ReasoningChannel::Full => std::mem::take(&mut self.full_streamed),
        };
        if !streamed {
            if let Some(text) = text {
                self.thinking.push(text, out);
            }
        }
        self.thinking.flush(out);
    }

    fn on_item_added(&mut self, output_index: Option<u32>, item: ResponsesItem, out: &mut Vec<OutputEvent>) {
        if item.is_reasoning() {
            self.thinking.open(out);
            return;
        }
        if !item.is_function_call() {
            return;
        }
        let key = item_key(&item);
        if let Some(index) = output_index {
            self.item_by_output_index.insert(index, key.clone());
        }
        if self.completed_items.contains(&key) {
            return;
        }
        self.thinking.close(out);
        let call_key = CallKey::Id(key.clone());
        self.tools
            .start(call_key.clone(), item.call_id.as_deref(), item.name.as_deref());
        if let Some(arguments) = item.arguments.as_deref().filter(|a| !a.is_empty()) {
            self.tools.set_arguments(&call_key, arguments);
        }
        self.announce(&key, out);
    }

    fn on_item_done(&mut self, output_index: Option<u32>, item: ResponsesItem, out: &mut Vec<OutputEvent>) {
        if item.is_reasoning() {
            self.thinking.close(out);
            return;
        }
        if !item.is_function_call() {
            return;
        }
        let key = self
            .resolve_item(item.id.clone(), output_index, item.call_id.as_deref())
            .unwrap_or_else(|| item_key(&item));
        if !self.completed_items.insert(key.clone()) {
            debug!(item_id = %key, "function call item already completed");
            return;
        }
        let call_key = CallKey::Id(key.clone());
        self.tools
            .start(call_key.clone(), item.call_id.as_deref(), item.name.as_deref());
        if let Some(arguments) = item.arguments.as_deref() {
            self.tools.set_arguments(&call_key, arguments);
        }
        self.arguments_done.remove(&key);
        if let Some(entry) = self.tools.take(&call_key) {
            self.report(&key, entry, out);
        }
    }

    /// Map an event's item reference onto the accumulator key.
    fn resolve_item(
        &self,
        item_id: Option<String>,
        output_index: Option<u32>,
        call_id: Option<&str>,
    ) -> Option<String> {
        item_id
            .filter(|id| !id.is_empty())
            .or_else(|| output_index.and_then(|index| self.item_by_output_index.get(&index).cloned()))
            .or_else(|| call_id.map(str::to_string))
    }

    fn announce(&mut self, key: &str, out: &mut Vec<OutputEvent>) {
        if self.announced.contains(key) {
            return;
        }
        let call_key = CallKey::Id(key.to_string());
        let Some(entry) = self.tools.get(&call_key) else {
            return;
        };
        if entry.name.is_empty() {
            return;
        }
        let name = entry.name.clone();
        let id = if entry.id.is_empty() {
            let id = next_call_id();
            self.tools.start(call_key, Some(&id), None);
            id
        } else {
            entry.id.clone()
        };
        self.announced.insert(key.to_string());
        out.push(OutputEvent::ToolCallStart { id, name });
    }

    fn report(&mut self, key: &str, mut entry: ToolCallEntry, out: &mut Vec<OutputEvent>) {
        if entry.name.is_empty() {
            warn!(item_id = %key, "skipping function call without a name");
            return;
        }
        if entry.id.is_empty() {
            key.clone_into(&mut entry.id);
        }
        if !self
            .reported
            .insert((entry.id.clone(), entry.name.clone()))
        {
            debug!(call_id = %entry.id, name = %entry.name, "function call already reported");
            return;
        }
        self.thinking.close(out);
        if !self.announced.contains(key) {
            self.announced.insert(key.to_string());
            out.push(OutputEvent::ToolCallStart {
                id: entry.id.clone(),
                name: entry.name.clone(),
            });
        }
        out.push(finalize_entry(entry));
    }

    /// Report calls whose arguments finished but whose item never completed.
    fn complete_leftovers(&mut self, out: &mut Vec<OutputEvent>) {
        for (key, entry) in self.tools.drain() {
            let CallKey::Id(key) = key else {
                continue;
            };
            if self.arguments_done.remove(&key) {
                self.completed_items.insert(key.clone());
                self.report(&key, entry, out);
            } else {
                warn!(call_id = %entry.id, name = %entry.name, "dropping incomplete function call");
            }
        }
    }

    fn on_terminal(&mut self, response: Option<&ResponsesResponseBody>, out: &mut Vec<OutputEvent>) {
        if let Some(usage) = response.and_then(|r| r.usage) {
            let mut merged = Usage::new(usage.input_tokens, usage.output_tokens);
            if usage.total_tokens.is_some() {
                merged.total_tokens = usage.total_tokens;
            }
            self.usage = merged;
        }
        self.finish(out);
    }

    fn fail(&mut self, kind: crate::error::ErrorKind, message: String, out: &mut Vec<OutputEvent>) {
        warn!(?kind, message = %message, "responses stream reported failure");
        self.thinking.close(out);
        for (_, entry) in self.tools.drain() {
            debug!(call_id = %entry.id, "dropping function call of failed response");
        }
        self.finished = true;
        out.push(OutputEvent::error(kind, message));
    }

    fn finish(&mut self, out: &mut Vec<OutputEvent>) {
        if self.finished {
            return;
        }
        self.thinking.close(out);
        self.complete_leftovers(out);
        self.finished = true;
        if !self.usage.is_empty() {
            out.push(OutputEvent::Usage(self.usage));
        }
    }
}

/// Accumulator key for a function-call item: its item id, else its call id.
fn item_key(item: &ResponsesItem) -> String {
    item.id
        .clone()
        .filter(|id| !id.is_empty())
        .or_else(|| item.call_id.clone().filter(|id| !id.is_empty()))
        .unwrap_or_else(next_call_id)
}

impl StreamDecoder for ResponsesStreamDecoder {
    fn on_record(&mut self, record: &SseEvent, out: &mut Vec<OutputEvent>) {
        if record.data.trim().is_empty() {
            return;
        }
        match parse_responses_record(record) {
            Ok(event) => self.decode_event(event, out),
            Err(err) => {
                warn!(
                    event = record.event.as_deref().unwrap_or(""),
                    error = %err,
                    "skipping malformed responses record"
                );
            }
        }
    }

    fn on_stream_end(&mut self, out: &mut Vec<OutputEvent>) {
        self.finish(out);
    }

    fn on_cancel(&mut self, out: &mut Vec<OutputEvent>) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.thinking.close(out);
        for (_, entry) in self.tools.drain() {
            debug!(call_id = %entry.id, "dropping partial function call on cancel");
        }
    }
}
