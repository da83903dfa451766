use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::config::DecoderConfig;
use crate::protocol::anthropic::{
    parse_anthropic_record, AnthropicContentBlock, AnthropicDelta, AnthropicStreamEvent,
    AnthropicUsage,
};
use crate::protocol::canonical::{OutputEvent, ToolArguments, Usage};
use crate::stream::tool_calls::finalize_entry;
use crate::stream::{
    CallKey, Completion, SseEvent, StreamDecoder, TextBatcher, ThinkingBuffer,
    ToolCallAccumulator,
};
use crate::util::next_call_id;

/// Per-index content block state.
#[derive(Debug)]
enum BlockState {
    Text,
    Thinking,
    RedactedThinking,
    ToolUse {
        start_input: Option<serde_json::Value>,
        completed: bool,
    },
    Other,
}

/// Decoder for Anthropic named-event streams.
///
/// Text is batched before emission, thinking goes through a
/// [`ThinkingBuffer`], and tool-use input is parsed optimistically after every
/// fragment so a call completes as soon as its JSON closes.
pub struct AnthropicStreamDecoder {
    thinking: ThinkingBuffer,
    text: TextBatcher,
    tools: ToolCallAccumulator,
    blocks: FxHashMap<usize, BlockState>,
    redacted_thinking: Vec<String>,
    placeholder: String,
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    visible_output: bool,
    finished: bool,
}

impl AnthropicStreamDecoder {
    #[must_use]
    pub fn new(config: &DecoderConfig, clock: SharedClock) -> Self {
        Self {
            thinking: ThinkingBuffer::new(config.anthropic_thinking_flush_chars),
            text: TextBatcher::new(config.text_batch_limits(), clock),
            tools: ToolCallAccumulator::plain(),
            blocks: FxHashMap::default(),
            redacted_thinking: Vec::new(),
            placeholder: config.reasoning_placeholder.clone(),
            input_tokens: None,
            output_tokens: None,
            visible_output: false,
            finished: false,
        }
    }

    /// Opaque `redacted_thinking` payloads seen so far, in stream order.
    ///
    /// They are never surfaced as output but must be sent back verbatim on
    /// the next turn.
    #[must_use]
    pub fn redacted_thinking(&self) -> &[String] {
        &self.redacted_thinking
    }

    pub fn take_redacted_thinking(&mut self) -> Vec<String> {
        std::mem::take(&mut self.redacted_thinking)
    }

    /// Decode one parsed event.
    pub fn decode_event(&mut self, event: AnthropicStreamEvent, out: &mut Vec<OutputEvent>) {
        if self.finished {
            return;
        }
        match event {
            AnthropicStreamEvent::MessageStart { message } => {
                if let Some(usage) = message.usage {
                    self.record_usage(usage);
                }
            }
            AnthropicStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => self.on_block_start(index, content_block, out),
            AnthropicStreamEvent::ContentBlockDelta { index, delta } => {
                self.on_block_delta(index, delta, out);
            }
            AnthropicStreamEvent::ContentBlockStop { index } => self.on_block_stop(index, out),
            AnthropicStreamEvent::MessageDelta { delta, usage } => {
                if let Some(usage) = usage {
                    self.record_usage(usage);
                }
                if let Some(reason) = delta.stop_reason {
                    debug!(stop_reason = %reason, "anthropic message delta");
                }
            }
            AnthropicStreamEvent::MessageStop {} => self.finish(out),
            AnthropicStreamEvent::Ping {} => {}
            AnthropicStreamEvent::Error { error } => {
                warn!(error_type = %error.type_, message = %error.message, "anthropic stream error event");
                self.flush_text(out);
                self.thinking.close(out);
                out.push(OutputEvent::error(error.kind(), error.message.clone()));
            }
            AnthropicStreamEvent::Unknown => {
                debug!("ignoring unknown anthropic stream event");
            }
        }
    }

    fn on_block_start(
        &mut self,
        index: usize,
        block: AnthropicContentBlock,
        out: &mut Vec<OutputEvent>,
    ) {
        match block {
            AnthropicContentBlock::Text { text } => {
                self.thinking.close(out);
                self.blocks.insert(index, BlockState::Text);
                self.push_text(&text, out);
            }
            AnthropicContentBlock::Thinking {
                thinking,
                signature,
            } => {
                self.flush_text(out);
                self.thinking.open(out);
                self.thinking.push(&thinking, out);
                if let Some(signature) = signature {
                    self.thinking.push_signature(&signature);
                }
                self.blocks.insert(index, BlockState::Thinking);
            }
            AnthropicContentBlock::RedactedThinking { data } => {
                self.flush_text(out);
                self.redacted_thinking.push(data);
                self.blocks.insert(index, BlockState::RedactedThinking);
            }
            AnthropicContentBlock::ToolUse { id, name, input } => {
                self.flush_text(out);
                self.thinking.close(out);
                let id = if id.is_empty() { next_call_id() } else { id };
                self.tools
                    .start(CallKey::Index(block_key(index)), Some(&id), Some(&name));
                self.visible_output = true;
                out.push(OutputEvent::ToolCallStart { id, name });
                self.blocks.insert(
                    index,
                    BlockState::ToolUse {
                        start_input: input,
                        completed: false,
                    },
                );
            }
            AnthropicContentBlock::Unknown => {
                debug!(index, "ignoring unknown anthropic content block type");
                self.blocks.insert(index, BlockState::Other);
            }
        }
    }

    fn on_block_delta(&mut self, index: usize, delta: AnthropicDelta, out: &mut Vec<OutputEvent>) {
        match delta {
            AnthropicDelta::TextDelta { text } => {
                self.thinking.close(out);
                self.push_text(&text, out);
            }
            AnthropicDelta::ThinkingDelta { thinking } => {
                self.flush_text(out);
                self.thinking.push(&thinking, out);
            }
            AnthropicDelta::SignatureDelta { signature } => {
                self.thinking.push_signature(&signature);
            }
            AnthropicDelta::InputJsonDelta { partial_json } => {
                self.on_input_json(index, &partial_json, out);
            }
            AnthropicDelta::Unknown => {
                debug!(index, "ignoring unknown anthropic delta type");
            }
        }
    }

    fn on_input_json(&mut self, index: usize, fragment: &str, out: &mut Vec<OutputEvent>) {
        let state = self.blocks.entry(index).or_insert(BlockState::ToolUse {
            start_input: None,
            completed: false,
        });
        let BlockState::ToolUse { completed, .. } = state else {
            debug!(index, "input_json_delta on a non tool_use block");
            return;
        };
        if *completed {
            debug!(index, "ignoring input_json_delta after tool call completed");
            return;
        }

        let key = CallKey::Index(block_key(index));
        self.tools.append(key.clone(), None, None, fragment);
        let has_content = self
            .tools
            .get(&key)
            .is_some_and(|entry| !entry.arguments.trim().is_empty());
        if !has_content {
            return;
        }
        if let Completion::Parsed(value) = self.tools.try_complete(&key) {
            if let Some(entry) = self.tools.take(&key) {
                *completed = true;
                self.visible_output = true;
                out.push(OutputEvent::ToolCallComplete {
                    id: entry.id,
                    name: entry.name,
                    arguments: ToolArguments::Parsed(value),
                });
            }
        }
    }

    fn on_block_stop(&mut self, index: usize, out: &mut Vec<OutputEvent>) {
        match self.blocks.remove(&index) {
            Some(BlockState::Text) => self.flush_text(out),
            Some(BlockState::Thinking) => self.thinking.close(out),
            Some(BlockState::ToolUse {
                start_input,
                completed: false,
            }) => {
                let Some(mut entry) = self.tools.take(&CallKey::Index(block_key(index))) else {
                    return;
                };
                self.visible_output = true;
                if entry.arguments.trim().is_empty() {
                    let arguments = start_input
                        .filter(|value| !value.is_null())
                        .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()));
                    out.push(OutputEvent::ToolCallComplete {
                        id: std::mem::take(&mut entry.id),
                        name: std::mem::take(&mut entry.name),
                        arguments: ToolArguments::Parsed(arguments),
                    });
                } else {
                    out.push(finalize_entry(entry));
                }
            }
            Some(
                BlockState::ToolUse {
                    completed: true, ..
                }
                | BlockState::RedactedThinking
                | BlockState::Other,
            )
            | None => {}
        }
    }

    fn record_usage(&mut self, usage: AnthropicUsage) {
        if let Some(input) = usage.input_tokens {
            let cached = usage
                .cache_creation_input_tokens
                .unwrap_or(0)
                .saturating_add(usage.cache_read_input_tokens.unwrap_or(0));
            self.input_tokens = Some(input.saturating_add(cached));
        }
        if usage.output_tokens.is_some() {
            self.output_tokens = usage.output_tokens;
        }
    }

    fn push_text(&mut self, text: &str, out: &mut Vec<OutputEvent>) {
        for chunk in self.text.push(text) {
            self.emit_text(chunk, out);
        }
    }

    fn flush_text(&mut self, out: &mut Vec<OutputEvent>) {
        if let Some(chunk) = self.text.flush() {
            self.emit_text(chunk, out);
        }
    }

    fn emit_text(&mut self, chunk: String, out: &mut Vec<OutputEvent>) {
        self.visible_output = true;
        out.push(OutputEvent::text(chunk));
    }

    fn drop_pending_tool_calls(&mut self, reason: &str) {
        for (_, entry) in self.tools.drain() {
            warn!(
                call_id = %entry.id,
                name = %entry.name,
                reason,
                "dropping incomplete tool call"
            );
        }
        self.blocks.clear();
    }

    fn finish(&mut self, out: &mut Vec<OutputEvent>) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.flush_text(out);
        self.thinking.close(out);
        self.drop_pending_tool_calls("stream ended");

        let had_reasoning = self.thinking.saw_reasoning() || !self.redacted_thinking.is_empty();
        if had_reasoning && !self.visible_output {
            debug!("reasoning-only response; emitting placeholder text");
            out.push(OutputEvent::text(self.placeholder.clone()));
        }

        let usage = Usage::new(self.input_tokens, self.output_tokens);
        if !usage.is_empty() {
            out.push(OutputEvent::Usage(usage));
        }
    }
}

/// Tool-use blocks are keyed by their content block index.
fn block_key(index: usize) -> u32 {
    u32::try_from(index).unwrap_or(u32::MAX)
}

impl StreamDecoder for AnthropicStreamDecoder {
    fn on_record(&mut self, record: &SseEvent, out: &mut Vec<OutputEvent>) {
        if record.data.trim().is_empty() {
            return;
        }
        match parse_anthropic_record(record) {
            Ok(event) => self.decode_event(event, out),
            Err(err) => {
                warn!(
                    event = record.event.as_deref().unwrap_or(""),
                    error = %err,
                    "skipping malformed anthropic record"
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
        self.flush_text(out);
        self.thinking.close(out);
        self.drop_pending_tool_calls("cancelled");
    }
}
