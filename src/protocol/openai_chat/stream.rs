use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use crate::config::DecoderConfig;
use crate::protocol::canonical::{OutputEvent, Usage};
use crate::stream::tool_calls::{finalize_entry, probe_arguments};
use crate::stream::{
    CallKey, Completion, SseEvent, StreamDecoder, ThinkingBuffer, ToolCallAccumulator,
    ToolCallEntry,
};
use crate::util::next_call_id;

use super::conformance::fix_data_payload;
use super::{OpenAiDelta, OpenAiStreamChunk, OpenAiStreamChoice, OpenAiStreamToolCall};

/// Parse one `data:` payload after conformance fixing.
///
/// # Errors
///
/// Returns the JSON error when the payload is not a chunk object.
pub fn parse_openai_chunk(data: &str) -> Result<OpenAiStreamChunk, serde_json::Error> {
    let fixed = fix_data_payload(data);
    serde_json::from_str(&fixed)
}

/// Decoder for OpenAI-style chunk streams.
///
/// Text passes straight through; reasoning goes through a small-threshold
/// [`ThinkingBuffer`]; tool-call arguments are accumulated per index with the
/// configured fragment repair and completed on `finish_reason`.
pub struct OpenAiChatStreamDecoder {
    thinking: ThinkingBuffer,
    tools: ToolCallAccumulator,
    announced: FxHashSet<u32>,
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    finished: bool,
}

impl OpenAiChatStreamDecoder {
    #[must_use]
    pub fn new(config: &DecoderConfig) -> Self {
        Self {
            thinking: ThinkingBuffer::new(config.openai_thinking_flush_chars),
            tools: ToolCallAccumulator::new(config.fragment_repair()),
            announced: FxHashSet::default(),
            input_tokens: None,
            output_tokens: None,
            finished: false,
        }
    }

    /// Decode one parsed chunk.
    pub fn decode_chunk(&mut self, chunk: OpenAiStreamChunk, out: &mut Vec<OutputEvent>) {
        if self.finished {
            return;
        }
        if let Some(error) = chunk.error {
            warn!(code = ?error.code_str(), "openai in-band error record");
            self.thinking.close(out);
            out.push(OutputEvent::error(error.kind(), error.message_or_default()));
        }
        if let Some(usage) = chunk.usage {
            if usage.prompt_tokens.is_some() {
                self.input_tokens = usage.prompt_tokens;
            }
            if usage.completion_tokens.is_some() {
                self.output_tokens = usage.completion_tokens;
            }
        }
        for choice in chunk.choices {
            self.decode_choice(choice, out);
        }
    }

    fn decode_choice(&mut self, choice: OpenAiStreamChoice, out: &mut Vec<OutputEvent>) {
        if let Some(index) = choice.index.filter(|index| *index != 0) {
            debug!(index, "ignoring secondary choice");
            return;
        }
        if let Some(delta) = choice.delta.or(choice.message) {
            self.decode_delta(delta, out);
        }
        if let Some(reason) = choice.finish_reason {
            self.on_finish_reason(&reason, out);
        }
    }

    fn decode_delta(&mut self, delta: OpenAiDelta, out: &mut Vec<OutputEvent>) {
        if let Some(reasoning) = delta.reasoning_content {
            self.thinking.push(&reasoning, out);
        }
        if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
            self.thinking.close(out);
            out.push(OutputEvent::text(content));
        }
        if let Some(refusal) = delta.refusal.filter(|r| !r.is_empty()) {
            self.thinking.close(out);
            out.push(OutputEvent::text(refusal));
        }
        if let Some(tool_calls) = delta.tool_calls {
            for (position, call) in tool_calls.into_iter().enumerate() {
                let index = call
                    .index
                    .unwrap_or_else(|| u32::try_from(position).unwrap_or(u32::MAX));
                self.on_tool_call_delta(index, call, out);
            }
        }
    }

    fn on_tool_call_delta(&mut self, index: u32, call: OpenAiStreamToolCall, out: &mut Vec<OutputEvent>) {
        let key = CallKey::Index(index);
        let (name, arguments) = match call.function {
            Some(function) => (function.name, function.arguments),
            None => (None, None),
        };
        if !self.tools.contains(&key) {
            self.thinking.close(out);
        }
        match arguments.filter(|a| !a.is_empty()) {
            Some(arguments) => {
                self.tools
                    .append(key, call.id.as_deref(), name.as_deref(), &arguments);
            }
            None => {
                self.tools.start(key, call.id.as_deref(), name.as_deref());
            }
        }
        self.announce(index, out);
    }

    /// Emit `ToolCallStart` once the call has a name.
    fn announce(&mut self, index: u32, out: &mut Vec<OutputEvent>) {
        if self.announced.contains(&index) {
            return;
        }
        let key = CallKey::Index(index);
        let Some(entry) = self.tools.get(&key) else {
            return;
        };
        if entry.name.is_empty() {
            return;
        }
        let name = entry.name.clone();
        let id = if entry.id.is_empty() {
            let id = next_call_id();
            self.tools.start(key, Some(&id), None);
            id
        } else {
            entry.id.clone()
        };
        self.announced.insert(index);
        out.push(OutputEvent::ToolCallStart { id, name });
    }

    fn on_finish_reason(&mut self, reason: &str, out: &mut Vec<OutputEvent>) {
        match reason {
            "tool_calls" | "function_call" => self.complete_pending(out),
            "stop" if !self.tools.is_empty() => self.complete_pending(out),
            _ => {}
        }
        if reason != "length" {
            self.thinking.close(out);
        }
    }

    /// Complete every pending call in first-seen order.
    fn complete_pending(&mut self, out: &mut Vec<OutputEvent>) {
        self.thinking.close(out);
        for (key, entry) in self.tools.drain() {
            if entry.name.is_empty() {
                warn!(call_id = %entry.id, "skipping tool call without a name");
                continue;
            }
            if let CallKey::Index(index) = key {
                if self.announced.insert(index) {
                    let id = if entry.id.is_empty() {
                        next_call_id()
                    } else {
                        entry.id.clone()
                    };
                    out.push(OutputEvent::ToolCallStart {
                        id: id.clone(),
                        name: entry.name.clone(),
                    });
                    out.push(finalize_entry(ToolCallEntry { id, ..entry }));
                    continue;
                }
            }
            out.push(finalize_entry(entry));
        }
        self.announced.clear();
    }

    fn finish(&mut self, out: &mut Vec<OutputEvent>) {
        if self.finished {
            return;
        }
        self.thinking.close(out);
        // Some servers end the stream without a finish_reason; calls whose
        // arguments already parse are still reported.
        for (_, entry) in self.tools.drain() {
            match probe_arguments(&entry.arguments) {
                Completion::Parsed(_) if !entry.name.is_empty() => out.push(finalize_entry(entry)),
                _ => warn!(
                    call_id = %entry.id,
                    name = %entry.name,
                    "dropping incomplete tool call at stream end"
                ),
            }
        }
        self.finished = true;
        let usage = Usage::new(self.input_tokens, self.output_tokens);
        if !usage.is_empty() {
            out.push(OutputEvent::Usage(usage));
        }
    }
}

impl StreamDecoder for OpenAiChatStreamDecoder {
    fn on_record(&mut self, record: &SseEvent, out: &mut Vec<OutputEvent>) {
        if record.data.trim().is_empty() {
            return;
        }
        match parse_openai_chunk(&record.data) {
            Ok(chunk) => self.decode_chunk(chunk, out),
            Err(err) => {
                warn!(error = %err, data_len = record.data.len(), "skipping malformed openai chunk");
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
            debug!(call_id = %entry.id, "dropping partial tool call on cancel");
        }
    }
}
