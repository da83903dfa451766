/// SSE (Server-Sent Events) frame reassembly.
///
/// Turns arbitrarily split network reads into complete SSE records: partial
/// lines and partial UTF-8 sequences are carried over between reads, CRLF and
/// LF line endings are both accepted, and multi-line `data:` fields are
/// joined per the
/// [SSE specification](https://html.spec.whatwg.org/multipage/server-sent-events.html).
use super::SseEvent;
use memchr::memchr_iter;

// ---------------------------------------------------------------------------
// SseParser — incremental SSE line parser
// ---------------------------------------------------------------------------

/// Incremental SSE line parser.
///
/// Feed it text chunks (potentially split at arbitrary points) and it yields
/// fully-assembled [`SseEvent`] records.
pub struct SseParser {
    buffer: String,
    read_offset: usize,
    event_type: Option<String>,
    data_buffer: String,
    has_data: bool,
    last_event_id: Option<String>,
    retry: Option<u64>,
}

impl SseParser {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            read_offset: 0,
            event_type: None,
            data_buffer: String::new(),
            has_data: false,
            last_event_id: None,
            retry: None,
        }
    }

    /// Feed raw text and return any complete events parsed.
    ///
    /// - `event:` sets the event type for the next record
    /// - `data:` appends to the data buffer; one leading space is stripped
    ///   and a missing space is tolerated (`data:{...}`)
    /// - an empty line terminates a record
    /// - `:` lines are comments
    /// - `id:` sets the last event id, `retry:` the reconnection hint
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        let mut out = Vec::new();
        self.feed_into(chunk, &mut out);
        out
    }

    /// Feed raw text and append complete events into a caller-provided buffer.
    pub fn feed_into(&mut self, chunk: &str, out: &mut Vec<SseEvent>) {
        self.buffer.push_str(chunk);
        let mut processed_up_to = self.read_offset;
        let bytes = self.buffer.as_bytes();
        let scan_start = processed_up_to;
        for rel_pos in memchr_iter(b'\n', &bytes[scan_start..]) {
            let line_end = scan_start + rel_pos;
            let mut line = &self.buffer[processed_up_to..line_end];
            if let Some(stripped) = line.strip_suffix('\r') {
                line = stripped;
            }
            Self::process_line(
                line,
                &mut self.event_type,
                &mut self.data_buffer,
                &mut self.has_data,
                &mut self.last_event_id,
                &mut self.retry,
                out,
            );
            processed_up_to = line_end + 1;
        }

        self.read_offset = processed_up_to;
        if self.read_offset == self.buffer.len() {
            self.buffer.clear();
            self.read_offset = 0;
            return;
        }
        let should_compact = self.read_offset > 0
            && (self.read_offset >= self.buffer.len() / 2 || self.read_offset >= 8 * 1024);
        if should_compact {
            self.buffer.drain(..self.read_offset);
            self.read_offset = 0;
        }
    }

    /// Flush at end of input: a trailing unterminated line is processed and a
    /// record still missing its blank-line terminator is dispatched.
    pub fn finish_into(&mut self, out: &mut Vec<SseEvent>) {
        if self.read_offset < self.buffer.len() {
            let tail = self.buffer[self.read_offset..].to_string();
            let line = tail.strip_suffix('\r').unwrap_or(&tail);
            Self::process_line(
                line,
                &mut self.event_type,
                &mut self.data_buffer,
                &mut self.has_data,
                &mut self.last_event_id,
                &mut self.retry,
                out,
            );
        }
        self.buffer.clear();
        self.read_offset = 0;
        Self::process_line(
            "",
            &mut self.event_type,
            &mut self.data_buffer,
            &mut self.has_data,
            &mut self.last_event_id,
            &mut self.retry,
            out,
        );
    }

    fn process_line(
        line: &str,
        event_type: &mut Option<String>,
        data_buffer: &mut String,
        has_data: &mut bool,
        last_event_id: &mut Option<String>,
        retry: &mut Option<u64>,
        events: &mut Vec<SseEvent>,
    ) {
        if line.is_empty() {
            // Empty line = dispatch event
            if *has_data {
                events.push(SseEvent {
                    event: event_type.take(),
                    data: std::mem::take(data_buffer),
                    id: last_event_id.clone(),
                    retry: retry.take(),
                });
                *has_data = false;
            }
            // The event type never outlives a blank line, dispatched or not.
            *event_type = None;
            return;
        }

        if line.starts_with(':') {
            return;
        }

        if let Some(value) = line.strip_prefix("data:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            if *has_data {
                data_buffer.push('\n');
            } else {
                *has_data = true;
            }
            data_buffer.push_str(value);
        } else if let Some(value) = line.strip_prefix("event:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            *event_type = Some(value.to_string());
        } else if let Some(value) = line.strip_prefix("id:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            *last_event_id = Some(value.to_string());
        } else if let Some(value) = line.strip_prefix("retry:") {
            *retry = value.trim().parse::<u64>().ok();
        }
        // Unknown field names are ignored per spec
    }
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// FrameReassembler — bytes in, records out
// ---------------------------------------------------------------------------

/// Byte-level front end for [`SseParser`].
///
/// Network reads may split a multi-byte UTF-8 sequence; the incomplete tail
/// is held back until the next read completes it.
#[derive(Default)]
pub struct FrameReassembler {
    parser: SseParser,
    remainder: Vec<u8>,
}

impl FrameReassembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed_bytes(&mut self, bytes: &[u8], out: &mut Vec<SseEvent>) {
        if self.remainder.is_empty() {
            self.feed_decoded(bytes, out);
            return;
        }
        let mut joined = std::mem::take(&mut self.remainder);
        joined.extend_from_slice(bytes);
        self.feed_decoded(&joined, out);
    }

    /// Flush everything still buffered once the byte stream has ended.
    pub fn finish(&mut self, out: &mut Vec<SseEvent>) {
        if !self.remainder.is_empty() {
            let text = String::from_utf8_lossy(&self.remainder).into_owned();
            self.remainder.clear();
            self.parser.feed_into(&text, out);
        }
        self.parser.finish_into(out);
    }

    fn feed_decoded(&mut self, bytes: &[u8], out: &mut Vec<SseEvent>) {
        match std::str::from_utf8(bytes) {
            Ok(text) => self.parser.feed_into(text, out),
            // Truncated sequence at the end of the read: wait for the rest.
            Err(e) if e.error_len().is_none() => {
                let valid_up_to = e.valid_up_to();
                if let Ok(text) = std::str::from_utf8(&bytes[..valid_up_to]) {
                    self.parser.feed_into(text, out);
                }
                self.remainder.extend_from_slice(&bytes[valid_up_to..]);
            }
            Err(_) => {
                let text = String::from_utf8_lossy(bytes);
                self.parser.feed_into(&text, out);
            }
        }
    }
}

/// Check if an [`SseEvent`] is a terminal `[DONE]` record.
#[must_use]
pub fn is_done_event(event: &SseEvent) -> bool {
    event.data.trim() == "[DONE]"
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
