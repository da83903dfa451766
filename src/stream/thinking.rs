//! Reasoning ("thinking") buffering shared by all protocol decoders.
//!
//! One buffer lives per response. It opens a thread lazily on the first
//! fragment, emits a `ThinkingDelta` whenever the pending text crosses the
//! protocol's flush threshold, and guarantees a `ThinkingClosed` is emitted
//! before the decoder lets any visible content through.

use crate::protocol::canonical::OutputEvent;
use crate::util::next_thread_id;

#[derive(Debug)]
pub struct ThinkingBuffer {
    thread_id: Option<String>,
    content: String,
    signature: Option<String>,
    flush_threshold: usize,
    saw_reasoning: bool,
}

impl ThinkingBuffer {
    #[must_use]
    pub fn new(flush_threshold: usize) -> Self {
        Self {
            thread_id: None,
            content: String::new(),
            signature: None,
            flush_threshold: flush_threshold.max(1),
            saw_reasoning: false,
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.thread_id.is_some()
    }

    #[must_use]
    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    /// Whether any reasoning fragment was seen during this response.
    #[must_use]
    pub fn saw_reasoning(&self) -> bool {
        self.saw_reasoning
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.content.len()
    }

    /// Start a fresh thread, closing the current one first.
    pub fn open(&mut self, out: &mut Vec<OutputEvent>) {
        self.close(out);
        self.thread_id = Some(next_thread_id());
    }

    /// Append a reasoning fragment, flushing once the threshold is reached.
    pub fn push(&mut self, fragment: &str, out: &mut Vec<OutputEvent>) {
        if fragment.is_empty() {
            return;
        }
        self.saw_reasoning = true;
        if self.thread_id.is_none() {
            self.thread_id = Some(next_thread_id());
        }
        self.content.push_str(fragment);
        if self.content.len() >= self.flush_threshold {
            self.emit_pending(out, false);
        }
    }

    /// Accumulate a signature; it rides on the final emission of the thread.
    pub fn push_signature(&mut self, signature: &str) {
        if signature.is_empty() {
            return;
        }
        self.signature
            .get_or_insert_with(String::new)
            .push_str(signature);
    }

    /// Emit any buffered text without closing the thread.
    pub fn flush(&mut self, out: &mut Vec<OutputEvent>) {
        if !self.content.is_empty() {
            self.emit_pending(out, false);
        }
    }

    /// Emit remaining text (carrying the signature, if any) and close the thread.
    ///
    /// No-op when no thread is open.
    pub fn close(&mut self, out: &mut Vec<OutputEvent>) {
        if self.thread_id.is_none() {
            return;
        }
        if !self.content.is_empty() || self.signature.is_some() {
            self.emit_pending(out, true);
        }
        if let Some(thread_id) = self.thread_id.take() {
            out.push(OutputEvent::ThinkingClosed { thread_id });
        }
        self.signature = None;
    }

    fn emit_pending(&mut self, out: &mut Vec<OutputEvent>, is_final: bool) {
        let Some(thread_id) = self.thread_id.clone() else {
            return;
        };
        let signature = if is_final { self.signature.take() } else { None };
        out.push(OutputEvent::ThinkingDelta {
            text: std::mem::take(&mut self.content),
            thread_id,
            signature,
        });
    }
}
