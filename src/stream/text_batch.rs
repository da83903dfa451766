use std::time::{Duration, Instant};

use crate::clock::SharedClock;

/// Flush thresholds for [`TextBatcher`].
#[derive(Debug, Clone, Copy)]
pub struct TextBatchLimits {
    pub max_words: usize,
    pub max_chars: usize,
    pub max_interval: Duration,
}

impl Default for TextBatchLimits {
    fn default() -> Self {
        Self {
            max_words: 20,
            max_chars: 160,
            max_interval: Duration::from_millis(200),
        }
    }
}

/// Coalesces token-sized text deltas into UI-sized chunks.
///
/// A chunk is released once it holds `max_words` words or `max_chars`
/// characters, or once `max_interval` has passed since the previous release,
/// whichever comes first.
pub struct TextBatcher {
    buffer: String,
    char_count: usize,
    limits: TextBatchLimits,
    clock: SharedClock,
    last_flush: Instant,
}

impl TextBatcher {
    #[must_use]
    pub fn new(limits: TextBatchLimits, clock: SharedClock) -> Self {
        let last_flush = clock.now();
        Self {
            buffer: String::new(),
            char_count: 0,
            limits,
            clock,
            last_flush,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Buffer `text`, returning the chunks that became ready.
    ///
    /// Characters are fed one at a time against the char limit so a single
    /// large delta is split into `max_chars`-sized chunks.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        let mut ready = Vec::new();
        if text.is_empty() {
            return ready;
        }
        for ch in text.chars() {
            self.buffer.push(ch);
            self.char_count += 1;
            if self.char_count >= self.limits.max_chars {
                ready.push(self.take());
            }
        }
        if !self.buffer.is_empty()
            && (self.word_count() >= self.limits.max_words || self.interval_elapsed())
        {
            ready.push(self.take());
        }
        ready
    }

    /// Release whatever is buffered.
    pub fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.take())
        }
    }

    fn word_count(&self) -> usize {
        self.buffer.split_whitespace().count()
    }

    fn interval_elapsed(&self) -> bool {
        self.clock.now().saturating_duration_since(self.last_flush) >= self.limits.max_interval
    }

    fn take(&mut self) -> String {
        self.char_count = 0;
        self.last_flush = self.clock.now();
        std::mem::take(&mut self.buffer)
    }
}
