pub mod sse;
pub mod text_batch;
pub mod thinking;
pub mod tool_calls;

pub use sse::{is_done_event, FrameReassembler, SseParser};
pub use text_batch::{TextBatchLimits, TextBatcher};
pub use thinking::ThinkingBuffer;
pub use tool_calls::{
    CallKey, Completion, DuplicateFragmentRepair, FragmentRepair, PlainAppend,
    ToolCallAccumulator, ToolCallEntry,
};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::observability::log_response_complete;
use crate::protocol::canonical::{OutputEvent, Protocol, Usage};

/// A parsed SSE record from the upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

impl SseEvent {
    /// Convenience constructor for a record with an optional event name.
    #[must_use]
    pub fn new(event: Option<&str>, data: impl Into<String>) -> Self {
        Self {
            event: event.map(str::to_string),
            data: data.into(),
            id: None,
            retry: None,
        }
    }
}

/// Network body as seen by the decode loop.
pub type ByteStream = BoxStream<'static, Result<Bytes, BridgeError>>;

/// Ordered canonical output of one response.
pub type OutputStream = BoxStream<'static, OutputEvent>;

/// Shared contract of the per-protocol decoders.
///
/// Decoders are single-pass and stateful. Malformed records are logged and
/// skipped; none of these methods can fail.
pub trait StreamDecoder: Send {
    /// Consume one SSE record.
    fn on_record(&mut self, record: &SseEvent, out: &mut Vec<OutputEvent>);

    /// The upstream finished (terminal record or end of body).
    fn on_stream_end(&mut self, out: &mut Vec<OutputEvent>);

    /// The caller cancelled. Buffered text and thinking are flushed; partial
    /// tool calls are dropped, never force-completed.
    fn on_cancel(&mut self, out: &mut Vec<OutputEvent>);
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation signal shared between a caller and a request.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once [`CancelToken::cancel`] has been called.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

// ---------------------------------------------------------------------------
// Record pump: reassembler + terminal-record handling around one decoder
// ---------------------------------------------------------------------------

/// Drives a decoder from raw bytes.
///
/// Records after the terminal `[DONE]` are ignored, and every end path
/// (done record, end of body, cancellation) reaches the decoder exactly once.
pub struct RecordPump {
    reassembler: FrameReassembler,
    records: Vec<SseEvent>,
    finished: bool,
}

impl RecordPump {
    #[must_use]
    pub fn new() -> Self {
        Self {
            reassembler: FrameReassembler::new(),
            records: Vec::with_capacity(8),
            finished: false,
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn feed(&mut self, bytes: &[u8], decoder: &mut dyn StreamDecoder, out: &mut Vec<OutputEvent>) {
        if self.finished {
            return;
        }
        self.reassembler.feed_bytes(bytes, &mut self.records);
        self.dispatch(decoder, out);
    }

    pub fn finish(&mut self, decoder: &mut dyn StreamDecoder, out: &mut Vec<OutputEvent>) {
        if self.finished {
            return;
        }
        self.reassembler.finish(&mut self.records);
        self.dispatch(decoder, out);
        if !self.finished {
            self.finished = true;
            decoder.on_stream_end(out);
        }
    }

    pub fn cancel(&mut self, decoder: &mut dyn StreamDecoder, out: &mut Vec<OutputEvent>) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.records.clear();
        decoder.on_cancel(out);
    }

    fn dispatch(&mut self, decoder: &mut dyn StreamDecoder, out: &mut Vec<OutputEvent>) {
        for record in self.records.drain(..) {
            if self.finished {
                debug!(data_len = record.data.len(), "ignoring record after terminal [DONE]");
                continue;
            }
            if is_done_event(&record) {
                self.finished = true;
                decoder.on_stream_end(out);
                continue;
            }
            decoder.on_record(&record, out);
        }
    }
}

impl Default for RecordPump {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode an in-memory sequence of byte chunks to completion.
pub fn decode_chunks<I, B>(decoder: &mut dyn StreamDecoder, chunks: I) -> Vec<OutputEvent>
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut pump = RecordPump::new();
    let mut out = Vec::new();
    for chunk in chunks {
        pump.feed(chunk.as_ref(), decoder, &mut out);
    }
    pump.finish(decoder, &mut out);
    out
}

// ---------------------------------------------------------------------------
// Async pull loop
// ---------------------------------------------------------------------------

struct DecodeLoop {
    body: Option<ByteStream>,
    pump: RecordPump,
    decoder: Box<dyn StreamDecoder>,
    cancel: CancelToken,
    pending: VecDeque<OutputEvent>,
    scratch: Vec<OutputEvent>,
    protocol: Protocol,
    usage: Usage,
    started: Instant,
}

enum Pulled {
    Chunk(Bytes),
    Failed(BridgeError),
    Ended,
    Cancelled,
}

impl DecodeLoop {
    async fn pull(&mut self) -> Pulled {
        let Some(body) = self.body.as_mut() else {
            return Pulled::Ended;
        };
        if self.cancel.is_cancelled() {
            return Pulled::Cancelled;
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Pulled::Cancelled,
            next = body.next() => match next {
                Some(Ok(bytes)) => Pulled::Chunk(bytes),
                Some(Err(err)) => Pulled::Failed(err),
                None => Pulled::Ended,
            },
        }
    }

    fn stash(&mut self) {
        for event in self.scratch.drain(..) {
            if let OutputEvent::Usage(usage) = &event {
                self.usage = *usage;
            }
            self.pending.push_back(event);
        }
    }

    async fn next_event(&mut self) -> Option<OutputEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.pump.is_finished() {
                if self.body.take().is_some() {
                    log_response_complete(self.protocol, &self.usage, self.started);
                }
                return None;
            }
            match self.pull().await {
                Pulled::Chunk(bytes) => {
                    self.pump
                        .feed(&bytes, self.decoder.as_mut(), &mut self.scratch);
                }
                Pulled::Ended => {
                    self.pump.finish(self.decoder.as_mut(), &mut self.scratch);
                }
                Pulled::Cancelled => {
                    debug!(protocol = self.protocol.as_str(), "stream cancelled by caller");
                    // Dropping the body aborts the underlying request.
                    self.body = None;
                    self.pump.cancel(self.decoder.as_mut(), &mut self.scratch);
                }
                Pulled::Failed(err) => {
                    warn!(protocol = self.protocol.as_str(), error = %err, "upstream stream failed");
                    self.pump.cancel(self.decoder.as_mut(), &mut self.scratch);
                    self.scratch
                        .push(OutputEvent::error(err.kind(), err.to_string()));
                }
            }
            self.stash();
        }
    }
}

/// Run the sequential pull loop over one response body.
///
/// The returned stream is lazy, ordered, and finite. Cancellation is checked
/// before each read and raced against it; transport failures flush buffered
/// output and end the stream with a single `Error` event.
pub fn decode_sse_stream(
    body: ByteStream,
    decoder: Box<dyn StreamDecoder>,
    cancel: CancelToken,
    protocol: Protocol,
) -> OutputStream {
    let state = DecodeLoop {
        body: Some(body),
        pump: RecordPump::new(),
        decoder,
        cancel,
        pending: VecDeque::new(),
        scratch: Vec::with_capacity(8),
        protocol,
        usage: Usage::default(),
        started: Instant::now(),
    };
    futures_util::stream::unfold(state, |mut state| async move {
        let event = state.next_event().await?;
        Some((event, state))
    })
    .boxed()
}
