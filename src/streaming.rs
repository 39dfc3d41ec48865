//! # Streaming Recording
//!
//! Turns a sequence of response chunks into a single aggregate enrichment of
//! the parent span. The engine guarantees two things and nothing else: chunks
//! reach the accumulator in arrival order, and finalization happens exactly
//! once, on every exit path. What the aggregate means (token counts,
//! concatenated text) is the [`StreamState`] implementation's business,
//! supplied per integration through the endpoint config.
//!
//! The decorators here compose around the transport's chunk source instead of
//! subclassing it: [`RecordedStream`] wraps any `Stream`, [`RecordedIter`]
//! wraps any `Iterator`. Both feed chunks through a shared
//! [`StreamingRecorder`] and finalize when the sequence ends, when it yields
//! an error (the error still propagates to the caller afterwards), or when
//! the decorator is dropped early, which is how a cancelled async consumer or
//! an abandoned iterator still closes its span.
//!
//! On finalize the recorder measures elapsed wall-clock time from stream open
//! with a monotonic clock, sets `response_data` and `streaming_duration` on
//! the parent span, attaches a
//! `"streaming response from '<model>' took <d>s"` event, and ends the span.
//! Without a parent span (see [`StreamSpanMode::None`](crate::wrap::StreamSpanMode))
//! the same summary is emitted as a log event instead.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::Stream;
use serde_json::{json, Value};
use tower::BoxError;
use tracing::info;

use crate::call::{model_hint, ChunkIter, ChunkStream};
use crate::span::{Attributes, SpanHandle};

/// Provider-specific accumulator for one response stream.
///
/// Constructed at stream start via the endpoint config's factory, fed one
/// chunk at a time in arrival order, and read out exactly once on finalize.
pub trait StreamState: Send {
    /// Folds one chunk into the accumulator.
    fn record_chunk(&mut self, chunk: &Value);

    /// The aggregate response representation for the span's `response_data`
    /// attribute. Called once, after the last chunk (or mid-stream error).
    fn response_data(&self) -> Value;
}

/// Per-stream recording state: accumulator, parent span, timing.
pub struct StreamingRecorder {
    state: Box<dyn StreamState>,
    parent: Option<SpanHandle>,
    model: String,
    started: Instant,
    saw_response_model: bool,
    finalized: bool,
}

impl StreamingRecorder {
    /// Begins recording. `model` is the request's model identifier, used in
    /// the summary event; `parent` is the span to enrich, or `None` for the
    /// span-less mode, which logs the summary instead.
    pub fn begin(
        state: Box<dyn StreamState>,
        parent: Option<SpanHandle>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            state,
            parent,
            model: model.into(),
            started: Instant::now(),
            saw_response_model: false,
            finalized: false,
        }
    }

    /// Feeds one chunk, in arrival order. The first chunk that reveals a
    /// model identifier also sets `response_model` on the parent span.
    pub fn record_chunk(&mut self, chunk: &Value) {
        if chunk.is_null() {
            return;
        }
        if !self.saw_response_model {
            if let (Some(model), Some(parent)) = (model_hint(chunk), self.parent.as_ref()) {
                parent.set_attribute("response_model", Value::from(model));
                self.saw_response_model = true;
            }
        }
        self.state.record_chunk(chunk);
    }

    /// Packages the aggregate into the parent span and ends it. Idempotent so
    /// that explicit finalization and drop-finalization cannot double-report.
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;

        let duration = self.started.elapsed().as_secs_f64();
        let response_data = self.state.response_data();

        match self.parent.take() {
            Some(parent) => {
                parent.set_attribute("response_data", response_data);
                parent.set_attribute("streaming_duration", json!(duration));
                let mut event_attrs = Attributes::new();
                event_attrs.insert("duration".to_string(), json!(duration));
                parent.add_event(
                    &format!(
                        "streaming response from '{}' took {:.2}s",
                        self.model, duration
                    ),
                    event_attrs,
                );
                parent.end();
            }
            None => {
                info!(
                    model = %self.model,
                    duration,
                    response_data = %response_data,
                    "streaming response from '{}' took {:.2}s",
                    self.model,
                    duration
                );
            }
        }
    }
}

impl Drop for StreamingRecorder {
    fn drop(&mut self) {
        self.finalize();
    }
}

/// An async chunk sequence that records every chunk it yields.
pub struct RecordedStream<S> {
    inner: S,
    recorder: StreamingRecorder,
}

impl<S> RecordedStream<S> {
    pub fn new(inner: S, recorder: StreamingRecorder) -> Self {
        Self { inner, recorder }
    }
}

impl<S> Stream for RecordedStream<S>
where
    S: Stream<Item = Result<Value, BoxError>> + Unpin,
{
    type Item = Result<Value, BoxError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.as_mut().get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.recorder.record_chunk(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                // Partial aggregate is still reported; the error goes to the
                // caller untouched after finalize.
                this.recorder.finalize();
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.recorder.finalize();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Wraps an async chunk source so its consumption is recorded.
pub fn record_stream(inner: ChunkStream, recorder: StreamingRecorder) -> ChunkStream {
    Box::pin(RecordedStream::new(inner, recorder))
}

/// The blocking twin of [`RecordedStream`].
pub struct RecordedIter<I> {
    inner: I,
    recorder: StreamingRecorder,
}

impl<I> RecordedIter<I> {
    pub fn new(inner: I, recorder: StreamingRecorder) -> Self {
        Self { inner, recorder }
    }
}

impl<I> Iterator for RecordedIter<I>
where
    I: Iterator<Item = Result<Value, BoxError>>,
{
    type Item = Result<Value, BoxError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.next() {
            Some(Ok(chunk)) => {
                self.recorder.record_chunk(&chunk);
                Some(Ok(chunk))
            }
            Some(Err(err)) => {
                self.recorder.finalize();
                Some(Err(err))
            }
            None => {
                self.recorder.finalize();
                None
            }
        }
    }
}

/// Wraps a blocking chunk source so its consumption is recorded.
pub fn record_iter(inner: ChunkIter, recorder: StreamingRecorder) -> ChunkIter {
    Box::new(RecordedIter::new(inner, recorder))
}
