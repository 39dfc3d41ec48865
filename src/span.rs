//! # Tracer Capability and Span Handles
//!
//! The engine does not export spans itself; it consumes an opaque tracer
//! capability supplied at install time. This module defines that seam:
//!
//! - **[`Tracer`]**: opens a named span with an initial attribute set.
//! - **[`SpanHandle`]**: the engine's view of an open span. Attributes may be
//!   set repeatedly before close (last write wins), events carry their own
//!   attributes, and exceptions are recorded without being altered.
//! - **[`NoopTracer`]**: discards everything; useful as a default and in
//!   benchmarks.
//!
//! Closing is guaranteed-release: [`SpanHandle::end`] is idempotent, and the
//! last handle for a span ends it on drop, so a panic or a cancelled future
//! still closes the span. An in-memory tracer for assertions lives in
//! [`crate::recording`].

use std::sync::Arc;

use serde_json::Value;

/// Attribute map attached to spans and events. Keys are attribute names,
/// values are arbitrary JSON scalars or structures.
pub type Attributes = serde_json::Map<String, Value>;

/// The consumed tracing capability. Implementations own span storage,
/// sampling, and export; the engine only opens, enriches, and closes.
pub trait Tracer: Send + Sync {
    /// Opens a span with the rendered name and the resolver's initial attributes.
    fn open_span(&self, name: &str, initial: Attributes) -> SpanHandle;
}

/// Backing store for one open span. Implemented by tracer backends;
/// the engine only talks to it through [`SpanHandle`].
pub trait SpanSink: Send + Sync {
    /// Sets or overwrites a single attribute. Last write wins.
    fn set_attribute(&self, key: &str, value: Value);

    /// Attaches a timestamped event with its own attributes.
    fn add_event(&self, name: &str, attributes: Attributes);

    /// Records an exception on the span. Must not alter the error.
    fn record_exception(&self, error: &(dyn std::error::Error + 'static));

    /// Closes the span. Must tolerate being called more than once.
    fn end(&self);
}

/// A clonable handle to one open span.
///
/// All clones write to the same span. The span is closed when [`end`](Self::end)
/// is called or when the last handle is dropped, whichever comes first.
/// Only the call that opened a span holds handles to it; spans are never
/// shared across concurrent calls.
pub struct SpanHandle {
    sink: Arc<dyn SpanSink>,
    token: Arc<()>,
}

impl SpanHandle {
    /// Wraps a backend sink in a handle. Called by [`Tracer`] implementations.
    pub fn new(sink: Arc<dyn SpanSink>) -> Self {
        Self {
            sink,
            token: Arc::new(()),
        }
    }

    /// Sets or overwrites an attribute on the span.
    pub fn set_attribute(&self, key: &str, value: Value) {
        self.sink.set_attribute(key, value);
    }

    /// Attaches an event to the span.
    pub fn add_event(&self, name: &str, attributes: Attributes) {
        self.sink.add_event(name, attributes);
    }

    /// Records an exception on the span without altering it.
    pub fn record_exception(&self, error: &(dyn std::error::Error + 'static)) {
        self.sink.record_exception(error);
    }

    /// Closes the span. Safe to call more than once.
    pub fn end(&self) {
        self.sink.end();
    }
}

impl Clone for SpanHandle {
    fn clone(&self) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            token: Arc::clone(&self.token),
        }
    }
}

impl Drop for SpanHandle {
    fn drop(&mut self) {
        // Last handle out closes the span, so panics and cancelled futures
        // still release it. `end` is idempotent for the explicit-close case.
        if Arc::strong_count(&self.token) == 1 {
            self.sink.end();
        }
    }
}

impl std::fmt::Debug for SpanHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanHandle").finish_non_exhaustive()
    }
}

/// A tracer that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

struct NoopSink;

impl SpanSink for NoopSink {
    fn set_attribute(&self, _key: &str, _value: Value) {}
    fn add_event(&self, _name: &str, _attributes: Attributes) {}
    fn record_exception(&self, _error: &(dyn std::error::Error + 'static)) {}
    fn end(&self) {}
}

impl Tracer for NoopTracer {
    fn open_span(&self, _name: &str, _initial: Attributes) -> SpanHandle {
        SpanHandle::new(Arc::new(NoopSink))
    }
}
