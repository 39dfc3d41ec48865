//! # In-Memory Span Recording
//!
//! A [`Tracer`] implementation that keeps every opened span in memory so tests
//! and local tooling can assert on names, attributes, events, and close state
//! without a tracing backend. This is the engine's equivalent of a scripted
//! mock provider: public on purpose, so downstream integrations can test their
//! resolvers and stream states against it.
//!
//! ### Example
//!
//! ```rust
//! use llm_intercept::recording::RecordingTracer;
//! use llm_intercept::span::{Attributes, Tracer};
//!
//! let tracer = RecordingTracer::new();
//! let span = tracer.open_span("Call x", Attributes::new());
//! span.set_attribute("model", serde_json::json!("x"));
//! span.end();
//!
//! let spans = tracer.spans();
//! assert_eq!(spans.len(), 1);
//! assert_eq!(spans[0].name, "Call x");
//! assert!(spans[0].is_ended());
//! ```

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::span::{Attributes, SpanHandle, SpanSink, Tracer};

/// A timestamped event captured on a recorded span.
#[derive(Debug, Clone, Serialize)]
pub struct RecordedEvent {
    pub name: String,
    pub attributes: Attributes,
    pub time: DateTime<Utc>,
}

/// A snapshot of one span captured by [`RecordingTracer`].
#[derive(Debug, Clone, Serialize)]
pub struct RecordedSpan {
    /// Unique identifier for the span (UUIDv4).
    pub id: String,
    /// The rendered span name.
    pub name: String,
    /// Attribute state at snapshot time. Last write per key wins.
    pub attributes: Attributes,
    /// Events in attachment order.
    pub events: Vec<RecordedEvent>,
    /// Display form of the recorded exception, if any.
    pub exception: Option<String>,
    /// When the span was opened.
    pub start_time: DateTime<Utc>,
    /// When the span was first closed, if it has been.
    pub end_time: Option<DateTime<Utc>>,
}

impl RecordedSpan {
    /// Whether the span has been closed.
    pub fn is_ended(&self) -> bool {
        self.end_time.is_some()
    }

    /// Convenience accessor for a single attribute.
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }
}

#[derive(Debug)]
struct RecordingState {
    name: String,
    attributes: Attributes,
    events: Vec<RecordedEvent>,
    exception: Option<String>,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct RecordingSink {
    id: String,
    state: Mutex<RecordingState>,
}

impl RecordingSink {
    fn snapshot(&self) -> RecordedSpan {
        let state = self.state.lock().unwrap();
        RecordedSpan {
            id: self.id.clone(),
            name: state.name.clone(),
            attributes: state.attributes.clone(),
            events: state.events.clone(),
            exception: state.exception.clone(),
            start_time: state.start_time,
            end_time: state.end_time,
        }
    }
}

impl SpanSink for RecordingSink {
    fn set_attribute(&self, key: &str, value: Value) {
        let mut state = self.state.lock().unwrap();
        state.attributes.insert(key.to_string(), value);
    }

    fn add_event(&self, name: &str, attributes: Attributes) {
        let mut state = self.state.lock().unwrap();
        state.events.push(RecordedEvent {
            name: name.to_string(),
            attributes,
            time: Utc::now(),
        });
    }

    fn record_exception(&self, error: &(dyn std::error::Error + 'static)) {
        let mut state = self.state.lock().unwrap();
        state.exception = Some(error.to_string());
    }

    fn end(&self) {
        let mut state = self.state.lock().unwrap();
        if state.end_time.is_none() {
            state.end_time = Some(Utc::now());
        }
    }
}

/// A [`Tracer`] that captures spans in memory, in open order.
#[derive(Debug, Clone, Default)]
pub struct RecordingTracer {
    sinks: Arc<Mutex<Vec<Arc<RecordingSink>>>>,
}

impl RecordingTracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshots of all spans opened so far, including still-open ones.
    pub fn spans(&self) -> Vec<RecordedSpan> {
        self.sinks
            .lock()
            .unwrap()
            .iter()
            .map(|sink| sink.snapshot())
            .collect()
    }

    /// Snapshots of closed spans only.
    pub fn ended_spans(&self) -> Vec<RecordedSpan> {
        self.spans().into_iter().filter(|s| s.is_ended()).collect()
    }

    /// Drops all captured spans.
    pub fn clear(&self) {
        self.sinks.lock().unwrap().clear();
    }
}

impl Tracer for RecordingTracer {
    fn open_span(&self, name: &str, initial: Attributes) -> SpanHandle {
        let sink = Arc::new(RecordingSink {
            id: Uuid::new_v4().to_string(),
            state: Mutex::new(RecordingState {
                name: name.to_string(),
                attributes: initial,
                events: Vec::new(),
                exception: None,
                start_time: Utc::now(),
                end_time: None,
            }),
        });
        self.sinks.lock().unwrap().push(Arc::clone(&sink));
        SpanHandle::new(sink)
    }
}
