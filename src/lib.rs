//! # llm-intercept
//!
//! A reversible call-interception engine for LLM and RPC clients. Route a
//! client's outbound call path through a call slot, instrument the slot, and
//! every call is observed as one structured trace span, without touching the
//! caller's code. Revert the instrumentation and the original callable is
//! restored exactly.
//!
//! Four axes vary independently and are each handled once:
//!
//! - **Sync vs. async**: [`SyncCall`] and [`AsyncCall`] targets run the same
//!   per-call state machine; the async path may suspend only on the original
//!   call and on each chunk pull.
//! - **Streaming vs. single-shot**: streaming calls get one parent span for
//!   the whole chunk sequence, aggregated by a pluggable
//!   [`StreamState`](streaming::StreamState); single-shot calls get a span
//!   around the call.
//! - **Suppression**: nested instrumented calls under an already-observed
//!   call are kept quiet via scoped, task-local suppression
//!   (see [`suppress`]).
//! - **Install/uninstall**: idempotent installation with batch revert
//!   (see [`install`]).
//!
//! ## Getting started
//!
//! ```rust
//! use std::sync::Arc;
//! use llm_intercept::endpoint::{resolver_fn, EndpointConfig};
//! use llm_intercept::install::{instrument, SyncSlot, Target};
//! use llm_intercept::recording::RecordingTracer;
//! use llm_intercept::wrap::InterceptConfig;
//! use llm_intercept::{sync_call_fn, BlockingOutcome, CallRequest, SyncCall};
//!
//! // The client's transport, behind a swappable slot.
//! let transport = Arc::new(sync_call_fn(|_req| {
//!     Ok(BlockingOutcome::Complete(serde_json::json!({ "model": "x", "ok": true })))
//! }));
//! let slot = SyncSlot::new("demo-client", transport);
//!
//! // What to call the span and which attributes to seed it with.
//! let resolver = resolver_fn(|_req: &CallRequest| {
//!     Ok(EndpointConfig::new("Call {model}"))
//! });
//!
//! let tracer = RecordingTracer::new();
//! let config = InterceptConfig::new(Arc::new(tracer.clone()), Arc::new(resolver));
//! let handle = instrument(&Target::Sync(Arc::clone(&slot)), config);
//!
//! let mut params = serde_json::Map::new();
//! params.insert("model".into(), serde_json::json!("x"));
//! slot.call(CallRequest::new(params)).unwrap();
//! assert_eq!(tracer.spans()[0].name, "Call x");
//!
//! // Optional: restore the original transport.
//! handle.revert().unwrap();
//! ```
//!
//! The tracer is a capability, not a dependency: implement [`Tracer`] over
//! your span backend, or use [`recording::RecordingTracer`] in tests. For
//! transports already composed as Tower services, [`layer::InterceptLayer`]
//! applies the same state machine as middleware.

pub mod call;
pub mod endpoint;
pub mod error;
pub mod install;
pub mod layer;
pub mod providers;
pub mod recording;
pub mod span;
pub mod streaming;
pub mod suppress;
pub mod wrap;

// Re-export the types most integrations touch.
pub use call::{
    async_call_fn, sync_call_fn, AsyncCall, BlockingOutcome, CallOutcome, CallRequest, ChunkIter,
    ChunkStream, SyncCall,
};
pub use endpoint::{resolver_fn, EndpointConfig, ResolveEndpoint};
pub use error::{InterceptError, Result};
pub use install::{instrument, instrument_all, AsyncSlot, SyncSlot, Target, UninstrumentHandle};
pub use span::{Attributes, NoopTracer, SpanHandle, Tracer};
pub use streaming::StreamState;
pub use suppress::{is_suppressed, SuppressionContext};
pub use wrap::{on_response_fn, InterceptConfig, OnResponse, StreamSpanMode};

// Re-export the error type integrations hand back across the call surface.
pub use tower::BoxError;
