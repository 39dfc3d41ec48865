//! # Call Surface Types
//!
//! The engine intercepts one method shape: a request carrying keyword-style
//! parameters plus a streaming flag, returning either a complete response
//! value or a sequence of chunks. Both the original transport and the
//! installed wrapper implement the same trait, so interception is a proxy
//! swap rather than a mutation of the client (see [`crate::install`]).
//!
//! Sync and async are separate traits resolved once at install time, not
//! probed per call. Responses and chunks are [`serde_json::Value`] so the
//! engine stays provider-agnostic; provider-specific meaning lives in the
//! resolver and stream state (see [`crate::endpoint`]).

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use tower::BoxError;

use crate::span::Attributes;

/// A pinned, boxed chunk sequence for async streaming responses.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Value, BoxError>> + Send>>;

/// The blocking twin of [`ChunkStream`].
pub type ChunkIter = Box<dyn Iterator<Item = Result<Value, BoxError>> + Send>;

/// One outbound call as seen by the engine.
#[derive(Debug, Clone, Default)]
pub struct CallRequest {
    /// Keyword-style call parameters (request body fields, options).
    pub params: Attributes,
    /// Whether the caller asked for a streaming response.
    pub stream: bool,
}

impl CallRequest {
    /// A single-shot request with the given parameters.
    pub fn new(params: Attributes) -> Self {
        Self {
            params,
            stream: false,
        }
    }

    /// A streaming request with the given parameters.
    pub fn streaming(params: Attributes) -> Self {
        Self {
            params,
            stream: true,
        }
    }

    /// Looks up a single parameter.
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// The `model` parameter as a string, or `"unknown"`.
    pub fn model(&self) -> &str {
        self.param("model").and_then(Value::as_str).unwrap_or("unknown")
    }
}

/// Result of an async call: a complete response or a chunk stream.
pub enum CallOutcome {
    Complete(Value),
    Stream(ChunkStream),
}

impl std::fmt::Debug for CallOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallOutcome::Complete(v) => f.debug_tuple("Complete").field(v).finish(),
            CallOutcome::Stream(_) => f.debug_tuple("Stream").finish(),
        }
    }
}

/// Result of a blocking call: a complete response or a chunk iterator.
pub enum BlockingOutcome {
    Complete(Value),
    Stream(ChunkIter),
}

impl std::fmt::Debug for BlockingOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockingOutcome::Complete(v) => f.debug_tuple("Complete").field(v).finish(),
            BlockingOutcome::Stream(_) => f.debug_tuple("Stream").finish(),
        }
    }
}

/// A blocking request path: the original transport method, or its wrapper.
pub trait SyncCall: Send + Sync {
    fn call(&self, request: CallRequest) -> Result<BlockingOutcome, BoxError>;
}

/// An async request path: the original transport method, or its wrapper.
#[async_trait]
pub trait AsyncCall: Send + Sync {
    async fn call(&self, request: CallRequest) -> Result<CallOutcome, BoxError>;
}

/// Adapts a closure into a [`SyncCall`].
pub fn sync_call_fn<F>(f: F) -> SyncCallFn<F>
where
    F: Fn(CallRequest) -> Result<BlockingOutcome, BoxError> + Send + Sync,
{
    SyncCallFn { f }
}

/// See [`sync_call_fn`].
pub struct SyncCallFn<F> {
    f: F,
}

impl<F> SyncCall for SyncCallFn<F>
where
    F: Fn(CallRequest) -> Result<BlockingOutcome, BoxError> + Send + Sync,
{
    fn call(&self, request: CallRequest) -> Result<BlockingOutcome, BoxError> {
        (self.f)(request)
    }
}

/// Adapts an async closure into an [`AsyncCall`].
pub fn async_call_fn<F, Fut>(f: F) -> AsyncCallFn<F>
where
    F: Fn(CallRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<CallOutcome, BoxError>> + Send + 'static,
{
    AsyncCallFn { f }
}

/// See [`async_call_fn`].
pub struct AsyncCallFn<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> AsyncCall for AsyncCallFn<F>
where
    F: Fn(CallRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<CallOutcome, BoxError>> + Send + 'static,
{
    async fn call(&self, request: CallRequest) -> Result<CallOutcome, BoxError> {
        (self.f)(request).await
    }
}

/// Extracts a model identifier from a response or chunk value, if it
/// exposes one under the conventional `model` key.
pub(crate) fn model_hint(value: &Value) -> Option<&str> {
    value.get("model").and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(model: &str) -> Attributes {
        let mut map = Attributes::new();
        map.insert("model".to_string(), json!(model));
        map
    }

    #[test]
    fn test_request_model_falls_back_to_unknown() {
        assert_eq!(CallRequest::new(params("gpt-4o")).model(), "gpt-4o");
        assert_eq!(CallRequest::default().model(), "unknown");
    }

    #[test]
    fn test_sync_call_fn_dispatch() {
        let call = sync_call_fn(|req| Ok(BlockingOutcome::Complete(json!({ "echo": req.model() }))));
        match call.call(CallRequest::new(params("m"))).unwrap() {
            BlockingOutcome::Complete(v) => assert_eq!(v, json!({ "echo": "m" })),
            BlockingOutcome::Stream(_) => panic!("expected complete outcome"),
        }
    }

    #[tokio::test]
    async fn test_async_call_fn_dispatch() {
        let call = async_call_fn(|req: CallRequest| async move {
            Ok(CallOutcome::Complete(json!({ "stream": req.stream })))
        });
        match call.call(CallRequest::streaming(Attributes::new())).await.unwrap() {
            CallOutcome::Complete(v) => assert_eq!(v, json!({ "stream": true })),
            CallOutcome::Stream(_) => panic!("expected complete outcome"),
        }
    }

    #[test]
    fn test_model_hint() {
        assert_eq!(model_hint(&json!({ "model": "gpt-4o" })), Some("gpt-4o"));
        assert_eq!(model_hint(&json!({ "other": 1 })), None);
        assert_eq!(model_hint(&json!("bare string")), None);
    }
}
