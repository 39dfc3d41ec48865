//! # Call Wrapping
//!
//! The per-call interception state machine. Every invocation of a wrapped
//! target runs the same flow, sync or async:
//!
//! 1. If suppression is active, or the resolver skips the call (or fails),
//!    the original call runs untouched: no span, no side effects.
//! 2. Streaming call with a stream-state constructor: one parent span is
//!    opened for the whole stream, the original call runs under suppression,
//!    and the returned chunk sequence is decorated with a
//!    [`StreamingRecorder`] so consumption stays observable while nested
//!    instrumented calls inside the transport stay quiet.
//! 3. Anything else: one span around the whole call, run under suppression;
//!    on success the response's model identifier is attached and the
//!    integration's on-response hook runs; on error the exception is recorded
//!    and re-raised unchanged.
//!
//! The wrapped call's outcome is sacred: resolver and bookkeeping failures
//! are logged and swallowed, never substituted for the call's own result.
//! Spans close on every exit path; the handle's drop backstop covers panics
//! and cancelled futures.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tower::BoxError;
use tracing::warn;

use crate::call::{
    model_hint, AsyncCall, BlockingOutcome, CallOutcome, CallRequest, SyncCall,
};
use crate::endpoint::{render_template, ResolveEndpoint, StreamStateFactory};
use crate::span::{Attributes, SpanHandle, Tracer};
use crate::streaming::{record_iter, record_stream, StreamingRecorder};
use crate::suppress::{self, SuppressionContext};

/// Whether the streaming path gets a parent span at all.
///
/// The usual mode is [`PerStream`](Self::PerStream): one span spanning the
/// whole chunk sequence. [`None`](Self::None) drops the span and reports the
/// stream summary as a log event instead; some callers want request-level
/// suppression to mean no streaming span whatsoever. Both are explicit modes
/// so either choice is testable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamSpanMode {
    #[default]
    PerStream,
    None,
}

/// Hook run on each successful non-streaming response before it is returned.
/// May enrich the span and may replace the response value. A hook failure is
/// logged and the untouched response is returned instead.
pub trait OnResponse: Send + Sync {
    fn on_response(&self, response: Value, span: &SpanHandle) -> Result<Value, BoxError>;
}

/// Adapts a closure into an [`OnResponse`].
pub fn on_response_fn<F>(f: F) -> OnResponseFn<F>
where
    F: Fn(Value, &SpanHandle) -> Result<Value, BoxError> + Send + Sync,
{
    OnResponseFn { f }
}

/// See [`on_response_fn`].
pub struct OnResponseFn<F> {
    f: F,
}

impl<F> OnResponse for OnResponseFn<F>
where
    F: Fn(Value, &SpanHandle) -> Result<Value, BoxError> + Send + Sync,
{
    fn on_response(&self, response: Value, span: &SpanHandle) -> Result<Value, BoxError> {
        (self.f)(response, span)
    }
}

/// Everything a wrapper needs besides the original callable. One config is
/// shared by all targets of one `instrument` call.
#[derive(Clone)]
pub struct InterceptConfig {
    pub tracer: Arc<dyn Tracer>,
    pub resolver: Arc<dyn ResolveEndpoint>,
    pub on_response: Option<Arc<dyn OnResponse>>,
    /// Provider label attached as a `provider` attribute when non-empty.
    pub provider: String,
    /// Suppress nested instrumentation while the inner original call runs.
    pub suppress_inner: bool,
    pub stream_span_mode: StreamSpanMode,
}

impl InterceptConfig {
    pub fn new(tracer: Arc<dyn Tracer>, resolver: Arc<dyn ResolveEndpoint>) -> Self {
        Self {
            tracer,
            resolver,
            on_response: None,
            provider: String::new(),
            suppress_inner: true,
            stream_span_mode: StreamSpanMode::default(),
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn with_on_response(mut self, hook: Arc<dyn OnResponse>) -> Self {
        self.on_response = Some(hook);
        self
    }

    pub fn suppress_inner(mut self, suppress: bool) -> Self {
        self.suppress_inner = suppress;
        self
    }

    pub fn stream_span_mode(mut self, mode: StreamSpanMode) -> Self {
        self.stream_span_mode = mode;
        self
    }
}

impl std::fmt::Debug for InterceptConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptConfig")
            .field("provider", &self.provider)
            .field("suppress_inner", &self.suppress_inner)
            .field("stream_span_mode", &self.stream_span_mode)
            .finish_non_exhaustive()
    }
}

/// The resolved per-call instrumentation plan. `None` means passthrough.
pub(crate) struct CallPlan {
    pub(crate) name: String,
    pub(crate) attributes: Attributes,
    pub(crate) stream_state: Option<StreamStateFactory>,
}

pub(crate) fn plan(config: &InterceptConfig, request: &CallRequest, is_async: bool) -> Option<CallPlan> {
    if suppress::is_suppressed() {
        return None;
    }
    let endpoint = match config.resolver.resolve(request) {
        Ok(endpoint) => endpoint,
        Err(err) => {
            warn!(error = %err, "endpoint resolver failed; call proceeds uninstrumented");
            return None;
        }
    };
    let template = endpoint.message_template?;

    let mut attributes = endpoint.attributes;
    attributes.insert("async".to_string(), Value::Bool(is_async));
    if !config.provider.is_empty() {
        attributes.insert("provider".to_string(), Value::from(config.provider.clone()));
    }

    // Placeholders resolve against the span attributes first, then the raw
    // request parameters, so `"Call {model}"` works without the resolver
    // copying every parameter into the attribute set.
    let mut scope = attributes.clone();
    for (key, value) in &request.params {
        if !scope.contains_key(key) {
            scope.insert(key.clone(), value.clone());
        }
    }
    let name = render_template(&template, &scope);

    Some(CallPlan {
        name,
        attributes,
        stream_state: endpoint.stream_state,
    })
}

pub(crate) fn enrich_response(
    config: &InterceptConfig,
    span: &SpanHandle,
    response: Value,
) -> Value {
    if let Some(model) = model_hint(&response) {
        span.set_attribute("response_model", Value::from(model));
    }
    match &config.on_response {
        Some(hook) => match hook.on_response(response.clone(), span) {
            Ok(enriched) => enriched,
            Err(err) => {
                warn!(error = %err, "on-response hook failed; returning response unchanged");
                response
            }
        },
        None => response,
    }
}

/// Async wrapper installed in place of an original [`AsyncCall`].
pub struct AsyncInterceptor {
    original: Arc<dyn AsyncCall>,
    config: InterceptConfig,
}

impl AsyncInterceptor {
    pub fn new(original: Arc<dyn AsyncCall>, config: InterceptConfig) -> Self {
        Self { original, config }
    }

    /// The callable this wrapper dispatches to.
    pub fn original(&self) -> &Arc<dyn AsyncCall> {
        &self.original
    }

    async fn invoke_original(&self, request: CallRequest) -> Result<CallOutcome, BoxError> {
        if self.config.suppress_inner {
            let _guard = SuppressionContext::current().suppress();
            self.original.call(request).await
        } else {
            self.original.call(request).await
        }
    }

    async fn call_streaming(
        &self,
        request: CallRequest,
        plan: CallPlan,
        factory: StreamStateFactory,
    ) -> Result<CallOutcome, BoxError> {
        let parent = match self.config.stream_span_mode {
            StreamSpanMode::PerStream => {
                Some(self.config.tracer.open_span(&plan.name, plan.attributes))
            }
            StreamSpanMode::None => None,
        };
        let model = request.model().to_string();

        match self.invoke_original(request).await {
            Ok(CallOutcome::Stream(stream)) => {
                let recorder = StreamingRecorder::begin(factory(), parent, model);
                Ok(CallOutcome::Stream(record_stream(stream, recorder)))
            }
            Ok(CallOutcome::Complete(response)) => {
                // Transport answered single-shot despite the stream request.
                let response = match &parent {
                    Some(span) => {
                        let enriched = enrich_response(&self.config, span, response);
                        span.end();
                        enriched
                    }
                    None => response,
                };
                Ok(CallOutcome::Complete(response))
            }
            Err(err) => {
                if let Some(span) = &parent {
                    span.record_exception(err.as_ref());
                    span.end();
                }
                Err(err)
            }
        }
    }

    async fn call_single(
        &self,
        request: CallRequest,
        plan: CallPlan,
    ) -> Result<CallOutcome, BoxError> {
        let span = self.config.tracer.open_span(&plan.name, plan.attributes);
        match self.invoke_original(request).await {
            Ok(CallOutcome::Complete(response)) => {
                let enriched = enrich_response(&self.config, &span, response);
                span.end();
                Ok(CallOutcome::Complete(enriched))
            }
            Ok(CallOutcome::Stream(stream)) => {
                // No stream state configured for this endpoint: the span
                // covers the request only, the chunks flow unobserved.
                span.end();
                Ok(CallOutcome::Stream(stream))
            }
            Err(err) => {
                span.record_exception(err.as_ref());
                span.end();
                Err(err)
            }
        }
    }
}

#[async_trait]
impl AsyncCall for AsyncInterceptor {
    async fn call(&self, request: CallRequest) -> Result<CallOutcome, BoxError> {
        let Some(mut plan) = plan(&self.config, &request, true) else {
            return self.original.call(request).await;
        };
        match (request.stream, plan.stream_state.take()) {
            (true, Some(factory)) => self.call_streaming(request, plan, factory).await,
            _ => self.call_single(request, plan).await,
        }
    }
}

/// Blocking wrapper installed in place of an original [`SyncCall`].
pub struct SyncInterceptor {
    original: Arc<dyn SyncCall>,
    config: InterceptConfig,
}

impl SyncInterceptor {
    pub fn new(original: Arc<dyn SyncCall>, config: InterceptConfig) -> Self {
        Self { original, config }
    }

    /// The callable this wrapper dispatches to.
    pub fn original(&self) -> &Arc<dyn SyncCall> {
        &self.original
    }

    fn invoke_original(&self, request: CallRequest) -> Result<BlockingOutcome, BoxError> {
        if self.config.suppress_inner {
            let _guard = SuppressionContext::current().suppress();
            self.original.call(request)
        } else {
            self.original.call(request)
        }
    }

    fn call_streaming(
        &self,
        request: CallRequest,
        plan: CallPlan,
        factory: StreamStateFactory,
    ) -> Result<BlockingOutcome, BoxError> {
        let parent = match self.config.stream_span_mode {
            StreamSpanMode::PerStream => {
                Some(self.config.tracer.open_span(&plan.name, plan.attributes))
            }
            StreamSpanMode::None => None,
        };
        let model = request.model().to_string();

        match self.invoke_original(request) {
            Ok(BlockingOutcome::Stream(iter)) => {
                let recorder = StreamingRecorder::begin(factory(), parent, model);
                Ok(BlockingOutcome::Stream(record_iter(iter, recorder)))
            }
            Ok(BlockingOutcome::Complete(response)) => {
                let response = match &parent {
                    Some(span) => {
                        let enriched = enrich_response(&self.config, span, response);
                        span.end();
                        enriched
                    }
                    None => response,
                };
                Ok(BlockingOutcome::Complete(response))
            }
            Err(err) => {
                if let Some(span) = &parent {
                    span.record_exception(err.as_ref());
                    span.end();
                }
                Err(err)
            }
        }
    }

    fn call_single(
        &self,
        request: CallRequest,
        plan: CallPlan,
    ) -> Result<BlockingOutcome, BoxError> {
        let span = self.config.tracer.open_span(&plan.name, plan.attributes);
        match self.invoke_original(request) {
            Ok(BlockingOutcome::Complete(response)) => {
                let enriched = enrich_response(&self.config, &span, response);
                span.end();
                Ok(BlockingOutcome::Complete(enriched))
            }
            Ok(BlockingOutcome::Stream(iter)) => {
                span.end();
                Ok(BlockingOutcome::Stream(iter))
            }
            Err(err) => {
                span.record_exception(err.as_ref());
                span.end();
                Err(err)
            }
        }
    }
}

impl SyncCall for SyncInterceptor {
    fn call(&self, request: CallRequest) -> Result<BlockingOutcome, BoxError> {
        let Some(mut plan) = plan(&self.config, &request, false) else {
            return self.original.call(request);
        };
        match (request.stream, plan.stream_state.take()) {
            (true, Some(factory)) => self.call_streaming(request, plan, factory),
            _ => self.call_single(request, plan),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{async_call_fn, sync_call_fn};
    use crate::endpoint::{resolver_fn, EndpointConfig};
    use crate::recording::RecordingTracer;
    use crate::streaming::StreamState;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request_with_model(model: &str) -> CallRequest {
        let mut params = Attributes::new();
        params.insert("model".to_string(), json!(model));
        CallRequest::new(params)
    }

    fn call_resolver() -> Arc<dyn ResolveEndpoint> {
        Arc::new(resolver_fn(|req: &CallRequest| {
            Ok(EndpointConfig::new("Call {model}")
                .with_attribute("model", req.param("model").cloned().unwrap_or(Value::Null)))
        }))
    }

    #[tokio::test]
    async fn test_end_to_end_span_name_and_attributes() {
        let tracer = RecordingTracer::new();
        let original = Arc::new(async_call_fn(|_req| async {
            Ok(CallOutcome::Complete(json!({ "model": "x-served", "ok": true })))
        }));
        let wrapper = AsyncInterceptor::new(
            original,
            InterceptConfig::new(Arc::new(tracer.clone()), call_resolver()),
        );

        // Tests bind their own context so parallel tests sharing the process
        // default cannot observe each other's inner-call suppression.
        let out = suppress::in_scope(SuppressionContext::new(), async {
            wrapper.call(request_with_model("x")).await
        })
        .await
        .unwrap();
        assert!(matches!(out, CallOutcome::Complete(_)));

        let spans = tracer.spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "Call x");
        assert_eq!(spans[0].attribute("model"), Some(&json!("x")));
        assert_eq!(spans[0].attribute("async"), Some(&json!(true)));
        assert_eq!(spans[0].attribute("response_model"), Some(&json!("x-served")));
        assert!(spans[0].is_ended());
    }

    #[tokio::test]
    async fn test_sentinel_resolver_is_pure_passthrough() {
        let tracer = RecordingTracer::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let original = Arc::new(async_call_fn(move |_req| {
            counted.fetch_add(1, Ordering::SeqCst);
            async { Ok(CallOutcome::Complete(json!(41))) }
        }));
        let wrapper = AsyncInterceptor::new(
            original,
            InterceptConfig::new(
                Arc::new(tracer.clone()),
                Arc::new(resolver_fn(|_req| Ok(EndpointConfig::skip()))),
            ),
        );

        match wrapper.call(request_with_model("x")).await.unwrap() {
            CallOutcome::Complete(v) => assert_eq!(v, json!(41)),
            CallOutcome::Stream(_) => panic!("expected complete outcome"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(tracer.spans().is_empty());
    }

    #[tokio::test]
    async fn test_resolver_failure_is_logged_not_raised() {
        let tracer = RecordingTracer::new();
        let original = Arc::new(async_call_fn(|_req| async {
            Ok(CallOutcome::Complete(json!("fine")))
        }));
        let wrapper = AsyncInterceptor::new(
            original,
            InterceptConfig::new(
                Arc::new(tracer.clone()),
                Arc::new(resolver_fn(|_req| Err("resolver bug".into()))),
            ),
        );

        match wrapper.call(request_with_model("x")).await.unwrap() {
            CallOutcome::Complete(v) => assert_eq!(v, json!("fine")),
            CallOutcome::Stream(_) => panic!("expected complete outcome"),
        }
        assert!(tracer.spans().is_empty());
    }

    #[tokio::test]
    async fn test_exception_transparency() {
        let tracer = RecordingTracer::new();
        let original = Arc::new(async_call_fn(|_req| async {
            Err::<CallOutcome, BoxError>("rate limited".into())
        }));
        let wrapper = AsyncInterceptor::new(
            original,
            InterceptConfig::new(Arc::new(tracer.clone()), call_resolver()),
        );

        let err = suppress::in_scope(SuppressionContext::new(), async {
            wrapper.call(request_with_model("x")).await
        })
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "rate limited");

        let spans = tracer.spans();
        assert_eq!(spans[0].exception.as_deref(), Some("rate limited"));
        assert!(spans[0].is_ended());
    }

    #[tokio::test]
    async fn test_on_response_hook_failure_returns_original_response() {
        let tracer = RecordingTracer::new();
        let original = Arc::new(async_call_fn(|_req| async {
            Ok(CallOutcome::Complete(json!({ "answer": 42 })))
        }));
        let hook = Arc::new(on_response_fn(|_response, _span| Err("hook bug".into())));
        let wrapper = AsyncInterceptor::new(
            original,
            InterceptConfig::new(Arc::new(tracer.clone()), call_resolver()).with_on_response(hook),
        );

        let out = suppress::in_scope(SuppressionContext::new(), async {
            wrapper.call(request_with_model("x")).await
        })
        .await
        .unwrap();
        match out {
            CallOutcome::Complete(v) => assert_eq!(v, json!({ "answer": 42 })),
            CallOutcome::Stream(_) => panic!("expected complete outcome"),
        }
        assert!(tracer.spans()[0].is_ended());
    }

    #[test]
    fn test_sync_wrapper_suppressed_is_passthrough() {
        let tracer = RecordingTracer::new();
        let original = Arc::new(sync_call_fn(|_req| Ok(BlockingOutcome::Complete(json!(1)))));
        let wrapper = SyncInterceptor::new(
            original,
            InterceptConfig::new(Arc::new(tracer.clone()), call_resolver()),
        );

        let ctx = SuppressionContext::new();
        let _guard = ctx.suppress();
        crate::suppress::in_scope_sync(ctx.clone(), || {
            wrapper.call(request_with_model("x")).unwrap();
        });
        assert!(tracer.spans().is_empty());

        // In a fresh, unsuppressed scope the same call is instrumented.
        crate::suppress::in_scope_sync(SuppressionContext::new(), || {
            wrapper.call(request_with_model("x")).unwrap();
        });
        assert_eq!(tracer.spans().len(), 1);
    }

    #[tokio::test]
    async fn test_nested_wrapped_call_is_suppressed() {
        let tracer = RecordingTracer::new();
        let config = InterceptConfig::new(Arc::new(tracer.clone()), call_resolver());

        // Inner wrapped transport, as a lower layer would re-wrap it.
        let inner = Arc::new(AsyncInterceptor::new(
            Arc::new(async_call_fn(|_req| async {
                Ok(CallOutcome::Complete(json!("inner")))
            })),
            config.clone(),
        ));
        let outer_original = Arc::new(async_call_fn(move |req: CallRequest| {
            let inner = inner.clone();
            async move { inner.call(req).await }
        }));
        let outer = AsyncInterceptor::new(outer_original, config);

        // Fresh task-scoped context so this test's suppression cannot leak
        // into concurrently running tests through the process default.
        suppress::in_scope(SuppressionContext::new(), async {
            outer.call(request_with_model("x")).await.unwrap();
        })
        .await;
        // Only the outer call produced a span.
        assert_eq!(tracer.spans().len(), 1);
    }

    #[derive(Default)]
    struct CountChunks(usize);
    impl StreamState for CountChunks {
        fn record_chunk(&mut self, _chunk: &Value) {
            self.0 += 1;
        }
        fn response_data(&self) -> Value {
            json!({ "chunks": self.0 })
        }
    }

    fn streaming_resolver() -> Arc<dyn ResolveEndpoint> {
        Arc::new(resolver_fn(|_req: &CallRequest| {
            Ok(EndpointConfig::new("Stream {model}").with_stream_state(CountChunks::default))
        }))
    }

    #[tokio::test]
    async fn test_streaming_opens_one_parent_span() {
        use futures::StreamExt;

        let tracer = RecordingTracer::new();
        let original = Arc::new(async_call_fn(|_req| async {
            let chunks: Vec<Result<Value, BoxError>> =
                (0..3).map(|i| Ok(json!({ "i": i }))).collect();
            Ok(CallOutcome::Stream(Box::pin(futures::stream::iter(chunks))))
        }));
        let wrapper = AsyncInterceptor::new(
            original,
            InterceptConfig::new(Arc::new(tracer.clone()), streaming_resolver()),
        );

        let outcome = suppress::in_scope(SuppressionContext::new(), async {
            wrapper
                .call(CallRequest::streaming({
                    let mut p = Attributes::new();
                    p.insert("model".to_string(), json!("m"));
                    p
                }))
                .await
        })
        .await
        .unwrap();

        let mut stream = match outcome {
            CallOutcome::Stream(s) => s,
            CallOutcome::Complete(_) => panic!("expected stream"),
        };
        let mut n = 0;
        while let Some(item) = stream.next().await {
            item.unwrap();
            n += 1;
        }
        assert_eq!(n, 3);

        let spans = tracer.spans();
        assert_eq!(spans.len(), 1, "one parent span, never one per chunk");
        assert_eq!(spans[0].name, "Stream m");
        assert_eq!(spans[0].attribute("response_data"), Some(&json!({ "chunks": 3 })));
        assert!(spans[0].is_ended());
    }

    #[tokio::test]
    async fn test_stream_span_mode_none_creates_no_span() {
        use futures::StreamExt;

        let tracer = RecordingTracer::new();
        let original = Arc::new(async_call_fn(|_req| async {
            let chunks: Vec<Result<Value, BoxError>> = vec![Ok(json!({ "i": 0 }))];
            Ok(CallOutcome::Stream(Box::pin(futures::stream::iter(chunks))))
        }));
        let wrapper = AsyncInterceptor::new(
            original,
            InterceptConfig::new(Arc::new(tracer.clone()), streaming_resolver())
                .stream_span_mode(StreamSpanMode::None),
        );

        let outcome = wrapper
            .call(CallRequest::streaming(Attributes::new()))
            .await
            .unwrap();
        if let CallOutcome::Stream(mut s) = outcome {
            while s.next().await.is_some() {}
        }
        assert!(tracer.spans().is_empty());
    }

    #[tokio::test]
    async fn test_stream_requested_without_state_gets_request_span() {
        let tracer = RecordingTracer::new();
        let original = Arc::new(async_call_fn(|_req| async {
            let chunks: Vec<Result<Value, BoxError>> = vec![];
            Ok(CallOutcome::Stream(Box::pin(futures::stream::iter(chunks))))
        }));
        let wrapper = AsyncInterceptor::new(
            original,
            InterceptConfig::new(Arc::new(tracer.clone()), call_resolver()),
        );

        let outcome = suppress::in_scope(SuppressionContext::new(), async {
            wrapper.call(CallRequest::streaming(Attributes::new())).await
        })
        .await
        .unwrap();
        assert!(matches!(outcome, CallOutcome::Stream(_)));
        // Span covers the request itself and is already closed.
        assert_eq!(tracer.ended_spans().len(), 1);
    }
}
