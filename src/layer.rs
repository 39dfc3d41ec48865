//! # Tower Adapter
//!
//! Interception as middleware: [`InterceptLayer`] wraps any
//! `Service<CallRequest, Response = CallOutcome, Error = BoxError>` and runs
//! the same per-call state machine as the installed wrappers, so stacks built
//! with `ServiceBuilder` get spans, streaming recording, and suppression
//! without the slot machinery. Use this when the transport is already a Tower
//! service composed at construction time; use [`crate::install`] when
//! instrumentation must be installed and reverted at runtime.
//!
//! ```rust
//! use std::sync::Arc;
//! use llm_intercept::layer::InterceptLayer;
//! use llm_intercept::endpoint::{resolver_fn, EndpointConfig};
//! use llm_intercept::recording::RecordingTracer;
//! use llm_intercept::wrap::InterceptConfig;
//! use llm_intercept::{CallOutcome, CallRequest};
//! use tower::{service_fn, BoxError, Layer, Service, ServiceExt};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), BoxError> {
//! let tracer = RecordingTracer::new();
//! let config = InterceptConfig::new(
//!     Arc::new(tracer.clone()),
//!     Arc::new(resolver_fn(|_req| Ok(EndpointConfig::new("Call {model}")))),
//! );
//! let mut svc = InterceptLayer::new(config).layer(service_fn(|_req: CallRequest| async {
//!     Ok::<_, BoxError>(CallOutcome::Complete(serde_json::json!({ "ok": true })))
//! }));
//!
//! let mut params = serde_json::Map::new();
//! params.insert("model".into(), serde_json::json!("gpt-4o"));
//! svc.ready().await?.call(CallRequest::new(params)).await?;
//! assert_eq!(tracer.spans()[0].name, "Call gpt-4o");
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;

use tower::{BoxError, Layer, Service};

use crate::call::{CallOutcome, CallRequest};
use crate::streaming::{record_stream, StreamingRecorder};
use crate::suppress::SuppressionContext;
use crate::wrap::{enrich_response, plan, InterceptConfig, StreamSpanMode};

/// Layer that intercepts calls flowing through a Tower service.
#[derive(Clone)]
pub struct InterceptLayer {
    config: InterceptConfig,
}

impl InterceptLayer {
    pub fn new(config: InterceptConfig) -> Self {
        Self { config }
    }
}

impl<S> Layer<S> for InterceptLayer {
    type Service = Intercept<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Intercept {
            inner,
            config: self.config.clone(),
        }
    }
}

/// Service wrapper produced by [`InterceptLayer`].
#[derive(Clone)]
pub struct Intercept<S> {
    inner: S,
    config: InterceptConfig,
}

impl<S> Service<CallRequest> for Intercept<S>
where
    S: Service<CallRequest, Response = CallOutcome, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = CallOutcome;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<CallOutcome, BoxError>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: CallRequest) -> Self::Future {
        let Some(mut call_plan) = plan(&self.config, &request, true) else {
            return Box::pin(self.inner.call(request));
        };
        let config = self.config.clone();
        let streaming = request.stream;
        let model = request.model().to_string();
        let factory = call_plan.stream_state.take();
        let fut = self.inner.call(request);

        Box::pin(async move {
            match (streaming, factory) {
                (true, Some(factory)) => {
                    let parent = match config.stream_span_mode {
                        StreamSpanMode::PerStream => {
                            Some(config.tracer.open_span(&call_plan.name, call_plan.attributes))
                        }
                        StreamSpanMode::None => None,
                    };
                    let result = {
                        // Suppression covers the inner call only; chunk
                        // consumption by the caller stays observable.
                        let _guard = config
                            .suppress_inner
                            .then(|| SuppressionContext::current().suppress());
                        fut.await
                    };
                    match result {
                        Ok(CallOutcome::Stream(stream)) => {
                            let recorder = StreamingRecorder::begin(factory(), parent, model);
                            Ok(CallOutcome::Stream(record_stream(stream, recorder)))
                        }
                        Ok(CallOutcome::Complete(response)) => {
                            let response = match &parent {
                                Some(span) => {
                                    let enriched = enrich_response(&config, span, response);
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
                _ => {
                    let span = config.tracer.open_span(&call_plan.name, call_plan.attributes);
                    let result = {
                        let _guard = config
                            .suppress_inner
                            .then(|| SuppressionContext::current().suppress());
                        fut.await
                    };
                    match result {
                        Ok(CallOutcome::Complete(response)) => {
                            let enriched = enrich_response(&config, &span, response);
                            span.end();
                            Ok(CallOutcome::Complete(enriched))
                        }
                        Ok(CallOutcome::Stream(stream)) => {
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
        })
    }
}
