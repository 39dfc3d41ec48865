//! End-to-end interception scenarios: install on a slot, call through it,
//! assert on the captured spans, revert, and verify the target is untouched.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};

use llm_intercept::endpoint::{resolver_fn, EndpointConfig};
use llm_intercept::install::{instrument, AsyncSlot, SyncSlot, Target};
use llm_intercept::recording::RecordingTracer;
use llm_intercept::suppress::{self, SuppressionContext};
use llm_intercept::wrap::{on_response_fn, InterceptConfig};
use llm_intercept::{
    async_call_fn, sync_call_fn, AsyncCall, Attributes, BlockingOutcome, BoxError, CallOutcome,
    CallRequest, ResolveEndpoint, SyncCall,
};

fn model_params(model: &str) -> Attributes {
    let mut params = Attributes::new();
    params.insert("model".to_string(), json!(model));
    params
}

fn call_resolver() -> Arc<dyn ResolveEndpoint> {
    Arc::new(resolver_fn(|req: &CallRequest| {
        Ok(EndpointConfig::new("Call {model}")
            .with_attribute("model", req.param("model").cloned().unwrap_or(Value::Null)))
    }))
}

#[test]
fn sync_call_produces_one_named_span() {
    let tracer = RecordingTracer::new();
    let slot = SyncSlot::new(
        "client",
        Arc::new(sync_call_fn(|_req| {
            Ok(BlockingOutcome::Complete(json!({ "model": "x", "ok": true })))
        })),
    );
    let handle = instrument(
        &Target::Sync(Arc::clone(&slot)),
        InterceptConfig::new(Arc::new(tracer.clone()), call_resolver()),
    );

    let out = suppress::in_scope_sync(SuppressionContext::new(), || {
        slot.call(CallRequest::new(model_params("x"))).unwrap()
    });
    match out {
        BlockingOutcome::Complete(v) => assert_eq!(v, json!({ "model": "x", "ok": true })),
        BlockingOutcome::Stream(_) => panic!("expected complete outcome"),
    }

    let spans = tracer.spans();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].name, "Call x");
    assert_eq!(spans[0].attribute("model"), Some(&json!("x")));
    assert_eq!(spans[0].attribute("async"), Some(&json!(false)));
    assert_eq!(spans[0].attribute("response_model"), Some(&json!("x")));
    assert!(spans[0].is_ended());

    handle.revert().unwrap();
}

#[tokio::test]
async fn async_call_produces_one_named_span() {
    let tracer = RecordingTracer::new();
    let slot = AsyncSlot::new(
        "client",
        Arc::new(async_call_fn(|_req| async {
            Ok(CallOutcome::Complete(json!({ "model": "m-served" })))
        })),
    );
    let handle = instrument(
        &Target::Async(Arc::clone(&slot)),
        InterceptConfig::new(Arc::new(tracer.clone()), call_resolver()),
    );

    suppress::in_scope(SuppressionContext::new(), async {
        slot.call(CallRequest::new(model_params("m"))).await.unwrap();
    })
    .await;

    let spans = tracer.spans();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].name, "Call m");
    assert_eq!(spans[0].attribute("async"), Some(&json!(true)));
    assert_eq!(spans[0].attribute("response_model"), Some(&json!("m-served")));

    handle.revert().unwrap();
}

#[test]
fn skip_sentinel_is_bit_identical_passthrough() {
    let tracer = RecordingTracer::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);
    let slot = SyncSlot::new(
        "client",
        Arc::new(sync_call_fn(move |req: CallRequest| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(BlockingOutcome::Complete(json!({ "echo": req.model() })))
        })),
    );
    let handle = instrument(
        &Target::Sync(Arc::clone(&slot)),
        InterceptConfig::new(
            Arc::new(tracer.clone()),
            Arc::new(resolver_fn(|_req| Ok(EndpointConfig::skip()))),
        ),
    );

    let out = slot.call(CallRequest::new(model_params("x"))).unwrap();
    match out {
        BlockingOutcome::Complete(v) => assert_eq!(v, json!({ "echo": "x" })),
        BlockingOutcome::Stream(_) => panic!("expected complete outcome"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(tracer.spans().is_empty(), "sentinel must create no span");

    handle.revert().unwrap();
}

#[test]
fn errors_surface_unchanged_with_span_bookkeeping() {
    let tracer = RecordingTracer::new();
    let slot = SyncSlot::new(
        "client",
        Arc::new(sync_call_fn(|_req| {
            Err::<BlockingOutcome, BoxError>("quota exhausted".into())
        })),
    );
    let handle = instrument(
        &Target::Sync(Arc::clone(&slot)),
        InterceptConfig::new(Arc::new(tracer.clone()), call_resolver()),
    );

    let err = suppress::in_scope_sync(SuppressionContext::new(), || {
        slot.call(CallRequest::new(model_params("x"))).unwrap_err()
    });
    assert_eq!(err.to_string(), "quota exhausted");

    let spans = tracer.spans();
    assert_eq!(spans[0].exception.as_deref(), Some("quota exhausted"));
    assert!(spans[0].is_ended());

    handle.revert().unwrap();
}

#[test]
fn revert_restores_the_exact_original() {
    let tracer = RecordingTracer::new();
    let original: Arc<dyn SyncCall> =
        Arc::new(sync_call_fn(|_req| Ok(BlockingOutcome::Complete(json!(1)))));
    let slot = SyncSlot::new("client", Arc::clone(&original));

    let handle = instrument(
        &Target::Sync(Arc::clone(&slot)),
        InterceptConfig::new(Arc::new(tracer.clone()), call_resolver()),
    );
    assert!(!Arc::ptr_eq(&slot.current(), &original));

    handle.revert().unwrap();
    assert!(Arc::ptr_eq(&slot.current(), &original));
    assert!(!slot.is_instrumented());

    // Behaves like a never-instrumented target.
    slot.call(CallRequest::new(model_params("x"))).unwrap();
    assert!(tracer.spans().is_empty());
}

#[tokio::test]
async fn on_response_hook_enriches_and_rewrites() {
    let tracer = RecordingTracer::new();
    let slot = AsyncSlot::new(
        "client",
        Arc::new(async_call_fn(|_req| async {
            Ok(CallOutcome::Complete(json!({ "model": "m", "raw": true })))
        })),
    );
    let hook = Arc::new(on_response_fn(|response: Value, span| {
        span.set_attribute("response_data", response.clone());
        let mut rewritten = response;
        rewritten["seen_by_hook"] = json!(true);
        Ok(rewritten)
    }));
    let handle = instrument(
        &Target::Async(Arc::clone(&slot)),
        InterceptConfig::new(Arc::new(tracer.clone()), call_resolver()).with_on_response(hook),
    );

    let out = suppress::in_scope(SuppressionContext::new(), async {
        slot.call(CallRequest::new(model_params("m"))).await.unwrap()
    })
    .await;
    match out {
        CallOutcome::Complete(v) => assert_eq!(v["seen_by_hook"], json!(true)),
        CallOutcome::Stream(_) => panic!("expected complete outcome"),
    }
    assert!(tracer.spans()[0].attribute("response_data").is_some());

    handle.revert().unwrap();
}

#[tokio::test]
async fn provider_label_lands_on_spans() {
    let tracer = RecordingTracer::new();
    let slot = AsyncSlot::new(
        "client",
        Arc::new(async_call_fn(|_req| async {
            Ok(CallOutcome::Complete(json!({})))
        })),
    );
    let handle = instrument(
        &Target::Async(Arc::clone(&slot)),
        InterceptConfig::new(Arc::new(tracer.clone()), call_resolver()).with_provider("OpenAI"),
    );

    suppress::in_scope(SuppressionContext::new(), async {
        slot.call(CallRequest::new(model_params("m"))).await.unwrap();
    })
    .await;
    assert_eq!(
        tracer.spans()[0].attribute("provider"),
        Some(&json!("OpenAI"))
    );

    handle.revert().unwrap();
}
