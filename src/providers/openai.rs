//! OpenAI-style chat completion integration
//!
//! Maps chat-completion calls onto the engine's resolver/stream-state seam:
//! a request whose parameters look like a chat completion gets a
//! `"Chat Completion with {model}"` span carrying the request body under
//! `request_data`; streamed responses are folded back into one message by
//! concatenating choice deltas and keeping the last reported usage.
//!
//! [`chat_request`] converts a typed [`CreateChatCompletionRequest`] into the
//! engine's [`CallRequest`], deriving the streaming flag from the request's
//! own `stream` field.

use std::sync::Arc;

use async_openai::types::CreateChatCompletionRequest;
use serde_json::{json, Map, Value};
use tower::BoxError;

use crate::call::CallRequest;
use crate::endpoint::{resolver_fn, EndpointConfig, ResolveEndpoint};
use crate::span::Tracer;
use crate::streaming::StreamState;
use crate::wrap::{on_response_fn, InterceptConfig};

/// Converts a typed chat completion request into the engine's call shape.
pub fn chat_request(request: &CreateChatCompletionRequest) -> Result<CallRequest, BoxError> {
    let value = serde_json::to_value(request)?;
    let params = match value {
        Value::Object(map) => map,
        _ => return Err("chat completion request did not serialize to an object".into()),
    };
    let stream = request.stream.unwrap_or(false);
    Ok(CallRequest { params, stream })
}

/// Resolver for chat-completion endpoints. Calls without a `messages`
/// parameter are left uninstrumented.
pub fn resolver() -> impl ResolveEndpoint {
    resolver_fn(|request: &CallRequest| {
        if request.param("messages").is_none() {
            return Ok(EndpointConfig::skip());
        }
        Ok(EndpointConfig::new("Chat Completion with {model}")
            .with_attribute("request_data", Value::Object(request.params.clone()))
            .with_stream_state(ChatStreamState::default))
    })
}

/// A ready-made [`InterceptConfig`] for chat-completion targets: the
/// resolver above, the `OpenAI` provider label, and an on-response hook that
/// attaches the response body as `response_data`.
pub fn intercept_config(tracer: Arc<dyn Tracer>) -> InterceptConfig {
    InterceptConfig::new(tracer, Arc::new(resolver()))
        .with_provider("OpenAI")
        .with_on_response(Arc::new(on_response_fn(|response, span| {
            span.set_attribute("response_data", response.clone());
            Ok(response)
        })))
}

/// Folds chat-completion chunks back into one message.
///
/// Deltas for the first choice are concatenated in arrival order; the role
/// comes from the first delta that carries one, the finish reason and usage
/// from the last chunk that reports them.
#[derive(Debug, Default)]
pub struct ChatStreamState {
    role: Option<String>,
    content: String,
    finish_reason: Option<String>,
    usage: Option<Value>,
    chunk_count: usize,
}

impl ChatStreamState {
    fn first_choice(chunk: &Value) -> Option<&Value> {
        chunk.get("choices").and_then(Value::as_array).and_then(|c| c.first())
    }
}

impl StreamState for ChatStreamState {
    fn record_chunk(&mut self, chunk: &Value) {
        self.chunk_count += 1;
        if let Some(choice) = Self::first_choice(chunk) {
            if let Some(delta) = choice.get("delta") {
                if self.role.is_none() {
                    if let Some(role) = delta.get("role").and_then(Value::as_str) {
                        self.role = Some(role.to_string());
                    }
                }
                if let Some(text) = delta.get("content").and_then(Value::as_str) {
                    self.content.push_str(text);
                }
            }
            if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                self.finish_reason = Some(reason.to_string());
            }
        }
        if let Some(usage) = chunk.get("usage") {
            if !usage.is_null() {
                self.usage = Some(usage.clone());
            }
        }
    }

    fn response_data(&self) -> Value {
        let mut message = Map::new();
        message.insert(
            "role".to_string(),
            json!(self.role.as_deref().unwrap_or("assistant")),
        );
        message.insert("content".to_string(), json!(self.content));
        if let Some(reason) = &self.finish_reason {
            message.insert("finish_reason".to_string(), json!(reason));
        }
        let mut data = Map::new();
        data.insert("message".to_string(), Value::Object(message));
        data.insert("chunk_count".to_string(), json!(self.chunk_count));
        if let Some(usage) = &self.usage {
            data.insert("usage".to_string(), usage.clone());
        }
        Value::Object(data)
    }
}
