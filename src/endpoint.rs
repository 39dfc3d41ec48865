//! # Endpoint Configuration
//!
//! Each integration supplies a resolver that maps a call's parameters to the
//! span's name template, its initial attributes, and (for streaming
//! endpoints) a constructor for the provider-specific stream accumulator.
//! Resolvers must be pure: identical requests produce identical configs, so
//! the engine can call them on every invocation without caching.
//!
//! A resolver opts a call out of instrumentation by returning
//! [`EndpointConfig::skip`]; the wrapper then executes the original call
//! untouched. A resolver that returns an error is treated the same way, after
//! a warning log: resolver bugs must never surface as new errors to the
//! caller (see [`crate::error::InterceptError::Resolver`]).

use std::sync::Arc;

use serde_json::Value;
use tower::BoxError;

use crate::call::CallRequest;
use crate::span::Attributes;
use crate::streaming::StreamState;

/// Constructs a fresh stream accumulator for one streaming call.
pub type StreamStateFactory = Arc<dyn Fn() -> Box<dyn StreamState> + Send + Sync>;

/// Per-call instrumentation config produced by a resolver.
#[derive(Clone, Default)]
pub struct EndpointConfig {
    /// Span name template, e.g. `"Chat Completion with {model}"`. `None` is
    /// the sentinel for "do not instrument this call".
    pub message_template: Option<String>,
    /// Initial span attributes.
    pub attributes: Attributes,
    /// Stream accumulator factory, present only for streaming-capable endpoints.
    pub stream_state: Option<StreamStateFactory>,
}

impl EndpointConfig {
    /// A config that instruments the call with the given name template.
    pub fn new(message_template: impl Into<String>) -> Self {
        Self {
            message_template: Some(message_template.into()),
            ..Self::default()
        }
    }

    /// The "do not instrument" sentinel.
    pub fn skip() -> Self {
        Self::default()
    }

    /// Whether this config is the sentinel.
    pub fn is_skip(&self) -> bool {
        self.message_template.is_none()
    }

    /// Adds one initial attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Merges a set of initial attributes.
    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes.extend(attributes);
        self
    }

    /// Installs a stream accumulator factory.
    pub fn with_stream_state<S, F>(mut self, factory: F) -> Self
    where
        S: StreamState + 'static,
        F: Fn() -> S + Send + Sync + 'static,
    {
        self.stream_state = Some(Arc::new(move || Box::new(factory())));
        self
    }
}

impl std::fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("message_template", &self.message_template)
            .field("attributes", &self.attributes)
            .field("stream_state", &self.stream_state.is_some())
            .finish()
    }
}

/// Maps a call's parameters to its instrumentation config.
pub trait ResolveEndpoint: Send + Sync {
    fn resolve(&self, request: &CallRequest) -> Result<EndpointConfig, BoxError>;
}

/// Adapts a closure into a [`ResolveEndpoint`].
pub fn resolver_fn<F>(f: F) -> ResolverFn<F>
where
    F: Fn(&CallRequest) -> Result<EndpointConfig, BoxError> + Send + Sync,
{
    ResolverFn { f }
}

/// See [`resolver_fn`].
pub struct ResolverFn<F> {
    f: F,
}

impl<F> ResolveEndpoint for ResolverFn<F>
where
    F: Fn(&CallRequest) -> Result<EndpointConfig, BoxError> + Send + Sync,
{
    fn resolve(&self, request: &CallRequest) -> Result<EndpointConfig, BoxError> {
        (self.f)(request)
    }
}

/// Renders a message template by substituting `{key}` placeholders with the
/// attribute's string form. Unknown keys are left as written, so a template
/// typo is visible in the span name rather than silently dropped.
pub fn render_template(template: &str, attributes: &Attributes) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let key = &after[..close];
                match attributes.get(key) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(other) => out.push_str(&other.to_string()),
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                // Unclosed brace: emit the remainder verbatim.
                out.push_str(&rest[open..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}
