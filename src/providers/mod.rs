//! Provider integrations
//!
//! The engine core is provider-agnostic: what a span is named, which request
//! fields become attributes, and how stream chunks aggregate are all supplied
//! through [`ResolveEndpoint`](crate::endpoint::ResolveEndpoint) and
//! [`StreamState`](crate::streaming::StreamState). This module hosts concrete
//! implementations of that seam. One integration is included; others follow
//! the same shape.

pub mod openai;
