//! Error types for the interception engine
//!
//! Failures of the wrapped call itself are never represented here: the call
//! surface uses [`tower::BoxError`] and re-raises the original error value
//! unchanged. This enum covers only the engine's own bookkeeping, which is
//! logged and swallowed on the call path and surfaced only from explicit
//! operations such as [`UninstrumentHandle::revert`](crate::install::UninstrumentHandle::revert).

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, InterceptError>;

/// Errors raised by the interception engine itself.
#[derive(Debug, Error)]
pub enum InterceptError {
    /// The endpoint config resolver failed; the call proceeded unwrapped.
    #[error("endpoint resolver failed: {message}")]
    Resolver { message: String },

    /// Span enrichment or streaming aggregation failed; the call outcome was unaffected.
    #[error("span bookkeeping failed: {message}")]
    Bookkeeping { message: String },

    /// Restoring an original callable failed for one target.
    #[error("revert failed for target {target}: {message}")]
    Revert { target: String, message: String },

    /// One or more targets in a batch revert failed. Every target was attempted.
    #[error("batch revert failed for {} target(s)", failures.len())]
    BatchRevert { failures: Vec<InterceptError> },
}
