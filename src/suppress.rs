//! # Instrumentation Suppression
//!
//! An instrumented call often triggers further instrumented calls underneath
//! it (a streaming transport re-entering the wrapped request path, a retry
//! layer re-dispatching). Suppression prevents those inner calls from opening
//! their own spans: while suppressed, the Call Wrapper executes originals
//! unmodified and creates no telemetry.
//!
//! Suppression is a value, not a hidden global: a [`SuppressionContext`] is a
//! cheap clonable handle, and [`SuppressionContext::suppress`] returns an RAII
//! guard that holds suppression for its lifetime and restores the prior state
//! on every exit path, including panics and cancelled futures. Guards nest;
//! dropping the inner guard leaves the outer scope's suppression intact.
//!
//! Propagation down the call graph is ambient: [`in_scope`] / [`in_scope_sync`]
//! bind a context to the current task so nested calls observe it without
//! explicit plumbing. When no context is bound, all calls share one
//! process-wide default context. Callers that run concurrent traffic and want
//! isolated suppression should bind a fresh context per task.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

tokio::task_local! {
    static AMBIENT: SuppressionContext;
}

static GLOBAL: OnceLock<SuppressionContext> = OnceLock::new();

/// A handle to one suppression scope chain. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct SuppressionContext {
    depth: Arc<AtomicUsize>,
}

impl SuppressionContext {
    /// A fresh, unsuppressed context.
    pub fn new() -> Self {
        Self::default()
    }

    /// The context ambient to the current task, or the process-wide default
    /// when none has been bound with [`in_scope`] / [`in_scope_sync`].
    pub fn current() -> Self {
        AMBIENT
            .try_with(SuppressionContext::clone)
            .unwrap_or_else(|_| GLOBAL.get_or_init(SuppressionContext::default).clone())
    }

    /// Whether any suppression guard on this context is still alive.
    pub fn is_suppressed(&self) -> bool {
        self.depth.load(Ordering::SeqCst) > 0
    }

    /// Enters a suppression scope. The returned guard keeps suppression
    /// active until dropped; nesting is supported and the prior state is
    /// restored exactly.
    pub fn suppress(&self) -> SuppressionGuard {
        self.depth.fetch_add(1, Ordering::SeqCst);
        SuppressionGuard {
            depth: Arc::clone(&self.depth),
        }
    }
}

/// RAII guard for one suppression scope. Restores the outer state on drop.
#[derive(Debug)]
pub struct SuppressionGuard {
    depth: Arc<AtomicUsize>,
}

impl Drop for SuppressionGuard {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Whether instrumentation is suppressed for the current task.
pub fn is_suppressed() -> bool {
    SuppressionContext::current().is_suppressed()
}

/// Runs `fut` with `ctx` bound as the current task's suppression context.
pub async fn in_scope<F>(ctx: SuppressionContext, fut: F) -> F::Output
where
    F: Future,
{
    AMBIENT.scope(ctx, fut).await
}

/// Synchronous twin of [`in_scope`] for blocking call paths.
pub fn in_scope_sync<T>(ctx: SuppressionContext, f: impl FnOnce() -> T) -> T {
    AMBIENT.sync_scope(ctx, f)
}
