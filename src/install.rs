//! # Install and Revert
//!
//! Interception is a proxy swap, not a mutation of the client: a client
//! routes its transport through a call slot ([`SyncSlot`] / [`AsyncSlot`]),
//! and instrumenting the slot replaces its current callable with a wrapper
//! that dispatches to the recorded original. Reverting restores the exact
//! original `Arc` and clears the instrumented flag, so the target behaves as
//! if it was never touched and can be instrumented again later.
//!
//! Rules, in order of importance:
//! - **Idempotent**: instrumenting an already-instrumented slot is a no-op
//!   returning a no-op handle.
//! - **Reversible**: [`UninstrumentHandle::revert`] verifies the installed
//!   wrapper is still in place (pointer identity); if the slot was mutated
//!   externally in the interim the revert fails for that target and is
//!   logged, without touching the slot.
//! - **Batch-safe**: a combined handle reverts targets in reverse install
//!   order and attempts every one even when an earlier revert fails.
//! - **Single-writer**: install and revert take the slot's write lock; calls
//!   take the read lock only to clone the current callable.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tower::BoxError;
use tracing::{debug, error};

use crate::call::{AsyncCall, BlockingOutcome, CallOutcome, CallRequest, SyncCall};
use crate::error::{InterceptError, Result};
use crate::wrap::{AsyncInterceptor, InterceptConfig, SyncInterceptor};

struct SlotState<T: ?Sized> {
    current: Arc<T>,
    original: Option<Arc<T>>,
    instrumented: bool,
}

/// A swappable blocking call target. Clients dispatch through the slot so
/// interception never has to reach into the client itself.
pub struct SyncSlot {
    label: String,
    state: RwLock<SlotState<dyn SyncCall>>,
}

/// The async twin of [`SyncSlot`].
pub struct AsyncSlot {
    label: String,
    state: RwLock<SlotState<dyn AsyncCall>>,
}

macro_rules! slot_common {
    ($slot:ident, $call:ident) => {
        impl $slot {
            /// Creates a slot around the original callable. `label` names the
            /// target in logs and revert errors.
            pub fn new(label: impl Into<String>, original: Arc<dyn $call>) -> Arc<Self> {
                Arc::new(Self {
                    label: label.into(),
                    state: RwLock::new(SlotState {
                        current: original,
                        original: None,
                        instrumented: false,
                    }),
                })
            }

            /// The callable calls currently dispatch to.
            pub fn current(&self) -> Arc<dyn $call> {
                Arc::clone(&self.state.read().unwrap().current)
            }

            /// Whether a wrapper is currently installed.
            pub fn is_instrumented(&self) -> bool {
                self.state.read().unwrap().instrumented
            }

            /// Replaces the current callable outright, outside the
            /// instrument/revert protocol. A pending revert for a wrapper
            /// displaced this way will fail rather than clobber the new value.
            pub fn replace(&self, callable: Arc<dyn $call>) {
                self.state.write().unwrap().current = callable;
            }

            pub fn label(&self) -> &str {
                &self.label
            }
        }
    };
}

slot_common!(SyncSlot, SyncCall);
slot_common!(AsyncSlot, AsyncCall);

impl SyncCall for SyncSlot {
    fn call(&self, request: CallRequest) -> std::result::Result<BlockingOutcome, BoxError> {
        let current = self.current();
        current.call(request)
    }
}

#[async_trait]
impl AsyncCall for AsyncSlot {
    async fn call(&self, request: CallRequest) -> std::result::Result<CallOutcome, BoxError> {
        let current = self.current();
        current.call(request).await
    }
}

/// A target selected for interception, with its sync/async nature resolved
/// once at install time.
#[derive(Clone)]
pub enum Target {
    Sync(Arc<SyncSlot>),
    Async(Arc<AsyncSlot>),
}

impl From<Arc<SyncSlot>> for Target {
    fn from(slot: Arc<SyncSlot>) -> Self {
        Target::Sync(slot)
    }
}

impl From<Arc<AsyncSlot>> for Target {
    fn from(slot: Arc<AsyncSlot>) -> Self {
        Target::Async(slot)
    }
}

enum Revert {
    Noop,
    Sync {
        slot: Arc<SyncSlot>,
        installed: Arc<dyn SyncCall>,
    },
    Async {
        slot: Arc<AsyncSlot>,
        installed: Arc<dyn AsyncCall>,
    },
}

impl Revert {
    fn apply(self) -> Result<()> {
        match self {
            Revert::Noop => Ok(()),
            Revert::Sync { slot, installed } => {
                let mut state = slot.state.write().unwrap();
                if !Arc::ptr_eq(&state.current, &installed) {
                    return Err(InterceptError::Revert {
                        target: slot.label.clone(),
                        message: "target mutated externally since install".to_string(),
                    });
                }
                match state.original.take() {
                    Some(original) => {
                        state.current = original;
                        state.instrumented = false;
                        Ok(())
                    }
                    None => Err(InterceptError::Revert {
                        target: slot.label.clone(),
                        message: "original callable record missing".to_string(),
                    }),
                }
            }
            Revert::Async { slot, installed } => {
                let mut state = slot.state.write().unwrap();
                if !Arc::ptr_eq(&state.current, &installed) {
                    return Err(InterceptError::Revert {
                        target: slot.label.clone(),
                        message: "target mutated externally since install".to_string(),
                    });
                }
                match state.original.take() {
                    Some(original) => {
                        state.current = original;
                        state.instrumented = false;
                        Ok(())
                    }
                    None => Err(InterceptError::Revert {
                        target: slot.label.clone(),
                        message: "original callable record missing".to_string(),
                    }),
                }
            }
        }
    }
}

/// Reverts one `instrument` call. Invoking it is optional; instrumentation is
/// otherwise permanent for the process.
#[must_use = "dropping the handle leaves the target instrumented"]
pub struct UninstrumentHandle {
    reverts: Vec<Revert>,
}

impl UninstrumentHandle {
    /// A handle whose revert does nothing.
    pub fn noop() -> Self {
        Self {
            reverts: Vec::new(),
        }
    }

    /// Restores every target of the originating `instrument` call, in reverse
    /// install order. Every target is attempted even if an earlier one fails;
    /// each failure is logged individually and the aggregate is returned.
    pub fn revert(self) -> Result<()> {
        let mut failures = Vec::new();
        for revert in self.reverts.into_iter().rev() {
            if let Err(err) = revert.apply() {
                error!(error = %err, "failed to revert instrumentation");
                failures.push(err);
            }
        }
        match (failures.pop(), failures.is_empty()) {
            (None, _) => Ok(()),
            (Some(only), true) => Err(only),
            (Some(last), false) => {
                failures.push(last);
                Err(InterceptError::BatchRevert { failures })
            }
        }
    }
}

fn install_one(target: &Target, config: InterceptConfig) -> Revert {
    match target {
        Target::Sync(slot) => {
            let mut state = slot.state.write().unwrap();
            if state.instrumented {
                debug!(target = %slot.label, "already instrumented; skipping");
                return Revert::Noop;
            }
            let original = Arc::clone(&state.current);
            let installed: Arc<dyn SyncCall> =
                Arc::new(SyncInterceptor::new(original, config));
            state.original = Some(Arc::clone(&state.current));
            state.current = Arc::clone(&installed);
            state.instrumented = true;
            Revert::Sync {
                slot: Arc::clone(slot),
                installed,
            }
        }
        Target::Async(slot) => {
            let mut state = slot.state.write().unwrap();
            if state.instrumented {
                debug!(target = %slot.label, "already instrumented; skipping");
                return Revert::Noop;
            }
            let original = Arc::clone(&state.current);
            let installed: Arc<dyn AsyncCall> =
                Arc::new(AsyncInterceptor::new(original, config));
            state.original = Some(Arc::clone(&state.current));
            state.current = Arc::clone(&installed);
            state.instrumented = true;
            Revert::Async {
                slot: Arc::clone(slot),
                installed,
            }
        }
    }
}

/// Installs the call wrapper on one target. Idempotent: an instrumented
/// target yields a no-op handle.
pub fn instrument(target: &Target, config: InterceptConfig) -> UninstrumentHandle {
    UninstrumentHandle {
        reverts: vec![install_one(target, config)],
    }
}

/// Installs the call wrapper on each target independently, returning one
/// combined handle that reverts all of them in reverse install order.
pub fn instrument_all(
    targets: impl IntoIterator<Item = Target>,
    config: InterceptConfig,
) -> UninstrumentHandle {
    UninstrumentHandle {
        reverts: targets
            .into_iter()
            .map(|target| install_one(&target, config.clone()))
            .collect(),
    }
}
