//! Single-assignment completion cells
//!
//! A [`Completion`] starts pending and is resolved exactly once to success,
//! failure, or cancellation. Later resolution attempts are ignored, so
//! concurrent teardown paths can race to cancel the same Action safely.

use parking_lot::{Condvar, Mutex};
use std::any::{Any, type_name};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::error::CompletionError;

/// Type-erased success value produced by a handler
pub type Payload = Arc<dyn Any + Send + Sync>;

type Observer = Box<dyn FnOnce(&Outcome) + Send>;

/// Observable state of a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionState {
    /// Not yet resolved
    Pending,
    /// Resolved with a value
    Succeeded,
    /// Resolved with a captured error
    Failed,
    /// Resolved without running
    Cancelled,
}

/// Terminal outcome of a completion
#[derive(Clone)]
pub enum Outcome {
    /// Handler returned normally
    Succeeded(Payload),
    /// Handler returned an error or panicked
    Failed(Arc<anyhow::Error>),
    /// Action never ran
    Cancelled,
}

impl Outcome {
    /// State corresponding to this outcome
    pub fn state(&self) -> CompletionState {
        match self {
            Outcome::Succeeded(_) => CompletionState::Succeeded,
            Outcome::Failed(_) => CompletionState::Failed,
            Outcome::Cancelled => CompletionState::Cancelled,
        }
    }

    /// Convert into the value a resolver observes
    pub fn into_result(self) -> Result<Payload, CompletionError> {
        match self {
            Outcome::Succeeded(payload) => Ok(payload),
            Outcome::Failed(err) => Err(CompletionError::Failed(err)),
            Outcome::Cancelled => Err(CompletionError::Cancelled),
        }
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Succeeded(_) => f.write_str("Succeeded(..)"),
            Outcome::Failed(err) => write!(f, "Failed({err})"),
            Outcome::Cancelled => f.write_str("Cancelled"),
        }
    }
}

struct Slot {
    outcome: Option<Outcome>,
    observers: Vec<Observer>,
}

struct Inner {
    slot: Mutex<Slot>,
    resolved: Condvar,
    /// Whether callers may cancel through [`Completion::cancel`]
    cancellable: bool,
}

/// Shared single-assignment future
#[derive(Clone)]
pub struct Completion {
    inner: Arc<Inner>,
}

impl Completion {
    pub(crate) fn new() -> Self {
        Self::with_cancellable(true)
    }

    /// Completion of work that must run once queued, such as a Destroy
    pub(crate) fn pinned() -> Self {
        Self::with_cancellable(false)
    }

    fn with_cancellable(cancellable: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot {
                    outcome: None,
                    observers: Vec::new(),
                }),
                resolved: Condvar::new(),
                cancellable,
            }),
        }
    }

    /// Current state
    pub fn state(&self) -> CompletionState {
        self.inner
            .slot
            .lock()
            .outcome
            .as_ref()
            .map_or(CompletionState::Pending, Outcome::state)
    }

    /// Whether the completion has reached a terminal state
    pub fn is_resolved(&self) -> bool {
        self.inner.slot.lock().outcome.is_some()
    }

    /// Non-blocking check; `None` means not yet resolved
    pub fn try_outcome(&self) -> Option<Outcome> {
        self.inner.slot.lock().outcome.clone()
    }

    /// Cancel the completion if it is still pending.
    ///
    /// A queued Action whose completion was cancelled is skipped when it
    /// reaches the head of its Actor's queue. Returns `false` if the
    /// completion was already resolved, or if it belongs to a teardown
    /// (proxy or isolate destroy), which cannot be cancelled.
    pub fn cancel(&self) -> bool {
        self.inner.cancellable && self.abandon()
    }

    /// Whether [`cancel`](Self::cancel) can take effect
    pub fn is_cancellable(&self) -> bool {
        self.inner.cancellable
    }

    /// Resolve as cancelled regardless of pinning
    pub(crate) fn abandon(&self) -> bool {
        self.resolve(Outcome::Cancelled)
    }

    pub(crate) fn succeed(&self, payload: Payload) -> bool {
        self.resolve(Outcome::Succeeded(payload))
    }

    pub(crate) fn fail(&self, error: Arc<anyhow::Error>) -> bool {
        self.resolve(Outcome::Failed(error))
    }

    /// Resolve once; later calls are no-ops
    pub(crate) fn resolve(&self, outcome: Outcome) -> bool {
        let observers = {
            let mut slot = self.inner.slot.lock();
            if slot.outcome.is_some() {
                return false;
            }
            slot.outcome = Some(outcome.clone());
            std::mem::take(&mut slot.observers)
        };
        self.inner.resolved.notify_all();

        for observer in observers {
            observer(&outcome);
        }
        true
    }

    /// Register an observer.
    ///
    /// Runs on the resolving thread, or immediately on the caller's thread if
    /// the completion is already resolved.
    pub fn observe<F>(&self, observer: F)
    where
        F: FnOnce(&Outcome) + Send + 'static,
    {
        let ready = {
            let mut slot = self.inner.slot.lock();
            match &slot.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    slot.observers.push(Box::new(observer));
                    return;
                }
            }
        };
        observer(&ready);
    }

    /// Block until resolved, optionally bounded by `timeout`
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Payload, CompletionError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut slot = self.inner.slot.lock();
        loop {
            if let Some(outcome) = &slot.outcome {
                return outcome.clone().into_result();
            }
            match deadline {
                Some(deadline) => {
                    if self.inner.resolved.wait_until(&mut slot, deadline).timed_out()
                        && slot.outcome.is_none()
                    {
                        return Err(CompletionError::Timeout(timeout.unwrap_or_default()));
                    }
                }
                None => self.inner.resolved.wait(&mut slot),
            }
        }
    }

    /// Block until resolved and downcast the success payload
    pub fn wait_for<T>(&self, timeout: Option<Duration>) -> Result<Arc<T>, CompletionError>
    where
        T: Any + Send + Sync,
    {
        self.wait(timeout)?
            .downcast::<T>()
            .map_err(|_| CompletionError::TypeMismatch(type_name::<T>()))
    }

    /// Await resolution without blocking a thread
    pub async fn resolved(&self) -> Outcome {
        let (tx, rx) = futures::channel::oneshot::channel();
        self.observe(move |outcome| {
            let _ = tx.send(outcome.clone());
        });
        // The sender only drops unsent if the observer list is dropped,
        // which happens together with the last clone of this completion.
        rx.await.unwrap_or(Outcome::Cancelled)
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("state", &self.state())
            .finish()
    }
}
