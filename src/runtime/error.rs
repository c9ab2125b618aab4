//! Error types for the dispatch reactor
//!
//! Registration-time failures are surfaced synchronously as [`ReactorError`].
//! Failures raised while an Action executes are captured into its
//! [`Completion`](super::completion::Completion) and observed through
//! [`CompletionError`] by whoever resolves it.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::isolate::IsolateId;
use super::proxy::ProxyId;
use super::reference::CallbackReference;

/// Top-level reactor error
#[derive(Debug, Error)]
pub enum ReactorError {
    /// The capability descriptor is not a valid interface description
    #[error("Invalid capability '{name}': {detail}")]
    InvalidCapability {
        /// Capability name as declared
        name: String,
        /// What is wrong with it
        detail: String,
    },

    /// Proxy is not registered (never was, or already destroyed)
    #[error("Proxy {0} is not registered")]
    UnknownProxy(ProxyId),

    /// Isolate is not registered
    #[error("Isolate {0} is not registered")]
    UnknownIsolate(IsolateId),

    /// Reference was never issued or has been garbage-collected
    #[error("Callback reference {0} is unknown")]
    UnknownReference(CallbackReference),

    /// Handler does not implement the proxy's capability set
    #[error("Handler does not implement capability '{capability}': {detail}")]
    CapabilityMismatch {
        /// Capability the proxy was created for
        capability: String,
        /// Missing method or type disagreement
        detail: String,
    },

    /// Proxy is already bound to another isolate
    #[error("Proxy {proxy} is bound to isolate {bound}, not {requested}")]
    IsolateMismatch {
        /// Proxy being assigned
        proxy: ProxyId,
        /// Isolate chosen by the first assignment
        bound: IsolateId,
        /// Isolate named by this call
        requested: IsolateId,
    },

    /// Isolate is being torn down and refuses new assignments
    #[error("Isolate {0} is being destroyed")]
    IsolateDestroying(IsolateId),

    /// Proxy is being torn down and refuses new assignments
    #[error("Proxy {0} is being destroyed")]
    ProxyDestroying(ProxyId),

    /// Reactor is shutting down
    #[error("Reactor is being destroyed")]
    ReactorDestroying,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Worker pool could not be started
    #[error("Initialization failed: {0}")]
    Init(String),
}

/// Error observed when resolving a [`Completion`](super::completion::Completion)
#[derive(Debug, Clone, Error)]
pub enum CompletionError {
    /// The Action's handler failed; carries the captured error
    #[error("Action failed: {0}")]
    Failed(Arc<anyhow::Error>),

    /// The Action was cancelled before it executed
    #[error("Action was cancelled")]
    Cancelled,

    /// The Completion did not resolve within the timeout
    #[error("Not resolved after {0:?}")]
    Timeout(Duration),

    /// The success payload is not of the requested type
    #[error("Result is not a {0}")]
    TypeMismatch(&'static str),
}

impl CompletionError {
    /// The captured handler error, if this is a failure
    pub fn handler_error(&self) -> Option<&anyhow::Error> {
        match self {
            CompletionError::Failed(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// Result type using ReactorError
pub type Result<T> = std::result::Result<T, ReactorError>;

/// Result type handlers return from their methods and hooks
pub type HandlerResult<T> = anyhow::Result<T>;
