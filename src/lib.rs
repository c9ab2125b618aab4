//! Switchyard – an ordered callback-dispatch reactor
//!
//! This crate decouples producers of completion events from the handlers that
//! consume them:
//! - Proxies: opaque dispatch handles for a capability interface
//! - Handlers: replaceable implementations bound to a proxy at runtime
//! - Isolates: logical single-threaded contexts sharing one worker pool
//! - Completions: single-assignment results correlated by callback reference
//!
//! Every call on a proxy is queued and executed later, in order, on the
//! proxy's isolate.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Reactor core: proxies, actors, isolates, and completions
pub mod runtime;

// Re-export key types for convenience
pub use runtime::{Reactor, ReactorConfig};

/// Current version of the Switchyard runtime
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
