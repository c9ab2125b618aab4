//! Reactor orchestrator and public API
//!
//! This module provides the main [`Reactor`] struct that owns the worker pool,
//! the actor arena, and the isolate registry, and exposes the public interface
//! consumed by connector and driver code.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

// Submodules
pub mod action;
pub mod actor;
pub mod capability;
pub mod completion;
pub mod error;
pub mod isolate;
pub mod proxy;
pub mod reference;

use actor::{ActorCell, Dispatch};
use capability::check_implements;
use isolate::Isolate;
use proxy::ActorArena;
use reference::{ReferenceRegistry, Tombstones};

pub use action::ActionTag;
pub use actor::{ActorSnapshot, ActorStatus};
pub use capability::{Call, Capability, CapabilityDescriptor, Handler, MethodTable};
pub use completion::{Completion, CompletionState, Outcome, Payload};
pub use error::{CompletionError, HandlerResult, ReactorError, Result};
pub use isolate::{IsolateId, IsolateStatus};
pub use proxy::{Proxy, ProxyId};
pub use reference::CallbackReference;

/// What a stalled actor queue still lets through
///
/// The default is [`DestroyBypass`](Self::DestroyBypass), so a failed actor
/// can still be torn down. Choose [`Wedge`](Self::Wedge) for strict
/// fail-stop, where everything queued on a failed actor stays pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StallPolicy {
    /// A failed actor freezes entirely, its Destroy included
    Wedge,
    /// A queued Destroy overtakes a failed or blocked head and cancels
    /// everything else still queued
    DestroyBypass,
}

/// Configuration for the reactor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    /// Size of the shared worker pool
    pub worker_threads: usize,

    /// Actions one worker turn runs for an isolate before yielding
    pub turn_budget: usize,

    /// Resolved completions kept resolvable by reference
    pub completion_retention: usize,

    /// Handling of failed or blocked actor queues
    pub stall_policy: StallPolicy,

    /// Name given to worker threads
    pub thread_name: String,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            worker_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            turn_budget: 64,
            completion_retention: 4096,
            stall_policy: StallPolicy::DestroyBypass,
            thread_name: "switchyard-worker".to_string(),
        }
    }
}

impl ReactorConfig {
    /// Load a configuration from a JSON file; missing keys take defaults
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .map_err(|e| ReactorError::Config(format!("reading {}: {e}", path.display())))?;
        let config: Self = serde_json::from_slice(&data)
            .map_err(|e| ReactorError::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the reactor cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(ReactorError::Config("worker_threads must be at least 1".into()));
        }
        if self.turn_budget == 0 {
            return Err(ReactorError::Config("turn_budget must be at least 1".into()));
        }
        if self.completion_retention == 0 {
            return Err(ReactorError::Config(
                "completion_retention must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle of the reactor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReactorStatus {
    /// Accepting work
    Active,
    /// Tearing down isolates and actors
    Destroying,
    /// Worker pool stopped
    Destroyed,
}

/// Registry sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactorStats {
    /// Live proxies
    pub proxies: usize,
    /// Registered isolates
    pub isolates: usize,
    /// References still resolvable
    pub live_references: usize,
}

struct Lifecycle {
    status: ReactorStatus,
    shutdown: Option<Completion>,
}

/// State shared between the reactor handle, actors, and isolates
pub(crate) struct ReactorShared {
    config: ReactorConfig,
    pool: tokio::runtime::Handle,
    runtime: Mutex<Option<tokio::runtime::Runtime>>,
    pub(crate) actors: RwLock<ActorArena>,
    isolates: RwLock<HashMap<IsolateId, Arc<Isolate>>>,
    /// Destroy references of isolates that finished tearing down
    retired_isolates: Mutex<Tombstones<IsolateId>>,
    /// Runs teardown for actors destroyed before any assignment
    system: Arc<Isolate>,
    pub(crate) references: Arc<ReferenceRegistry>,
    lifecycle: Mutex<Lifecycle>,
}

impl ReactorShared {
    pub(crate) fn system_isolate(&self) -> Arc<Isolate> {
        self.system.clone()
    }

    fn isolate(&self, id: IsolateId) -> Result<Arc<Isolate>> {
        self.isolates
            .read()
            .get(&id)
            .cloned()
            .ok_or(ReactorError::UnknownIsolate(id))
    }

    pub(crate) fn actor_destroyed(
        &self,
        proxy: ProxyId,
        reference: CallbackReference,
        isolate: Option<Arc<Isolate>>,
    ) {
        self.actors.write().remove(proxy, Some(reference));
        if let Some(isolate) = isolate {
            isolate.actor_destroyed(proxy);
        }
        self.check_shutdown();
    }

    pub(crate) fn isolate_destroyed(&self, id: IsolateId, reference: CallbackReference) {
        self.retired_isolates.lock().record(id, reference);
        self.isolates.write().remove(&id);
        self.check_shutdown();
    }

    fn check_shutdown(&self) {
        let completion = {
            let lifecycle = self.lifecycle.lock();
            if lifecycle.status != ReactorStatus::Destroying {
                return;
            }
            if self.actors.read().len() > 0 || !self.isolates.read().is_empty() {
                return;
            }
            lifecycle.shutdown.clone()
        };
        if let Some(completion) = completion {
            completion.succeed(Arc::new(()));
        }
    }

    /// Stop the pool and break every actor/isolate link
    fn teardown(&self) {
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }

        let actors = self.actors.write().clear();
        for actor in actors {
            actor.sever();
        }
        let isolates: Vec<_> = self.isolates.write().drain().map(|(_, i)| i).collect();
        for isolate in isolates {
            isolate.sever();
        }
        self.system.sever();
    }
}

impl Drop for ReactorShared {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Process-wide registry of proxies and isolates
pub struct Reactor {
    shared: Arc<ReactorShared>,
}

impl Reactor {
    /// Create a reactor and start its worker pool
    pub fn new(config: ReactorConfig) -> Result<Self> {
        config.validate()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(config.worker_threads)
            .thread_name(config.thread_name.clone())
            .enable_time()
            .build()
            .map_err(|e| ReactorError::Init(format!("worker pool: {e}")))?;
        let pool = runtime.handle().clone();

        let shared = Arc::new_cyclic(|weak: &Weak<ReactorShared>| ReactorShared {
            system: Isolate::new(IsolateId::new(), pool.clone(), config.turn_budget, weak.clone()),
            references: ReferenceRegistry::new(config.completion_retention),
            runtime: Mutex::new(Some(runtime)),
            pool,
            actors: RwLock::new(ActorArena::new(config.completion_retention)),
            isolates: RwLock::new(HashMap::new()),
            retired_isolates: Mutex::new(Tombstones::new(config.completion_retention)),
            lifecycle: Mutex::new(Lifecycle {
                status: ReactorStatus::Active,
                shutdown: None,
            }),
            config,
        });

        tracing::debug!(
            workers = shared.config.worker_threads,
            policy = ?shared.config.stall_policy,
            "reactor started"
        );
        Ok(Self { shared })
    }

    /// Get the current configuration
    pub fn config(&self) -> &ReactorConfig {
        &self.shared.config
    }

    /// Allocate a proxy for capability `C`, with no handler and no isolate
    pub fn create_proxy<C: Capability>(&self) -> Result<Proxy<C>> {
        C::DESCRIPTOR.validate()?;

        let lifecycle = self.shared.lifecycle.lock();
        if lifecycle.status != ReactorStatus::Active {
            return Err(ReactorError::ReactorDestroying);
        }

        let weak = Arc::downgrade(&self.shared);
        let policy = self.shared.config.stall_policy;
        let id = self.shared.actors.write().insert(|id| {
            Arc::new(ActorCell::<C>::new(id, weak.clone(), policy)) as Arc<dyn Dispatch>
        });
        drop(lifecycle);

        tracing::debug!(proxy = %id, capability = C::DESCRIPTOR.name, "proxy created");
        Ok(Proxy::new(id, weak))
    }

    /// Allocate an isolate on the shared worker pool
    pub fn create_isolate(&self) -> Result<IsolateId> {
        let lifecycle = self.shared.lifecycle.lock();
        if lifecycle.status != ReactorStatus::Active {
            return Err(ReactorError::ReactorDestroying);
        }

        let id = IsolateId::new();
        let isolate = Isolate::new(
            id,
            self.shared.pool.clone(),
            self.shared.config.turn_budget,
            Arc::downgrade(&self.shared),
        );
        self.shared.isolates.write().insert(id, isolate);
        drop(lifecycle);

        tracing::debug!(isolate = %id, "isolate created");
        Ok(id)
    }

    /// Attach `handler` to `proxy`, binding the proxy to `isolate` on first use
    pub fn assign<C, H>(
        &self,
        proxy: &Proxy<C>,
        isolate: IsolateId,
        handler: H,
    ) -> Result<CallbackReference>
    where
        C: Capability,
        H: Handler<C>,
    {
        self.assign_boxed(proxy, isolate, Box::new(handler))
    }

    /// [`assign`](Self::assign) for an already boxed handler
    pub fn assign_boxed<C: Capability>(
        &self,
        proxy: &Proxy<C>,
        isolate: IsolateId,
        handler: Box<dyn Handler<C>>,
    ) -> Result<CallbackReference> {
        let cell = self.cell(proxy)?;
        let isolate = self.shared.isolate(isolate)?;
        check_implements::<C>(handler.as_ref())?;
        cell.assign(Some(isolate), Some(handler))
    }

    /// Detach the current handler; queued invokes block until a new one arrives
    pub fn unassign<C: Capability>(&self, proxy: &Proxy<C>) -> Result<CallbackReference> {
        self.cell(proxy)?.assign(None, None)
    }

    /// Tear a proxy down; repeated calls return the first reference
    pub fn destroy_proxy<C: Capability>(&self, proxy: &Proxy<C>) -> Result<CallbackReference> {
        if !proxy.belongs_to(&self.shared) {
            return Err(ReactorError::UnknownProxy(proxy.id()));
        }
        let actors = self.shared.actors.read();
        if let Some(reference) = actors.tombstone(proxy.id()) {
            return Ok(reference);
        }
        let actor = actors
            .get(proxy.id())
            .ok_or(ReactorError::UnknownProxy(proxy.id()))?;
        drop(actors);
        actor.request_destroy()
    }

    /// Tear an isolate down once its actors are destroyed
    pub fn destroy_isolate(&self, isolate: IsolateId) -> Result<CallbackReference> {
        if let Some(reference) = self.shared.retired_isolates.lock().get(&isolate) {
            return Ok(reference);
        }
        let isolate = self.shared.isolate(isolate)?;
        Ok(isolate.request_destroy(&self.shared.references))
    }

    /// Destroy every proxy and isolate, then stop the worker pool.
    ///
    /// Returns `true` once teardown has completed, `false` if `timeout`
    /// elapsed first. Safe to call repeatedly.
    pub fn destroy(&self, timeout: Option<Duration>) -> bool {
        let (shutdown, first) = {
            let mut lifecycle = self.shared.lifecycle.lock();
            match (lifecycle.status, &lifecycle.shutdown) {
                (ReactorStatus::Destroyed, _) => return true,
                (ReactorStatus::Destroying, Some(shutdown)) => (shutdown.clone(), false),
                _ => {
                    let shutdown = Completion::new();
                    lifecycle.status = ReactorStatus::Destroying;
                    lifecycle.shutdown = Some(shutdown.clone());
                    (shutdown, true)
                }
            }
        };

        if first {
            tracing::info!("reactor shutting down");
            let actors = self.shared.actors.read().entries();
            for actor in actors {
                let id = actor.id();
                if let Err(err) = actor.request_destroy() {
                    tracing::debug!(proxy = %id, error = %err, "destroy request skipped");
                }
            }
            let isolates: Vec<_> = self.shared.isolates.read().values().cloned().collect();
            for isolate in isolates {
                isolate.request_destroy(&self.shared.references);
            }
            self.shared.check_shutdown();
        }

        if shutdown.wait(timeout).is_err() {
            tracing::warn!(
                proxies = self.shared.actors.read().len(),
                isolates = self.shared.isolates.read().len(),
                "reactor shutdown still waiting"
            );
            return false;
        }

        self.shared.lifecycle.lock().status = ReactorStatus::Destroyed;
        self.shared.teardown();
        tracing::info!("reactor destroyed");
        true
    }

    /// Look up the completion behind a reference
    pub fn resolve(&self, reference: CallbackReference) -> Result<Completion> {
        self.shared.references.lookup(reference)
    }

    /// Inspect a proxy's actor
    pub fn actor_status<C: Capability>(&self, proxy: &Proxy<C>) -> Result<ActorSnapshot> {
        Ok(self.cell(proxy)?.snapshot())
    }

    /// Lifecycle status of an isolate; `Destroyed` once torn down
    pub fn isolate_status(&self, isolate: IsolateId) -> Result<IsolateStatus> {
        if self.shared.retired_isolates.lock().get(&isolate).is_some() {
            return Ok(IsolateStatus::Destroyed);
        }
        Ok(self.shared.isolate(isolate)?.status())
    }

    /// Number of actors bound to an isolate and not yet destroyed
    pub fn isolate_actors(&self, isolate: IsolateId) -> Result<usize> {
        Ok(self.shared.isolate(isolate)?.registered_count())
    }

    /// Reactor lifecycle status
    pub fn status(&self) -> ReactorStatus {
        self.shared.lifecycle.lock().status
    }

    /// Registry sizes
    pub fn stats(&self) -> ReactorStats {
        ReactorStats {
            proxies: self.shared.actors.read().len(),
            isolates: self.shared.isolates.read().len(),
            live_references: self.shared.references.len(),
        }
    }

    fn cell<C: Capability>(&self, proxy: &Proxy<C>) -> Result<Arc<ActorCell<C>>> {
        if !proxy.belongs_to(&self.shared) {
            return Err(ReactorError::UnknownProxy(proxy.id()));
        }
        proxy.cell()
    }
}
