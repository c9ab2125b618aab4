//! Isolates: logical single-threaded execution contexts
//!
//! An isolate groups actors and drains them on the shared worker pool. At
//! most one worker turn per isolate is in flight, so an isolate never runs
//! two of its actions concurrently. A turn executes one action per pending
//! actor before re-queueing it, which gives round-robin fairness between the
//! actors sharing the isolate.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use uuid::Uuid;

use super::ReactorShared;
use super::actor::Dispatch;
use super::completion::Completion;
use super::error::{ReactorError, Result};
use super::proxy::ProxyId;
use super::reference::{CallbackReference, ReferenceRegistry};

/// Isolate identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IsolateId(pub Uuid);

impl IsolateId {
    /// Create a new random IsolateId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for IsolateId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IsolateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "isolate:{}", self.0)
    }
}

/// Lifecycle of an isolate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolateStatus {
    /// Accepting assignments
    Active,
    /// Waiting for its actors to be destroyed
    Destroying,
    /// Torn down
    Destroyed,
}

struct IsolateState {
    status: IsolateStatus,
    registered: HashSet<ProxyId>,
    pending: VecDeque<Arc<dyn Dispatch>>,
    /// A worker turn is queued or running
    running: bool,
    destroy: Option<(CallbackReference, Completion)>,
}

pub(crate) struct Isolate {
    id: IsolateId,
    pool: Handle,
    turn_budget: usize,
    reactor: Weak<ReactorShared>,
    state: Mutex<IsolateState>,
}

impl Isolate {
    pub(crate) fn new(
        id: IsolateId,
        pool: Handle,
        turn_budget: usize,
        reactor: Weak<ReactorShared>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            pool,
            turn_budget: turn_budget.max(1),
            reactor,
            state: Mutex::new(IsolateState {
                status: IsolateStatus::Active,
                registered: HashSet::new(),
                pending: VecDeque::new(),
                running: false,
                destroy: None,
            }),
        })
    }

    pub(crate) fn id(&self) -> IsolateId {
        self.id
    }

    pub(crate) fn status(&self) -> IsolateStatus {
        self.state.lock().status
    }

    pub(crate) fn ensure_accepting(&self) -> Result<()> {
        match self.state.lock().status {
            IsolateStatus::Active => Ok(()),
            _ => Err(ReactorError::IsolateDestroying(self.id)),
        }
    }

    /// Record an actor as living under this isolate
    pub(crate) fn register(&self, proxy: ProxyId) -> Result<()> {
        let mut state = self.state.lock();
        if state.status != IsolateStatus::Active {
            return Err(ReactorError::IsolateDestroying(self.id));
        }
        state.registered.insert(proxy);
        Ok(())
    }

    pub(crate) fn registered_count(&self) -> usize {
        self.state.lock().registered.len()
    }

    /// Queue an actor with ready work, starting a worker turn if idle
    pub(crate) fn submit(self: &Arc<Self>, actor: Arc<dyn Dispatch>) {
        let start = {
            let mut state = self.state.lock();
            state.pending.push_back(actor);
            !std::mem::replace(&mut state.running, true)
        };
        if start {
            self.spawn_turn();
        }
    }

    fn spawn_turn(self: &Arc<Self>) {
        let isolate = self.clone();
        // Once the pool has shut down the turn is silently dropped.
        self.pool.spawn_blocking(move || isolate.run_turn());
    }

    fn run_turn(self: Arc<Self>) {
        for _ in 0..self.turn_budget {
            let next = {
                let mut state = self.state.lock();
                match state.pending.pop_front() {
                    Some(actor) => actor,
                    None => {
                        state.running = false;
                        return;
                    }
                }
            };
            next.run_next();
        }

        let more = {
            let mut state = self.state.lock();
            state.running = !state.pending.is_empty();
            state.running
        };
        if more {
            self.spawn_turn();
        }
    }

    /// Begin teardown; resolves once every registered actor is destroyed
    pub(crate) fn request_destroy(
        self: &Arc<Self>,
        references: &Arc<ReferenceRegistry>,
    ) -> CallbackReference {
        let (reference, idle) = {
            let mut state = self.state.lock();
            if let Some((reference, _)) = &state.destroy {
                return *reference;
            }
            let (reference, completion) = references.issue_pinned();
            state.destroy = Some((reference, completion));
            if state.status == IsolateStatus::Active {
                state.status = IsolateStatus::Destroying;
            }
            (reference, state.registered.is_empty())
        };

        tracing::debug!(isolate = %self.id, "isolate destroy requested");
        if idle {
            self.finish();
        }
        reference
    }

    pub(crate) fn actor_destroyed(&self, proxy: ProxyId) {
        let idle = {
            let mut state = self.state.lock();
            state.registered.remove(&proxy);
            state.status == IsolateStatus::Destroying && state.registered.is_empty()
        };
        if idle {
            self.finish();
        }
    }

    fn finish(&self) {
        let (reference, completion) = {
            let mut state = self.state.lock();
            if state.status == IsolateStatus::Destroyed {
                return;
            }
            match state.destroy.clone() {
                Some(destroy) => {
                    state.status = IsolateStatus::Destroyed;
                    destroy
                }
                None => return,
            }
        };

        tracing::debug!(isolate = %self.id, "isolate destroyed");
        if let Some(reactor) = self.reactor.upgrade() {
            reactor.isolate_destroyed(self.id, reference);
        }
        completion.succeed(Arc::new(()));
    }

    /// Drop queued actors without running them
    pub(crate) fn sever(&self) {
        let pending = {
            let mut state = self.state.lock();
            state.registered.clear();
            std::mem::take(&mut state.pending)
        };
        drop(pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::actor::ActorSnapshot;
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Tally {
        id: ProxyId,
        remaining: AtomicUsize,
        log: Arc<Mutex<Vec<u32>>>,
        isolate: Mutex<Option<Arc<Isolate>>>,
    }

    impl Dispatch for Tally {
        fn id(&self) -> ProxyId {
            self.id
        }

        fn run_next(self: Arc<Self>) {
            self.log.lock().push(self.id.index());
            if self.remaining.fetch_sub(1, Ordering::SeqCst) > 1 {
                let isolate = self.isolate.lock().clone();
                if let Some(isolate) = isolate {
                    isolate.submit(self);
                }
            }
        }

        fn request_destroy(self: Arc<Self>) -> Result<CallbackReference> {
            Err(ReactorError::UnknownProxy(self.id))
        }

        fn snapshot(&self) -> ActorSnapshot {
            unimplemented!("not used by isolate tests")
        }

        fn sever(&self) {}

        fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    fn pool() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(2)
            .build()
            .unwrap()
    }

    #[test]
    fn test_round_robin_between_actors() {
        let runtime = pool();
        let isolate = Isolate::new(IsolateId::new(), runtime.handle().clone(), 64, Weak::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut arena = crate::runtime::proxy::ActorArena::new(16);
        let actors: Vec<Arc<Tally>> = (0..2)
            .map(|_| {
                let mut tally = None;
                arena.insert(|id| {
                    let actor = Arc::new(Tally {
                        id,
                        remaining: AtomicUsize::new(3),
                        log: log.clone(),
                        isolate: Mutex::new(Some(isolate.clone())),
                    });
                    tally = Some(actor.clone());
                    actor as Arc<dyn Dispatch>
                });
                tally.unwrap()
            })
            .collect();

        // Hold the state lock so both submissions land before the turn starts.
        {
            let mut state = isolate.state.lock();
            state.running = true;
            for actor in &actors {
                state.pending.push_back(actor.clone());
            }
        }
        isolate.spawn_turn();

        for _ in 0..100 {
            if log.lock().len() == 6 && !isolate.state.lock().running {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        let a = actors[0].id.index();
        let b = actors[1].id.index();
        assert_eq!(*log.lock(), vec![a, b, a, b, a, b]);
        assert!(!isolate.state.lock().running);
        for actor in &actors {
            *actor.isolate.lock() = None;
        }
    }

    #[test]
    fn test_destroy_waits_for_registered_actors() {
        let runtime = pool();
        let isolate = Isolate::new(IsolateId::new(), runtime.handle().clone(), 8, Weak::new());
        let references = ReferenceRegistry::new(16);
        let mut arena = crate::runtime::proxy::ActorArena::new(16);
        let first = arena.insert(|id| {
            Arc::new(Tally {
                id,
                remaining: AtomicUsize::new(0),
                log: Arc::new(Mutex::new(Vec::new())),
                isolate: Mutex::new(None),
            }) as Arc<dyn Dispatch>
        });
        let second = arena.insert(|id| {
            Arc::new(Tally {
                id,
                remaining: AtomicUsize::new(0),
                log: Arc::new(Mutex::new(Vec::new())),
                isolate: Mutex::new(None),
            }) as Arc<dyn Dispatch>
        });
        isolate.register(first).unwrap();
        isolate.register(second).unwrap();

        let reference = isolate.request_destroy(&references);
        assert_eq!(isolate.request_destroy(&references), reference);
        assert_eq!(isolate.status(), IsolateStatus::Destroying);
        assert!(matches!(
            isolate.register(first),
            Err(ReactorError::IsolateDestroying(_))
        ));

        isolate.actor_destroyed(first);
        assert_eq!(isolate.status(), IsolateStatus::Destroying);
        isolate.actor_destroyed(second);
        assert_eq!(isolate.status(), IsolateStatus::Destroyed);
        assert!(references.lookup(reference).unwrap().is_resolved());
    }
}
