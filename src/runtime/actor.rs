//! Actors: per-proxy queues, handler binding, and action execution
//!
//! Each proxy owns exactly one actor. Actions queued on an actor run strictly
//! in order, one at a time, on the actor's isolate. The `scheduled` flag is
//! the single-writer token: whoever wins its compare-and-swap owns the
//! actor's handler and queue head until the action it picked has resolved.
//!
//! A failed action freezes the actor permanently. What a frozen or blocked
//! queue still lets through is decided by [`StallPolicy`].

use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use super::action::{Action, ActionKind, ActionTag};
use super::capability::{Call, Capability, Handler};
use super::completion::Completion;
use super::error::{HandlerResult, ReactorError, Result};
use super::isolate::{Isolate, IsolateId};
use super::proxy::{Proxy, ProxyId};
use super::reference::CallbackReference;
use super::{ReactorShared, StallPolicy};

/// Lifecycle of an actor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActorStatus {
    /// Accepting work
    Active,
    /// Destroy requested, not yet executed
    Destroying,
    /// Torn down
    Destroyed,
}

/// Point-in-time view of an actor
#[derive(Debug, Clone)]
pub struct ActorSnapshot {
    /// Proxy handle
    pub proxy: ProxyId,
    /// Capability the proxy was created for
    pub capability: &'static str,
    /// Lifecycle status
    pub status: ActorStatus,
    /// Whether an action has failed and the queue is frozen
    pub failed: bool,
    /// Actions waiting in the queue
    pub queued: usize,
    /// Whether a handler is attached
    pub has_handler: bool,
    /// Isolate chosen by the first assignment
    pub isolate: Option<IsolateId>,
}

/// Type-erased actor, as stored in the arena and isolate queues
pub(crate) trait Dispatch: Send + Sync {
    fn id(&self) -> ProxyId;

    /// Execute the next ready action, then reschedule
    fn run_next(self: Arc<Self>);

    /// Enqueue a Destroy action; repeated calls return the first reference
    fn request_destroy(self: Arc<Self>) -> Result<CallbackReference>;

    fn snapshot(&self) -> ActorSnapshot;

    /// Drop queue, handler, and isolate link without running anything
    fn sever(&self);

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

struct ActorState<C: Capability> {
    handler: Option<Box<dyn Handler<C>>>,
    isolate: Option<Arc<Isolate>>,
    queue: VecDeque<Action<C>>,
    status: ActorStatus,
    failed: bool,
    /// `registered` has fired on some handler
    registered: bool,
    /// A handler is bound, even while it is out executing
    attached: bool,
    destroy: Option<CallbackReference>,
}

impl<C: Capability> ActorState<C> {
    /// Index of the action allowed to run next, if any
    fn ready_index(&mut self, policy: StallPolicy) -> Option<usize> {
        while self.queue.front().is_some_and(Action::is_resolved) {
            self.queue.pop_front();
        }
        if self.status == ActorStatus::Destroyed {
            return None;
        }

        let head = self.queue.front()?;
        let blocked = matches!(head.kind, ActionKind::Invoke(_)) && self.handler.is_none();
        if !self.failed && !blocked {
            return Some(0);
        }

        if !self.failed {
            // A blocked invoke waits for the first assignment that brings a
            // handler; nothing queued behind a Destroy counts.
            let supplier = self
                .queue
                .iter()
                .take_while(|action| action.tag() != ActionTag::Destroy)
                .position(|action| !action.is_resolved() && action.supplies_handler());
            if supplier.is_some() {
                return supplier;
            }
        }

        match policy {
            StallPolicy::Wedge => None,
            StallPolicy::DestroyBypass => self
                .queue
                .iter()
                .position(|action| !action.is_resolved() && action.tag() == ActionTag::Destroy),
        }
    }
}

/// Live state of one dispatch handle
pub(crate) struct ActorCell<C: Capability> {
    proxy: Proxy<C>,
    reactor: Weak<ReactorShared>,
    policy: StallPolicy,
    scheduled: AtomicBool,
    state: Mutex<ActorState<C>>,
}

impl<C: Capability> ActorCell<C> {
    pub(crate) fn new(id: ProxyId, reactor: Weak<ReactorShared>, policy: StallPolicy) -> Self {
        Self {
            proxy: Proxy::new(id, reactor.clone()),
            reactor,
            policy,
            scheduled: AtomicBool::new(false),
            state: Mutex::new(ActorState {
                handler: None,
                isolate: None,
                queue: VecDeque::new(),
                status: ActorStatus::Active,
                failed: false,
                registered: false,
                attached: false,
                destroy: None,
            }),
        }
    }

    fn shared(&self) -> Result<Arc<ReactorShared>> {
        self.reactor.upgrade().ok_or(ReactorError::ReactorDestroying)
    }

    /// Queue an Invoke action
    pub(crate) fn invoke(self: &Arc<Self>, call: C::Call) -> Result<CallbackReference> {
        let reactor = self.shared()?;
        let reference = {
            let mut state = self.state.lock();
            if state.status == ActorStatus::Destroyed {
                return Err(ReactorError::UnknownProxy(self.proxy.id()));
            }
            let (reference, completion) = reactor.references.issue();
            state
                .queue
                .push_back(Action::new(reference, completion, ActionKind::Invoke(call)));
            reference
        };
        self.schedule();
        Ok(reference)
    }

    /// Queue an Assign action, binding the isolate on first use
    pub(crate) fn assign(
        self: &Arc<Self>,
        isolate: Option<Arc<Isolate>>,
        handler: Option<Box<dyn Handler<C>>>,
    ) -> Result<CallbackReference> {
        let reactor = self.shared()?;
        let id = self.proxy.id();
        let reference = {
            let mut state = self.state.lock();
            if state.status != ActorStatus::Active {
                return Err(ReactorError::ProxyDestroying(id));
            }

            if let Some(requested) = isolate {
                match state.isolate.as_ref().map(|bound| bound.id()) {
                    Some(bound) if bound != requested.id() => {
                        return Err(ReactorError::IsolateMismatch {
                            proxy: id,
                            bound,
                            requested: requested.id(),
                        });
                    }
                    Some(_) => requested.ensure_accepting()?,
                    None => {
                        requested.register(id)?;
                        tracing::debug!(proxy = %id, isolate = %requested.id(), "proxy bound to isolate");
                        state.isolate = Some(requested);
                    }
                }
            }

            let (reference, completion) = reactor.references.issue();
            state
                .queue
                .push_back(Action::new(reference, completion, ActionKind::Assign(handler)));
            reference
        };
        self.schedule();
        Ok(reference)
    }

    /// Submit this actor to its isolate if it has a ready action
    fn schedule(self: &Arc<Self>) {
        let target = {
            let mut state = self.state.lock();
            if state.ready_index(self.policy).is_none() {
                return;
            }
            state.isolate.clone()
        };

        if self
            .scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        // Only Destroy and detaching Assigns can be ready before an isolate
        // is bound; those run on the reactor's system isolate.
        let target = match target {
            Some(isolate) => isolate,
            None => match self.reactor.upgrade() {
                Some(reactor) => reactor.system_isolate(),
                None => {
                    self.scheduled.store(false, Ordering::Release);
                    return;
                }
            },
        };
        target.submit(self.clone());
    }

    fn execute(&self, action: Action<C>, handler: Option<Box<dyn Handler<C>>>, first: bool) {
        let Action {
            reference,
            completion,
            kind,
        } = action;

        let (tag, result) = match kind {
            ActionKind::Assign(new) => (ActionTag::Assign, self.run_assign(handler, new, first)),
            ActionKind::Invoke(call) => (ActionTag::Invoke, self.run_invoke(handler, call)),
            ActionKind::Destroy => return self.run_destroy(handler, reference, completion),
        };

        match result {
            Ok(payload) => {
                completion.succeed(payload);
            }
            Err(err) => {
                self.state.lock().failed = true;
                tracing::warn!(
                    proxy = %self.proxy.id(),
                    capability = C::DESCRIPTOR.name,
                    action = %tag,
                    reference = %reference,
                    error = %err,
                    "handler failed; actor frozen"
                );
                completion.fail(Arc::new(err));
            }
        }
    }

    fn run_assign(
        &self,
        old: Option<Box<dyn Handler<C>>>,
        new: Option<Box<dyn Handler<C>>>,
        first: bool,
    ) -> HandlerResult<Arc<dyn Any + Send + Sync>> {
        let mut old = old;
        let mut new = new;
        let proxy = &self.proxy;

        let result = guarded(|| {
            if let Some(old) = old.as_mut() {
                old.deassigned(proxy, new.as_deref())?;
            }
            if let Some(new) = new.as_mut() {
                if first {
                    new.registered(proxy)?;
                }
                new.reassigned(proxy, old.as_deref())?;
            }
            Ok(())
        });

        {
            let mut state = self.state.lock();
            if new.is_some() {
                state.registered = true;
            }
            state.attached = new.is_some();
            state.handler = new;
        }
        drop(old);
        result.map(|()| Arc::new(()) as Arc<dyn Any + Send + Sync>)
    }

    fn run_invoke(
        &self,
        handler: Option<Box<dyn Handler<C>>>,
        call: C::Call,
    ) -> HandlerResult<Arc<dyn Any + Send + Sync>> {
        let Some(mut handler) = handler else {
            anyhow::bail!("no handler attached for '{}'", call.method());
        };

        let result = guarded(|| handler.invoke(&self.proxy, call));
        self.state.lock().handler = Some(handler);
        result.map(|output| Arc::new(output) as Arc<dyn Any + Send + Sync>)
    }

    fn run_destroy(
        &self,
        handler: Option<Box<dyn Handler<C>>>,
        reference: CallbackReference,
        completion: Completion,
    ) {
        let id = self.proxy.id();
        let hook = match handler {
            Some(mut handler) => guarded(|| handler.unregistered(&self.proxy)),
            None => Ok(()),
        };

        let (remaining, isolate) = {
            let mut state = self.state.lock();
            state.handler = None;
            state.attached = false;
            state.status = ActorStatus::Destroyed;
            (std::mem::take(&mut state.queue), state.isolate.take())
        };

        let cancelled = remaining
            .into_iter()
            .filter(|action| action.completion.abandon())
            .count();
        tracing::debug!(proxy = %id, cancelled, "actor destroyed");

        // Leave the arena first so a resolved destroy implies an unknown proxy.
        if let Some(reactor) = self.reactor.upgrade() {
            reactor.actor_destroyed(id, reference, isolate);
        }

        match hook {
            Ok(()) => {
                completion.succeed(Arc::new(()));
            }
            Err(err) => {
                tracing::warn!(proxy = %id, reference = %reference, error = %err, "unregistered hook failed");
                completion.fail(Arc::new(err));
            }
        }
    }
}

impl<C: Capability> Dispatch for ActorCell<C> {
    fn id(&self) -> ProxyId {
        self.proxy.id()
    }

    fn run_next(self: Arc<Self>) {
        let picked = {
            let mut state = self.state.lock();
            match state.ready_index(self.policy) {
                Some(index) => state.queue.remove(index).map(|action| {
                    let handler = state.handler.take();
                    let first = !state.registered;
                    (action, handler, first)
                }),
                None => None,
            }
        };

        if let Some((action, handler, first)) = picked {
            self.execute(action, handler, first);
        }

        self.scheduled.store(false, Ordering::Release);
        self.schedule();
    }

    fn request_destroy(self: Arc<Self>) -> Result<CallbackReference> {
        let reactor = self.shared()?;
        let reference = {
            let mut state = self.state.lock();
            if let Some(reference) = state.destroy {
                return Ok(reference);
            }
            let (reference, completion) = reactor.references.issue_pinned();
            state
                .queue
                .push_back(Action::new(reference, completion, ActionKind::Destroy));
            state.status = ActorStatus::Destroying;
            state.destroy = Some(reference);
            reference
        };
        self.schedule();
        Ok(reference)
    }

    fn snapshot(&self) -> ActorSnapshot {
        let state = self.state.lock();
        ActorSnapshot {
            proxy: self.proxy.id(),
            capability: C::DESCRIPTOR.name,
            status: state.status,
            failed: state.failed,
            queued: state.queue.len(),
            has_handler: state.attached,
            isolate: state.isolate.as_ref().map(|isolate| isolate.id()),
        }
    }

    fn sever(&self) {
        let remaining = {
            let mut state = self.state.lock();
            state.handler = None;
            state.attached = false;
            state.isolate = None;
            state.status = ActorStatus::Destroyed;
            std::mem::take(&mut state.queue)
        };
        for action in remaining {
            action.completion.abandon();
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Run handler code, turning a panic into an ordinary failure
fn guarded<T>(f: impl FnOnce() -> HandlerResult<T>) -> HandlerResult<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            Err(anyhow::anyhow!("handler panicked: {message}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::capability::CapabilityDescriptor;
    use crate::runtime::reference::ReferenceRegistry;

    struct Echo;

    struct Ping;

    impl Call for Ping {
        fn method(&self) -> &'static str {
            "ping"
        }
    }

    impl Capability for Echo {
        type Call = Ping;
        type Output = ();
        const DESCRIPTOR: CapabilityDescriptor = CapabilityDescriptor {
            name: "echo",
            methods: &["ping"],
        };
    }

    struct Noop;

    impl Handler<Echo> for Noop {
        fn invoke(&mut self, _proxy: &Proxy<Echo>, _call: Ping) -> HandlerResult<()> {
            Ok(())
        }
    }

    fn state() -> ActorState<Echo> {
        ActorState {
            handler: None,
            isolate: None,
            queue: VecDeque::new(),
            status: ActorStatus::Active,
            failed: false,
            registered: false,
            attached: false,
            destroy: None,
        }
    }

    fn push(state: &mut ActorState<Echo>, registry: &Arc<ReferenceRegistry>, kind: ActionKind<Echo>) {
        let (reference, completion) = registry.issue();
        state.queue.push_back(Action::new(reference, completion, kind));
    }

    #[test]
    fn test_blocked_invoke_waits_for_supplying_assign() {
        let registry = ReferenceRegistry::new(16);
        let mut state = state();
        push(&mut state, &registry, ActionKind::Invoke(Ping));
        assert_eq!(state.ready_index(StallPolicy::Wedge), None);

        push(&mut state, &registry, ActionKind::Assign(Some(Box::new(Noop))));
        assert_eq!(state.ready_index(StallPolicy::Wedge), Some(1));

        state.handler = Some(Box::new(Noop));
        assert_eq!(state.ready_index(StallPolicy::Wedge), Some(0));
    }

    #[test]
    fn test_assign_behind_destroy_does_not_unblock() {
        let registry = ReferenceRegistry::new(16);
        let mut state = state();
        push(&mut state, &registry, ActionKind::Invoke(Ping));
        push(&mut state, &registry, ActionKind::Destroy);
        push(&mut state, &registry, ActionKind::Assign(Some(Box::new(Noop))));

        assert_eq!(state.ready_index(StallPolicy::Wedge), None);
        assert_eq!(state.ready_index(StallPolicy::DestroyBypass), Some(1));
    }

    #[test]
    fn test_failed_actor_only_releases_destroy_under_bypass() {
        let registry = ReferenceRegistry::new(16);
        let mut state = state();
        state.handler = Some(Box::new(Noop));
        state.failed = true;
        push(&mut state, &registry, ActionKind::Invoke(Ping));
        push(&mut state, &registry, ActionKind::Assign(Some(Box::new(Noop))));
        assert_eq!(state.ready_index(StallPolicy::DestroyBypass), None);

        push(&mut state, &registry, ActionKind::Destroy);
        assert_eq!(state.ready_index(StallPolicy::Wedge), None);
        assert_eq!(state.ready_index(StallPolicy::DestroyBypass), Some(2));
    }

    #[test]
    fn test_resolved_head_is_dropped() {
        let registry = ReferenceRegistry::new(16);
        let mut state = state();
        state.handler = Some(Box::new(Noop));
        push(&mut state, &registry, ActionKind::Invoke(Ping));
        push(&mut state, &registry, ActionKind::Invoke(Ping));

        state.queue[0].completion.cancel();
        assert_eq!(state.ready_index(StallPolicy::Wedge), Some(0));
        assert_eq!(state.queue.len(), 1);
    }

    #[test]
    fn test_guarded_captures_panics() {
        let result: HandlerResult<()> = guarded(|| panic!("kaboom"));
        let err = result.unwrap_err();
        assert!(err.to_string().contains("kaboom"));
    }
}
