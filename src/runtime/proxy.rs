//! Dispatch handles and the actor arena
//!
//! A [`Proxy`] is a lightweight value handle `{index, generation}` into the
//! reactor's arena of actors. Destroying a proxy bumps its slot's generation,
//! so stale handles are rejected instead of aliasing a newer actor.

use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use super::ReactorShared;
use super::actor::{ActorCell, Dispatch};
use super::capability::{Call, Capability};
use super::error::{ReactorError, Result};
use super::reference::{CallbackReference, Tombstones};

/// Generation-checked actor handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProxyId {
    index: u32,
    generation: u32,
}

impl ProxyId {
    /// Arena slot
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Slot generation this handle was issued for
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proxy#{}.{}", self.index, self.generation)
    }
}

/// Caller-facing handle for a capability interface
pub struct Proxy<C: Capability> {
    id: ProxyId,
    reactor: Weak<ReactorShared>,
    _capability: PhantomData<fn() -> C>,
}

impl<C: Capability> Proxy<C> {
    pub(crate) fn new(id: ProxyId, reactor: Weak<ReactorShared>) -> Self {
        Self {
            id,
            reactor,
            _capability: PhantomData,
        }
    }

    /// Arena handle
    pub fn id(&self) -> ProxyId {
        self.id
    }

    /// Enqueue one call on this proxy's actor.
    ///
    /// Returns immediately; the handler runs later on the actor's isolate.
    pub fn invoke(&self, call: C::Call) -> Result<CallbackReference> {
        if !C::DESCRIPTOR.declares(call.method()) {
            return Err(ReactorError::InvalidCapability {
                name: C::DESCRIPTOR.name.to_string(),
                detail: format!("method '{}' is not declared", call.method()),
            });
        }
        self.cell()?.invoke(call)
    }

    pub(crate) fn belongs_to(&self, reactor: &Arc<ReactorShared>) -> bool {
        std::ptr::eq(self.reactor.as_ptr(), Arc::as_ptr(reactor))
    }

    pub(crate) fn cell(&self) -> Result<Arc<ActorCell<C>>> {
        let reactor = self
            .reactor
            .upgrade()
            .ok_or(ReactorError::ReactorDestroying)?;
        let dispatch = reactor
            .actors
            .read()
            .get(self.id)
            .ok_or(ReactorError::UnknownProxy(self.id))?;

        dispatch
            .into_any()
            .downcast::<ActorCell<C>>()
            .map_err(|_| ReactorError::CapabilityMismatch {
                capability: C::DESCRIPTOR.name.to_string(),
                detail: format!("{} was created for another capability", self.id),
            })
    }
}

impl<C: Capability> Clone for Proxy<C> {
    fn clone(&self) -> Self {
        Self::new(self.id, self.reactor.clone())
    }
}

impl<C: Capability> PartialEq for Proxy<C> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Weak::ptr_eq(&self.reactor, &other.reactor)
    }
}

impl<C: Capability> Eq for Proxy<C> {}

impl<C: Capability> fmt::Debug for Proxy<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("id", &self.id)
            .field("capability", &C::DESCRIPTOR.name)
            .finish()
    }
}

struct Slot {
    generation: u32,
    entry: Option<Arc<dyn Dispatch>>,
}

/// Arena of live actors
pub(crate) struct ActorArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    /// Destroy references of removed actors, by full handle
    tombstones: Tombstones<ProxyId>,
}

impl ActorArena {
    /// Empty arena remembering up to `retention` destroyed handles
    pub(crate) fn new(retention: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            tombstones: Tombstones::new(retention),
        }
    }

    /// Allocate a slot and store the entry built for its id
    pub(crate) fn insert<F>(&mut self, build: F) -> ProxyId
    where
        F: FnOnce(ProxyId) -> Arc<dyn Dispatch>,
    {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        let id = ProxyId {
            index,
            generation: slot.generation,
        };
        slot.entry = Some(build(id));
        self.live += 1;
        id
    }

    pub(crate) fn get(&self, id: ProxyId) -> Option<Arc<dyn Dispatch>> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.clone())
    }

    /// Free the slot; stale handles stop resolving.
    ///
    /// `destroyed_by` is remembered so repeated destroy requests on the stale
    /// handle keep answering with the original reference.
    pub(crate) fn remove(
        &mut self,
        id: ProxyId,
        destroyed_by: Option<CallbackReference>,
    ) -> Option<Arc<dyn Dispatch>> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        if let Some(reference) = destroyed_by {
            self.tombstones.record(id, reference);
        }
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Some(entry)
    }

    /// Destroy reference recorded for a removed handle
    pub(crate) fn tombstone(&self, id: ProxyId) -> Option<CallbackReference> {
        self.tombstones.get(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }

    pub(crate) fn entries(&self) -> Vec<Arc<dyn Dispatch>> {
        self.slots
            .iter()
            .filter_map(|slot| slot.entry.clone())
            .collect()
    }

    pub(crate) fn clear(&mut self) -> Vec<Arc<dyn Dispatch>> {
        let drained = self
            .slots
            .iter_mut()
            .filter_map(|slot| {
                slot.generation = slot.generation.wrapping_add(1);
                slot.entry.take()
            })
            .collect();
        self.free = (0..self.slots.len() as u32).rev().collect();
        self.live = 0;
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::actor::ActorSnapshot;
    use std::any::Any;

    struct Stub(ProxyId);

    impl Dispatch for Stub {
        fn id(&self) -> ProxyId {
            self.0
        }

        fn run_next(self: Arc<Self>) {}

        fn request_destroy(self: Arc<Self>) -> Result<CallbackReference> {
            Err(ReactorError::UnknownProxy(self.0))
        }

        fn snapshot(&self) -> ActorSnapshot {
            unimplemented!("not used by arena tests")
        }

        fn sever(&self) {}

        fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    fn stub(id: ProxyId) -> Arc<dyn Dispatch> {
        Arc::new(Stub(id))
    }

    #[test]
    fn test_insert_and_get() {
        let mut arena = ActorArena::new(16);
        let a = arena.insert(stub);
        let b = arena.insert(stub);

        assert_ne!(a, b);
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.get(a).unwrap().id(), a);
    }

    #[test]
    fn test_stale_handle_rejected_after_reuse() {
        let mut arena = ActorArena::new(16);
        let old = arena.insert(stub);
        assert!(arena.remove(old, None).is_some());
        assert!(arena.remove(old, None).is_none());

        let reused = arena.insert(stub);
        assert_eq!(reused.index(), old.index());
        assert_ne!(reused.generation(), old.generation());
        assert!(arena.get(old).is_none());
        assert!(arena.get(reused).is_some());
    }

    #[test]
    fn test_tombstone_tracks_destroyed_generation() {
        let registry = crate::runtime::reference::ReferenceRegistry::new(4);
        let (reference, _completion) = registry.issue();

        let mut arena = ActorArena::new(16);
        let id = arena.insert(stub);
        assert!(arena.tombstone(id).is_none());

        arena.remove(id, Some(reference));
        assert_eq!(arena.tombstone(id), Some(reference));

        let next = arena.insert(stub);
        assert!(arena.tombstone(next).is_none());
        assert_eq!(arena.tombstone(id), Some(reference));

        // Destroying the slot's next occupant keeps the first answer.
        let (later, _later_completion) = registry.issue();
        arena.remove(next, Some(later));
        assert_eq!(next.index(), id.index());
        assert_eq!(arena.tombstone(id), Some(reference));
        assert_eq!(arena.tombstone(next), Some(later));
    }

    #[test]
    fn test_clear_invalidates_everything() {
        let mut arena = ActorArena::new(16);
        let ids: Vec<_> = (0..3).map(|_| arena.insert(stub)).collect();

        assert_eq!(arena.clear().len(), 3);
        assert_eq!(arena.len(), 0);
        assert!(ids.iter().all(|id| arena.get(*id).is_none()));
        assert!(arena.entries().is_empty());
    }
}
