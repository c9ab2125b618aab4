//! Callback references and the reference registry
//!
//! Every enqueued unit of work is issued a [`CallbackReference`] correlating it
//! with its [`Completion`]. The registry keeps resolved completions resolvable
//! for a bounded window, then forgets them.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use uuid::Uuid;

use super::completion::Completion;
use super::error::{ReactorError, Result};

/// Opaque correlator between a caller and a completion
///
/// References can only be minted by a reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackReference(Uuid);

impl CallbackReference {
    fn mint() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CallbackReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref:{}", self.0)
    }
}

#[derive(Default)]
struct Entries {
    live: HashMap<CallbackReference, Completion>,
    /// Resolved references, oldest first
    retired: VecDeque<CallbackReference>,
}

/// Registry of issued references
pub(crate) struct ReferenceRegistry {
    entries: Mutex<Entries>,
    retention: usize,
}

impl ReferenceRegistry {
    pub(crate) fn new(retention: usize) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(Entries::default()),
            retention,
        })
    }

    /// Mint a reference bound to a fresh pending completion
    pub(crate) fn issue(self: &Arc<Self>) -> (CallbackReference, Completion) {
        self.register(Completion::new())
    }

    /// Like [`issue`](Self::issue), for completions callers cannot cancel
    pub(crate) fn issue_pinned(self: &Arc<Self>) -> (CallbackReference, Completion) {
        self.register(Completion::pinned())
    }

    fn register(self: &Arc<Self>, completion: Completion) -> (CallbackReference, Completion) {
        let reference = CallbackReference::mint();
        self.entries.lock().live.insert(reference, completion.clone());

        let registry: Weak<Self> = Arc::downgrade(self);
        completion.observe(move |_| {
            if let Some(registry) = registry.upgrade() {
                registry.retire(reference);
            }
        });

        (reference, completion)
    }

    pub(crate) fn lookup(&self, reference: CallbackReference) -> Result<Completion> {
        self.entries
            .lock()
            .live
            .get(&reference)
            .cloned()
            .ok_or(ReactorError::UnknownReference(reference))
    }

    /// Number of references still resolvable
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().live.len()
    }

    fn retire(&self, reference: CallbackReference) {
        let mut entries = self.entries.lock();
        entries.retired.push_back(reference);
        while entries.retired.len() > self.retention {
            if let Some(evicted) = entries.retired.pop_front() {
                entries.live.remove(&evicted);
            }
        }
    }
}

/// Destroy references of torn-down handles, oldest evicted first
pub(crate) struct Tombstones<K> {
    entries: HashMap<K, CallbackReference>,
    order: VecDeque<K>,
    capacity: usize,
}

impl<K: Copy + Eq + Hash> Tombstones<K> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn record(&mut self, key: K, reference: CallbackReference) {
        if self.entries.insert(key, reference).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
    }

    pub(crate) fn get(&self, key: &K) -> Option<CallbackReference> {
        self.entries.get(key).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::completion::CompletionState;

    #[test]
    fn test_issue_and_lookup() {
        let registry = ReferenceRegistry::new(8);
        let (reference, completion) = registry.issue();

        let found = registry.lookup(reference).unwrap();
        completion.cancel();
        assert_eq!(found.state(), CompletionState::Cancelled);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_resolved_references_are_evicted_past_retention() {
        let registry = ReferenceRegistry::new(2);
        let issued: Vec<_> = (0..3).map(|_| registry.issue()).collect();

        for (_, completion) in &issued {
            completion.cancel();
        }

        assert!(matches!(
            registry.lookup(issued[0].0),
            Err(ReactorError::UnknownReference(_))
        ));
        assert!(registry.lookup(issued[1].0).is_ok());
        assert!(registry.lookup(issued[2].0).is_ok());
    }

    #[test]
    fn test_pending_references_are_never_evicted() {
        let registry = ReferenceRegistry::new(1);
        let (pending, _keep) = registry.issue();
        for _ in 0..4 {
            let (_, completion) = registry.issue();
            completion.cancel();
        }

        assert!(registry.lookup(pending).is_ok());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_tombstones_keep_each_key() {
        let mut tombstones = Tombstones::new(2);
        let first = CallbackReference::mint();
        let second = CallbackReference::mint();
        let third = CallbackReference::mint();

        tombstones.record(1u32, first);
        tombstones.record(2u32, second);
        assert_eq!(tombstones.get(&1), Some(first));
        assert_eq!(tombstones.get(&2), Some(second));

        tombstones.record(3u32, third);
        assert_eq!(tombstones.get(&1), None);
        assert_eq!(tombstones.get(&3), Some(third));
    }

    #[test]
    fn test_pinned_issue_cannot_be_cancelled() {
        let registry = ReferenceRegistry::new(4);
        let (reference, completion) = registry.issue_pinned();
        assert!(!completion.cancel());
        assert!(!registry.lookup(reference).unwrap().is_resolved());
    }
}
