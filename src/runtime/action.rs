//! Deferred units of work against one actor

use std::fmt;

use super::capability::{Call, Capability, Handler};
use super::completion::Completion;
use super::reference::CallbackReference;

/// Kind of an action, for inspection and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionTag {
    /// Attach, replace, or detach the handler
    Assign,
    /// Deliver one method call
    Invoke,
    /// Tear the actor down
    Destroy,
}

impl fmt::Display for ActionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActionTag::Assign => "assign",
            ActionTag::Invoke => "invoke",
            ActionTag::Destroy => "destroy",
        })
    }
}

pub(crate) enum ActionKind<C: Capability> {
    /// New handler; `None` detaches the current one
    Assign(Option<Box<dyn Handler<C>>>),
    Invoke(C::Call),
    Destroy,
}

/// One queued action and the completion it owns
pub(crate) struct Action<C: Capability> {
    pub(crate) reference: CallbackReference,
    pub(crate) completion: Completion,
    pub(crate) kind: ActionKind<C>,
}

impl<C: Capability> Action<C> {
    pub(crate) fn new(
        reference: CallbackReference,
        completion: Completion,
        kind: ActionKind<C>,
    ) -> Self {
        Self {
            reference,
            completion,
            kind,
        }
    }

    pub(crate) fn tag(&self) -> ActionTag {
        match self.kind {
            ActionKind::Assign(_) => ActionTag::Assign,
            ActionKind::Invoke(_) => ActionTag::Invoke,
            ActionKind::Destroy => ActionTag::Destroy,
        }
    }

    /// Resolved before running, e.g. cancelled by its owner
    pub(crate) fn is_resolved(&self) -> bool {
        self.completion.is_resolved()
    }

    /// Assign that attaches a handler
    pub(crate) fn supplies_handler(&self) -> bool {
        matches!(self.kind, ActionKind::Assign(Some(_)))
    }

    pub(crate) fn method(&self) -> Option<&'static str> {
        match &self.kind {
            ActionKind::Invoke(call) => Some(call.method()),
            _ => None,
        }
    }
}

impl<C: Capability> fmt::Debug for Action<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("tag", &self.tag())
            .field("method", &self.method())
            .field("reference", &self.reference)
            .field("state", &self.completion.state())
            .finish()
    }
}
