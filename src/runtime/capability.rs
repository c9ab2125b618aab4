//! Capability interfaces and handlers
//!
//! A capability interface is a named set of methods. Each interface is
//! expressed as a type implementing [`Capability`], whose associated `Call`
//! is a tagged enum with one variant per method. Handlers implement
//! [`Handler`] for that capability; [`MethodTable`] builds one from closures.

use std::collections::{HashMap, HashSet};
use std::fmt;

use super::error::{HandlerResult, ReactorError, Result};
use super::proxy::Proxy;

/// Static description of a capability interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityDescriptor {
    /// Interface name
    pub name: &'static str,
    /// Method identifiers
    pub methods: &'static [&'static str],
}

impl CapabilityDescriptor {
    /// Check that this describes a usable interface
    pub fn validate(&self) -> Result<()> {
        let invalid = |detail: String| ReactorError::InvalidCapability {
            name: self.name.to_string(),
            detail,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("interface name is empty".to_string()));
        }
        if self.methods.is_empty() {
            return Err(invalid("interface declares no methods".to_string()));
        }

        let mut seen = HashSet::new();
        for method in self.methods {
            if method.trim().is_empty() {
                return Err(invalid("method identifier is empty".to_string()));
            }
            if !seen.insert(*method) {
                return Err(invalid(format!("method '{method}' declared twice")));
            }
        }
        Ok(())
    }

    /// Whether `method` is part of this interface
    pub fn declares(&self, method: &str) -> bool {
        self.methods.contains(&method)
    }
}

impl fmt::Display for CapabilityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{{}}}", self.name, self.methods.join(", "))
    }
}

/// One method call on a capability interface
pub trait Call: Send + 'static {
    /// Identifier of the method this call targets
    fn method(&self) -> &'static str;
}

/// A capability interface
pub trait Capability: Send + Sync + 'static {
    /// Tagged enum of the interface's calls
    type Call: Call;

    /// Value a successful call resolves to
    type Output: Send + Sync + 'static;

    /// Interface description
    const DESCRIPTOR: CapabilityDescriptor;
}

/// Consumer-supplied implementation of a capability interface
///
/// Handlers run on reactor workers, never on the caller's thread. Returning
/// an error from any method fails the Action that triggered it and freezes
/// the Actor. Panics are caught and treated the same way.
pub trait Handler<C: Capability>: Send + 'static {
    /// Execute one call
    fn invoke(&mut self, proxy: &Proxy<C>, call: C::Call) -> HandlerResult<C::Output>;

    /// Whether this handler serves `method`
    fn implements(&self, _method: &str) -> bool {
        true
    }

    /// First handler attached to the proxy
    fn registered(&mut self, _proxy: &Proxy<C>) -> HandlerResult<()> {
        Ok(())
    }

    /// Proxy destroyed while this handler was attached
    fn unregistered(&mut self, _proxy: &Proxy<C>) -> HandlerResult<()> {
        Ok(())
    }

    /// This handler is being replaced by `new` (or detached, if `None`)
    fn deassigned(
        &mut self,
        _proxy: &Proxy<C>,
        _new: Option<&dyn Handler<C>>,
    ) -> HandlerResult<()> {
        Ok(())
    }

    /// This handler replaced `old` (or was attached to an empty proxy)
    fn reassigned(
        &mut self,
        _proxy: &Proxy<C>,
        _old: Option<&dyn Handler<C>>,
    ) -> HandlerResult<()> {
        Ok(())
    }
}

/// Check that `handler` serves every method of `C`
pub(crate) fn check_implements<C: Capability>(handler: &dyn Handler<C>) -> Result<()> {
    let missing: Vec<_> = C::DESCRIPTOR
        .methods
        .iter()
        .filter(|method| !handler.implements(method))
        .copied()
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ReactorError::CapabilityMismatch {
            capability: C::DESCRIPTOR.name.to_string(),
            detail: format!("missing methods: {}", missing.join(", ")),
        })
    }
}

type Method<C> = Box<
    dyn FnMut(&Proxy<C>, <C as Capability>::Call) -> HandlerResult<<C as Capability>::Output>
        + Send,
>;

/// Handler built from an explicit method table
pub struct MethodTable<C: Capability> {
    methods: HashMap<&'static str, Method<C>>,
}

impl<C: Capability> MethodTable<C> {
    /// Empty table
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    /// Bind `method` to a closure, replacing any previous binding
    pub fn on<F>(mut self, method: &'static str, f: F) -> Self
    where
        F: FnMut(&Proxy<C>, C::Call) -> HandlerResult<C::Output> + Send + 'static,
    {
        self.methods.insert(method, Box::new(f));
        self
    }

    /// Number of bound methods
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether no methods are bound
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl<C: Capability> Default for MethodTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Capability> Handler<C> for MethodTable<C> {
    fn invoke(&mut self, proxy: &Proxy<C>, call: C::Call) -> HandlerResult<C::Output> {
        let method = call.method();
        match self.methods.get_mut(method) {
            Some(f) => f(proxy, call),
            None => anyhow::bail!("method '{}' is not bound in this table", method),
        }
    }

    fn implements(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }
}
