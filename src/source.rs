//! Event source capability
//!
//! Abstracts the engine's instrumentation facility so that sessions never
//! depend on how the host actually raises call/return notifications.
//!
//! # Delivery contract
//!
//! Implementations must:
//! 1. Deliver synchronously, on the thread running the traced code, only to
//!    enabled subscriptions whose kind set contains the event's kind.
//! 2. Re-check a subscription's enabled state right before calling its hook,
//!    so a `disable` takes effect before the next notification.
//! 3. Never re-enter a hook that is already running; events raised by a
//!    hook's own work are not delivered to that hook.
//! 4. Disable a subscription whose hook returned an error, then propagate the
//!    error out of [`EventSource::invoke`].

use crate::error::{Result, SourceError};
use crate::event::{CallEvent, EventKind, EventSet, Location};
use crate::host::{ModuleRef, Value};
use std::fmt;

/// Callback registered with a subscription
pub type Hook = Box<dyn FnMut(&CallEvent<'_>) -> Result<()>>;

/// Box a closure as a [`Hook`]
pub fn hook<F>(f: F) -> Hook
where
    F: FnMut(&CallEvent<'_>) -> Result<()> + 'static,
{
    Box::new(f)
}

/// Identifier of one subscription on an event source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Description of one traceable invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    /// Call-entered kind raised for this invocation
    pub kind: EventKind,
    pub receiver: Value,
    /// Defining type; `None` lets the source use the receiver's lookup class
    pub defined_class: Option<ModuleRef>,
    pub method_id: String,
    /// Where the method is defined
    pub location: Location,
    /// Where the method is called from
    pub caller: Location,
}

impl CallSite {
    pub fn new(receiver: impl Into<Value>, method_id: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Call,
            receiver: receiver.into(),
            defined_class: None,
            method_id: method_id.into(),
            location: Location::new("", 0),
            caller: Location::new("", 0),
        }
    }

    /// Mark the method as natively implemented
    pub fn native(mut self) -> Self {
        self.kind = EventKind::CCall;
        self
    }

    /// Mark the invocation as a block
    pub fn block(mut self) -> Self {
        self.kind = EventKind::BlockCall;
        self
    }

    pub fn defined_in(mut self, module: ModuleRef) -> Self {
        self.defined_class = Some(module);
        self
    }

    pub fn defined_at(mut self, path: impl Into<String>, lineno: u32) -> Self {
        self.location = Location::new(path, lineno);
        self
    }

    pub fn called_from(mut self, path: impl Into<String>, lineno: u32) -> Self {
        self.caller = Location::new(path, lineno);
        self
    }
}

/// The engine's instrumentation facility
pub trait EventSource {
    /// Register a hook for `kinds`; the subscription starts disabled
    fn subscribe(&self, kinds: EventSet, hook: Hook) -> std::result::Result<SubscriptionId, SourceError>;

    fn enable(&self, id: SubscriptionId) -> std::result::Result<(), SourceError>;

    /// Stop delivery; disabling a disabled subscription is not an error
    fn disable(&self, id: SubscriptionId) -> std::result::Result<(), SourceError>;

    fn is_enabled(&self, id: SubscriptionId) -> bool;

    /// Drop the subscription and its hook; unknown ids are ignored
    fn release(&self, id: SubscriptionId);

    /// Sentinel type that owns session dispatch code
    ///
    /// Events whose defining type is this type were raised by a session's
    /// own machinery.
    fn session_type(&self) -> ModuleRef;

    /// Run `body` as a traceable invocation described by `site`
    fn invoke<R>(&self, site: CallSite, body: impl FnOnce() -> Result<R>) -> Result<R>;
}
