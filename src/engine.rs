//! In-process reference execution engine
//!
//! A single-threaded engine that owns an [`ObjectSpace`], keeps a frame stack
//! of caller locations and raises call/return notifications around every
//! [`EventSource::invoke`]. It is the event source used by the CLI replayer,
//! the benches and the tests.

use crate::error::{Result, SourceError};
use crate::event::{CallEvent, EventKind, EventSet, Location};
use crate::host::{ModuleRef, ObjectSpace};
use crate::source::{CallSite, EventSource, Hook, SubscriptionId};
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::rc::Rc;

/// Name of the class that owns session dispatch code
pub const SESSION_TYPE_NAME: &str = "DiverDown::Trace::Session";

struct Slot {
    id: SubscriptionId,
    kinds: EventSet,
    enabled: bool,
    hook: Rc<RefCell<Hook>>,
}

/// Reference engine implementing [`EventSource`]
pub struct Engine {
    space: RefCell<ObjectSpace>,
    slots: RefCell<Vec<Slot>>,
    /// Caller locations of active invocations, outermost first
    frames: RefCell<Vec<Location>>,
    next_id: Cell<u64>,
    enabled_limit: Option<usize>,
    torn_down: Cell<bool>,
    session_type: ModuleRef,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self::with_space(ObjectSpace::new())
    }

    /// Engine over an existing object space
    pub fn with_space(mut space: ObjectSpace) -> Self {
        let session_type = match space.lookup_const(SESSION_TYPE_NAME) {
            Some(existing) => existing,
            None => space.define_class(SESSION_TYPE_NAME, None),
        };
        Self {
            space: RefCell::new(space),
            slots: RefCell::new(Vec::new()),
            frames: RefCell::new(Vec::new()),
            next_id: Cell::new(1),
            enabled_limit: None,
            torn_down: Cell::new(false),
            session_type,
        }
    }

    /// Engine that refuses to enable more than `limit` subscriptions at once
    pub fn with_limit(limit: usize) -> Self {
        Self {
            enabled_limit: Some(limit),
            ..Self::new()
        }
    }

    /// Borrow the object space
    pub fn space(&self) -> Ref<'_, ObjectSpace> {
        self.space.borrow()
    }

    /// Mutably borrow the object space
    ///
    /// # Panics
    ///
    /// Panics when called from inside a hook, since the delivered event
    /// borrows the space.
    pub fn space_mut(&self) -> RefMut<'_, ObjectSpace> {
        self.space.borrow_mut()
    }

    /// Tear the engine down: every subscription is disabled and no
    /// subscription can be created or enabled afterwards
    pub fn shutdown(&self) {
        self.torn_down.set(true);
        for slot in self.slots.borrow_mut().iter_mut() {
            slot.enabled = false;
        }
        tracing::debug!("engine torn down");
    }

    /// Number of live subscriptions, enabled or not
    pub fn subscription_count(&self) -> usize {
        self.slots.borrow().len()
    }

    pub fn enabled_count(&self) -> usize {
        self.slots.borrow().iter().filter(|slot| slot.enabled).count()
    }

    /// Number of active invocations
    pub fn depth(&self) -> usize {
        self.frames.borrow().len()
    }

    /// Raise a single notification outside of any invocation bookkeeping
    ///
    /// Used to replay stray events, e.g. a return whose call was never seen.
    pub fn raise_event(&self, kind: EventKind, site: &CallSite) -> Result<()> {
        let defined_class = self.defined_class(site);
        self.deliver(kind, defined_class, site)
    }

    fn defined_class(&self, site: &CallSite) -> ModuleRef {
        site.defined_class
            .unwrap_or_else(|| self.space.borrow().lookup_class(site.receiver))
    }

    fn deliver(&self, kind: EventKind, defined_class: ModuleRef, site: &CallSite) -> Result<()> {
        self.deliver_to(kind, defined_class, site, None).1
    }

    /// Deliver `kind` to enabled subscriptions, restricted to `only` when given
    ///
    /// Stops at the first failing hook. Returns the subscriptions whose hook
    /// ran successfully together with that failure.
    fn deliver_to(
        &self,
        kind: EventKind,
        defined_class: ModuleRef,
        site: &CallSite,
        only: Option<&[SubscriptionId]>,
    ) -> (Vec<SubscriptionId>, Result<()>) {
        let targets: Vec<(SubscriptionId, Rc<RefCell<Hook>>)> = self
            .slots
            .borrow()
            .iter()
            .filter(|slot| slot.enabled && slot.kinds.contains_kind(kind))
            .filter(|slot| only.map_or(true, |ids| ids.contains(&slot.id)))
            .map(|slot| (slot.id, Rc::clone(&slot.hook)))
            .collect();

        let mut delivered = Vec::with_capacity(targets.len());
        if targets.is_empty() {
            return (delivered, Ok(()));
        }

        let backtrace: Vec<Location> = self.frames.borrow().iter().rev().cloned().collect();

        for (id, cell) in targets {
            // An earlier hook may have stopped this subscription
            if !self.is_enabled(id) {
                continue;
            }
            let Ok(mut hook) = cell.try_borrow_mut() else {
                tracing::trace!(subscription = %id, "hook busy, skipping nested {:?}", kind);
                continue;
            };

            let outcome = {
                let space = self.space.borrow();
                let event = CallEvent {
                    kind,
                    defined_class: Some(defined_class),
                    method_id: &site.method_id,
                    receiver: site.receiver,
                    path: &site.location.path,
                    lineno: site.location.lineno,
                    backtrace: &backtrace,
                    space: &space,
                };
                tracing::trace!(
                    subscription = %id,
                    method = %site.method_id,
                    "deliver {:?}",
                    kind
                );
                (*hook)(&event)
            };

            if let Err(err) = outcome {
                tracing::debug!(subscription = %id, "hook failed, disabling: {}", err);
                if let Some(slot) = self.slots.borrow_mut().iter_mut().find(|slot| slot.id == id) {
                    slot.enabled = false;
                }
                return (delivered, Err(err));
            }
            delivered.push(id);
        }

        (delivered, Ok(()))
    }
}

impl EventSource for Engine {
    fn subscribe(&self, kinds: EventSet, hook: Hook) -> std::result::Result<SubscriptionId, SourceError> {
        if self.torn_down.get() {
            return Err(SourceError::TornDown);
        }
        let id = SubscriptionId::new(self.next_id.get());
        self.next_id.set(id.raw() + 1);
        self.slots.borrow_mut().push(Slot {
            id,
            kinds,
            enabled: false,
            hook: Rc::new(RefCell::new(hook)),
        });
        tracing::debug!(subscription = %id, ?kinds, "subscribed");
        Ok(id)
    }

    fn enable(&self, id: SubscriptionId) -> std::result::Result<(), SourceError> {
        if self.torn_down.get() {
            return Err(SourceError::TornDown);
        }
        let enabled = self.enabled_count();
        let mut slots = self.slots.borrow_mut();
        let slot = slots
            .iter_mut()
            .find(|slot| slot.id == id)
            .ok_or(SourceError::UnknownSubscription(id))?;
        if slot.enabled {
            return Ok(());
        }
        if let Some(limit) = self.enabled_limit {
            if enabled >= limit {
                return Err(SourceError::LimitReached { limit });
            }
        }
        slot.enabled = true;
        tracing::debug!(subscription = %id, "enabled");
        Ok(())
    }

    fn disable(&self, id: SubscriptionId) -> std::result::Result<(), SourceError> {
        let mut slots = self.slots.borrow_mut();
        let slot = slots
            .iter_mut()
            .find(|slot| slot.id == id)
            .ok_or(SourceError::UnknownSubscription(id))?;
        if slot.enabled {
            slot.enabled = false;
            tracing::debug!(subscription = %id, "disabled");
        }
        Ok(())
    }

    fn is_enabled(&self, id: SubscriptionId) -> bool {
        self.slots
            .borrow()
            .iter()
            .any(|slot| slot.id == id && slot.enabled)
    }

    fn release(&self, id: SubscriptionId) {
        self.slots.borrow_mut().retain(|slot| slot.id != id);
        tracing::debug!(subscription = %id, "released");
    }

    fn session_type(&self) -> ModuleRef {
        self.session_type
    }

    fn invoke<R>(&self, site: CallSite, body: impl FnOnce() -> Result<R>) -> Result<R> {
        let defined_class = self.defined_class(&site);
        let return_kind = site.kind.matching_return().unwrap_or(EventKind::Return);

        self.frames.borrow_mut().push(site.caller.clone());
        let (entered, outcome) = self.deliver_to(site.kind, defined_class, &site, None);
        if let Err(err) = outcome {
            // Non-local exit: the body never runs, but hooks that saw the call see it return
            let (_, unwound) = self.deliver_to(return_kind, defined_class, &site, Some(&entered));
            if let Err(hook_err) = unwound {
                tracing::warn!("return hook failed while unwinding: {}", hook_err);
            }
            self.frames.borrow_mut().pop();
            return Err(err);
        }

        let result = body();
        let delivered = self.deliver(return_kind, defined_class, &site);
        self.frames.borrow_mut().pop();

        match (result, delivered) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), delivered) => {
                if let Err(hook_err) = delivered {
                    tracing::warn!("return hook failed while unwinding: {}", hook_err);
                }
                Err(err)
            }
        }
    }
}
