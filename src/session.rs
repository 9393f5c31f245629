//! Tracing session: one subscription, one handler, one call stack
//!
//! A [`Session`] owns exactly one subscription on an [`EventSource`] for its
//! whole lifetime. Call-entered events go to the user handler, which decides
//! what to push; call-returned events pop one frame from the caller-owned
//! stack. Events raised by the session's own machinery (its `start`/`stop`
//! calls are traceable too) are discarded before either happens.
//!
//! Teardown runs on [`Session::close`] or on drop, whichever comes first, and
//! always leaves the subscription disabled and released.

use crate::call_stack::FrameStack;
use crate::error::{Result, SessionStartError, TraceError};
use crate::event::{CallEvent, EventKind, EventSet};
use crate::host::ModuleRef;
use crate::source::{hook, CallSite, EventSource, SubscriptionId};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Subscription settings for a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Call/return kinds to listen to
    pub kinds: EventSet,
    /// Events whose method is defined under one of these paths are discarded
    pub excluded_path_prefixes: Vec<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            kinds: EventSet::SESSION_DEFAULT,
            excluded_path_prefixes: Vec::new(),
        }
    }
}

impl SessionOptions {
    pub fn with_kinds(mut self, kinds: EventSet) -> Self {
        self.kinds = kinds;
        self
    }

    pub fn exclude_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.excluded_path_prefixes.push(prefix.into());
        self
    }

    /// Check that the kinds keep the stack balanced
    ///
    /// Only call/return kinds are allowed, and every call kind must come
    /// with its return kind (and vice versa).
    pub fn validate(&self) -> Result<()> {
        if self.kinds.is_empty() {
            return Err(TraceError::InvalidEventSet("no event kinds selected".to_string()));
        }

        let unsupported = self.kinds - (EventSet::CALL_EVENTS | EventSet::RETURN_EVENTS);
        if !unsupported.is_empty() {
            let names: Vec<_> = unsupported.kinds().map(EventKind::name).collect();
            return Err(TraceError::InvalidEventSet(format!(
                "only call and return kinds can be traced, got {}",
                names.join(",")
            )));
        }

        for call in self.kinds.kinds().filter(|kind| kind.is_call()) {
            if let Some(ret) = call.matching_return() {
                if !self.kinds.contains_kind(ret) {
                    return Err(TraceError::InvalidEventSet(format!(
                        "{} requires {}",
                        call.name(),
                        ret.name()
                    )));
                }
            }
        }
        for ret in self.kinds.kinds().filter(|kind| kind.is_return()) {
            let paired = EventKind::ALL
                .into_iter()
                .any(|call| call.matching_return() == Some(ret) && self.kinds.contains_kind(call));
            if !paired {
                return Err(TraceError::InvalidEventSet(format!(
                    "{} has no matching call kind",
                    ret.name()
                )));
            }
        }

        if self.excluded_path_prefixes.iter().any(String::is_empty) {
            return Err(TraceError::InvalidEventSet(
                "empty path prefix would exclude every event".to_string(),
            ));
        }

        Ok(())
    }
}

/// A tracing session bound to one event source subscription
pub struct Session<'s, S: EventSource, K: FrameStack + 'static> {
    source: &'s S,
    subscription: SubscriptionId,
    stack: Rc<RefCell<K>>,
    session_type: ModuleRef,
    /// Stack depth at the first successful start
    baseline: Cell<Option<usize>>,
    released: Cell<bool>,
}

impl<'s, S: EventSource, K: FrameStack + 'static> Session<'s, S, K> {
    /// Subscribe to method call/return events; the session starts disabled
    ///
    /// `stack` stays owned by the caller. While an event is being dispatched
    /// the session holds a mutable borrow of it, so the caller must not keep
    /// a borrow alive across traced code.
    pub fn new<F>(source: &'s S, stack: Rc<RefCell<K>>, handler: F) -> Result<Self>
    where
        F: FnMut(&CallEvent<'_>, &mut K) -> Result<()> + 'static,
    {
        Self::with_options(source, stack, SessionOptions::default(), handler)
    }

    pub fn with_options<F>(
        source: &'s S,
        stack: Rc<RefCell<K>>,
        options: SessionOptions,
        mut handler: F,
    ) -> Result<Self>
    where
        F: FnMut(&CallEvent<'_>, &mut K) -> Result<()> + 'static,
    {
        options.validate()?;

        let session_type = source.session_type();
        let hook_stack = Rc::clone(&stack);
        let SessionOptions {
            kinds,
            excluded_path_prefixes,
        } = options;

        let subscription = source
            .subscribe(
                kinds,
                hook(move |event| {
                    dispatch(
                        event,
                        session_type,
                        &excluded_path_prefixes,
                        &hook_stack,
                        &mut handler,
                    )
                }),
            )
            .map_err(TraceError::Subscribe)?;

        tracing::debug!(subscription = %subscription, ?kinds, "session created");

        Ok(Self {
            source,
            subscription,
            stack,
            session_type,
            baseline: Cell::new(None),
            released: Cell::new(false),
        })
    }

    /// Enable event delivery
    ///
    /// Starting an already started session just re-enables the same
    /// subscription. On failure the session stays disabled and the stack is
    /// untouched.
    pub fn start(&self) -> Result<()> {
        let id = self.subscription;
        let source = self.source;

        let enabled = source.invoke(self.own_call("start"), || Ok(source.enable(id)))?;
        if let Err(err) = enabled {
            tracing::warn!(subscription = %id, "event source refused to enable: {}", err);
            return Err(SessionStartError { source: err }.into());
        }

        if self.baseline.get().is_none() {
            self.baseline.set(Some(self.stack.borrow().depth()));
        }
        tracing::debug!(subscription = %id, "session started");
        Ok(())
    }

    /// Disable event delivery; a no-op when already disabled
    pub fn stop(&self) -> Result<()> {
        let id = self.subscription;
        let source = self.source;

        let outcome = source.invoke(self.own_call("stop"), || {
            if let Err(err) = source.disable(id) {
                tracing::warn!(subscription = %id, "failed to disable: {}", err);
            }
            Ok(())
        });

        // The stop call itself may have been aborted by another hook
        if source.is_enabled(id) {
            if let Err(err) = source.disable(id) {
                tracing::warn!(subscription = %id, "failed to disable: {}", err);
            }
        }

        self.report_overhang();
        tracing::debug!(subscription = %id, "session stopped");
        outcome
    }

    pub fn is_enabled(&self) -> bool {
        !self.released.get() && self.source.is_enabled(self.subscription)
    }

    pub fn subscription(&self) -> SubscriptionId {
        self.subscription
    }

    /// Current depth of the caller-owned stack
    pub fn depth(&self) -> usize {
        self.stack.borrow().depth()
    }

    /// Frames above the depth recorded at the first start
    ///
    /// Non-zero after a stop that happened before every traced call
    /// returned, or after a non-local exit skipped return events.
    pub fn overhang(&self) -> usize {
        match (self.baseline.get(), self.stack.try_borrow()) {
            (Some(baseline), Ok(stack)) => stack.depth().saturating_sub(baseline),
            _ => 0,
        }
    }

    /// Disable and release the subscription now
    pub fn close(self) {
        self.teardown();
    }

    fn own_call(&self, method: &str) -> CallSite {
        CallSite::new(self.session_type, method)
            .native()
            .defined_in(self.session_type)
    }

    fn report_overhang(&self) {
        let overhang = self.overhang();
        if overhang > 0 {
            tracing::warn!(
                subscription = %self.subscription,
                overhang,
                "call stack is deeper than when tracing started; return events were missed"
            );
        }
    }

    fn teardown(&self) {
        if self.released.replace(true) {
            return;
        }

        let id = self.subscription;
        if self.source.is_enabled(id) {
            if let Err(err) = self.source.disable(id) {
                tracing::warn!(subscription = %id, "failed to disable on teardown: {}", err);
            }
            tracing::debug!(subscription = %id, "disabled abandoned session");
        }
        self.report_overhang();
        self.source.release(id);
        tracing::debug!(subscription = %id, "session released");
    }
}

impl<S: EventSource, K: FrameStack + 'static> Drop for Session<'_, S, K> {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn dispatch<K, F>(
    event: &CallEvent<'_>,
    session_type: ModuleRef,
    excluded_path_prefixes: &[String],
    stack: &RefCell<K>,
    handler: &mut F,
) -> Result<()>
where
    K: FrameStack,
    F: FnMut(&CallEvent<'_>, &mut K) -> Result<()>,
{
    // Raised by the session's own start/stop
    if event.defined_class == Some(session_type) {
        return Ok(());
    }
    if excluded_path_prefixes
        .iter()
        .any(|prefix| event.path.starts_with(prefix.as_str()))
    {
        return Ok(());
    }

    if event.kind.is_call() {
        let mut stack = stack.borrow_mut();
        handler(event, &mut *stack)
    } else if event.kind.is_return() {
        stack.borrow_mut().pop_frame().map_err(|err| {
            tracing::error!(method = %event.method_id, path = %event.path, "{}", err);
            TraceError::from(err)
        })
    } else {
        tracing::error!(kind = ?event.kind, "event kind outside the subscription was delivered");
        Err(TraceError::UnexpectedEvent { kind: event.kind })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::error::{SourceError, UnbalancedStackError};
    use crate::event::Location;
    use crate::host::{ObjectSpace, Value};
    use crate::source::Hook;

    fn labeling_session<'s>(
        engine: &'s Engine,
        stack: &Rc<RefCell<Vec<String>>>,
    ) -> Session<'s, Engine, Vec<String>> {
        Session::new(engine, Rc::clone(stack), |event, stack: &mut Vec<String>| {
            stack.push(event.method_id.to_string());
            Ok(())
        })
        .unwrap()
    }

    #[test]
    fn test_new_session_is_disabled() {
        let engine = Engine::new();
        let stack = Rc::new(RefCell::new(Vec::new()));
        let session = labeling_session(&engine, &stack);
        assert!(!session.is_enabled());
        assert_eq!(engine.subscription_count(), 1);
        assert_eq!(engine.enabled_count(), 0);
    }

    #[test]
    fn test_start_and_stop_own_events_are_filtered() {
        let engine = Engine::new();
        let stack = Rc::new(RefCell::new(Vec::new()));
        let session = labeling_session(&engine, &stack);

        // The return of start and the call of stop reach the hook
        session.start().unwrap();
        assert!(session.is_enabled());
        session.stop().unwrap();

        assert!(!session.is_enabled());
        assert!(stack.borrow().is_empty());
    }

    #[test]
    fn test_events_defined_on_session_type_are_filtered() {
        let engine = Engine::new();
        let stack = Rc::new(RefCell::new(Vec::new()));
        let session = labeling_session(&engine, &stack);
        session.start().unwrap();

        let session_type = engine.session_type();
        engine
            .invoke(
                CallSite::new(session_type, "internal").defined_in(session_type),
                || Ok(()),
            )
            .unwrap();
        engine
            .raise_event(
                EventKind::Return,
                &CallSite::new(session_type, "internal").defined_in(session_type),
            )
            .unwrap();

        assert!(stack.borrow().is_empty());
        assert!(session.is_enabled());
    }

    #[test]
    fn test_call_pushes_through_handler_and_return_pops() {
        let engine = Engine::new();
        let stack = Rc::new(RefCell::new(Vec::new()));
        let session = labeling_session(&engine, &stack);
        session.start().unwrap();

        let object = engine.space().object_class();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let inside = Rc::clone(&seen);
        let watched = Rc::clone(&stack);
        engine
            .invoke(CallSite::new(object, "outer"), || {
                inside.borrow_mut().push(watched.borrow().clone());
                Ok(())
            })
            .unwrap();
        session.stop().unwrap();

        assert_eq!(*seen.borrow(), vec![vec!["outer".to_string()]]);
        assert!(stack.borrow().is_empty());
    }

    #[test]
    fn test_excluded_path_prefix_skips_call_and_return() {
        let engine = Engine::new();
        let stack = Rc::new(RefCell::new(Vec::new()));
        let options = SessionOptions::default().exclude_path_prefix("/gems/diverdown/");
        let session = Session::with_options(
            &engine,
            Rc::clone(&stack),
            options,
            |event, stack: &mut Vec<String>| {
                stack.push(event.method_id.to_string());
                Ok(())
            },
        )
        .unwrap();
        session.start().unwrap();

        let object = engine.space().object_class();
        let depth_inside = Rc::new(Cell::new(usize::MAX));
        let probe = Rc::clone(&depth_inside);
        let watched = Rc::clone(&stack);
        engine
            .invoke(
                CallSite::new(object, "helper").defined_at("/gems/diverdown/lib/helper.rb", 3),
                || {
                    probe.set(watched.borrow().len());
                    Ok(())
                },
            )
            .unwrap();

        assert_eq!(depth_inside.get(), 0);
        assert!(stack.borrow().is_empty());
    }

    #[test]
    fn test_start_failure_leaves_session_disabled() {
        let engine = Engine::with_limit(0);
        let stack = Rc::new(RefCell::new(vec!["kept".to_string()]));
        let session = labeling_session(&engine, &stack);

        let err = session.start().unwrap_err();
        assert!(matches!(
            err,
            TraceError::SessionStart(SessionStartError {
                source: SourceError::LimitReached { limit: 0 }
            })
        ));
        assert!(!session.is_enabled());
        assert_eq!(*stack.borrow(), vec!["kept".to_string()]);
    }

    #[test]
    fn test_handler_error_propagates_unchanged() {
        let engine = Engine::new();
        let stack: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let session = Session::new(&engine, Rc::clone(&stack), |_, _: &mut Vec<String>| {
            Err(anyhow::anyhow!("handler failed").into())
        })
        .unwrap();
        session.start().unwrap();

        let object = engine.space().object_class();
        let err = engine
            .invoke(CallSite::new(object, "run"), || Ok(()))
            .unwrap_err();

        assert_eq!(err.to_string(), "handler failed");
        assert!(!session.is_enabled());
        assert!(stack.borrow().is_empty());
    }

    #[test]
    fn test_return_on_empty_stack_is_fatal() {
        let engine = Engine::new();
        let stack = Rc::new(RefCell::new(Vec::new()));
        let session = labeling_session(&engine, &stack);
        session.start().unwrap();

        let object = engine.space().object_class();
        let err = engine
            .raise_event(EventKind::Return, &CallSite::new(object, "orphan"))
            .unwrap_err();

        assert!(matches!(err, TraceError::UnbalancedStack(UnbalancedStackError)));
        assert!(!session.is_enabled());
    }

    #[test]
    fn test_drop_disables_and_releases() {
        let engine = Engine::new();
        let stack = Rc::new(RefCell::new(Vec::new()));
        {
            let session = labeling_session(&engine, &stack);
            session.start().unwrap();
            assert_eq!(engine.enabled_count(), 1);
        }
        assert_eq!(engine.enabled_count(), 0);
        assert_eq!(engine.subscription_count(), 0);
    }

    #[test]
    fn test_close_is_explicit_teardown() {
        let engine = Engine::new();
        let stack = Rc::new(RefCell::new(Vec::new()));
        let session = labeling_session(&engine, &stack);
        session.start().unwrap();
        session.close();
        assert_eq!(engine.enabled_count(), 0);
        assert_eq!(engine.subscription_count(), 0);
    }

    #[test]
    fn test_overhang_after_stop_mid_call() {
        let engine = Engine::new();
        let stack = Rc::new(RefCell::new(Vec::new()));
        let session = labeling_session(&engine, &stack);
        session.start().unwrap();

        let object = engine.space().object_class();
        engine
            .invoke(CallSite::new(object, "a"), || session.stop())
            .unwrap();

        assert_eq!(session.overhang(), 1);
        assert_eq!(session.depth(), 1);
    }

    #[test]
    fn test_baseline_counts_preexisting_frames() {
        let engine = Engine::new();
        let stack = Rc::new(RefCell::new(vec!["caller".to_string()]));
        let session = labeling_session(&engine, &stack);
        session.start().unwrap();

        let object = engine.space().object_class();
        engine.invoke(CallSite::new(object, "a"), || Ok(())).unwrap();
        session.stop().unwrap();

        assert_eq!(session.overhang(), 0);
        assert_eq!(session.depth(), 1);
    }

    #[test]
    fn test_options_validation() {
        assert!(SessionOptions::default().validate().is_ok());
        assert!(SessionOptions::default()
            .with_kinds(EventSet::TRACER_DEFAULT)
            .validate()
            .is_ok());

        let invalid = [
            EventSet::empty(),
            EventSet::SESSION_DEFAULT | EventSet::LINE,
            EventSet::CALL,
            EventSet::RETURN,
            EventSet::CALL | EventSet::RETURN | EventSet::C_CALL,
        ];
        for kinds in invalid {
            let result = SessionOptions::default().with_kinds(kinds).validate();
            assert!(
                matches!(result, Err(TraceError::InvalidEventSet(_))),
                "{:?}",
                kinds
            );
        }

        let empty_prefix = SessionOptions::default().exclude_path_prefix("");
        assert!(empty_prefix.validate().is_err());
    }

    #[test]
    fn test_invalid_options_do_not_subscribe() {
        let engine = Engine::new();
        let stack = Rc::new(RefCell::new(Vec::<String>::new()));
        let result = Session::with_options(
            &engine,
            stack,
            SessionOptions::default().with_kinds(EventSet::LINE),
            |_, _: &mut Vec<String>| Ok(()),
        );
        assert!(result.is_err());
        assert_eq!(engine.subscription_count(), 0);
    }

    /// Event source that hands every event to the hook regardless of kind
    struct ManualSource {
        space: ObjectSpace,
        session_type: ModuleRef,
        hook: RefCell<Option<Hook>>,
        enabled: Cell<bool>,
    }

    impl ManualSource {
        fn new() -> Self {
            let mut space = ObjectSpace::new();
            let session_type = space.define_class("Session", None);
            Self {
                space,
                session_type,
                hook: RefCell::new(None),
                enabled: Cell::new(false),
            }
        }

        fn fire(&self, kind: EventKind) -> Result<()> {
            if !self.enabled.get() {
                return Ok(());
            }
            let backtrace = [Location::new("/app/main.rb", 1)];
            let event = CallEvent {
                kind,
                defined_class: Some(self.space.object_class()),
                method_id: "run",
                receiver: Value::Module(self.space.object_class()),
                path: "/app/main.rb",
                lineno: 1,
                backtrace: &backtrace,
                space: &self.space,
            };
            match self.hook.borrow_mut().as_mut() {
                Some(hook) => hook(&event),
                None => Ok(()),
            }
        }
    }

    impl EventSource for ManualSource {
        fn subscribe(
            &self,
            _kinds: EventSet,
            hook: Hook,
        ) -> std::result::Result<SubscriptionId, SourceError> {
            *self.hook.borrow_mut() = Some(hook);
            Ok(SubscriptionId::new(1))
        }

        fn enable(&self, _id: SubscriptionId) -> std::result::Result<(), SourceError> {
            self.enabled.set(true);
            Ok(())
        }

        fn disable(&self, _id: SubscriptionId) -> std::result::Result<(), SourceError> {
            self.enabled.set(false);
            Ok(())
        }

        fn is_enabled(&self, _id: SubscriptionId) -> bool {
            self.enabled.get()
        }

        fn release(&self, _id: SubscriptionId) {
            self.hook.borrow_mut().take();
        }

        fn session_type(&self) -> ModuleRef {
            self.session_type
        }

        fn invoke<R>(&self, _site: CallSite, body: impl FnOnce() -> Result<R>) -> Result<R> {
            body()
        }
    }

    #[test]
    fn test_unsubscribed_kind_is_reported_as_defect() {
        let source = ManualSource::new();
        let stack = Rc::new(RefCell::new(Vec::new()));
        let session = Session::new(&source, Rc::clone(&stack), |event, stack: &mut Vec<String>| {
            stack.push(event.method_id.to_string());
            Ok(())
        })
        .unwrap();
        session.start().unwrap();

        let err = source.fire(EventKind::Line).unwrap_err();
        assert!(matches!(
            err,
            TraceError::UnexpectedEvent {
                kind: EventKind::Line
            }
        ));
        assert!(stack.borrow().is_empty());
    }

    #[test]
    fn test_session_works_over_any_event_source() {
        let source = ManualSource::new();
        let stack = Rc::new(RefCell::new(Vec::new()));
        let session = Session::new(&source, Rc::clone(&stack), |event, stack: &mut Vec<String>| {
            stack.push(event.method_id.to_string());
            Ok(())
        })
        .unwrap();

        source.fire(EventKind::Call).unwrap();
        assert!(stack.borrow().is_empty());

        session.start().unwrap();
        source.fire(EventKind::CCall).unwrap();
        assert_eq!(*stack.borrow(), vec!["run".to_string()]);
        source.fire(EventKind::CReturn).unwrap();
        assert!(stack.borrow().is_empty());

        drop(session);
        assert!(source.hook.borrow().is_none());
        assert!(!source.enabled.get());
    }
}
