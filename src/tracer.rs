//! Dependency tracer built on [`Session`]
//!
//! Every call-entered event pushes exactly one frame on a [`CallStack`].
//! Calls into trace targets push a frame carrying a [`StackContext`], and a
//! target called while another target's context is on the stack records a
//! dependency from the caller's source to the callee's source.

use crate::call_stack::CallStack;
use crate::config::TracerConfig;
use crate::definition::{Definition, MethodContext};
use crate::error::{Result, TraceError};
use crate::event::{CallEvent, Location};
use crate::filter::EventFilter;
use crate::helper::{is_module_like, normalize_display_name, resolve_owning_type};
use crate::host::ObjectSpace;
use crate::ignored_method_ids::IgnoredMethodIds;
use crate::module_set::ModuleSet;
use crate::session::{Session, SessionOptions};
use crate::source::EventSource;
use fnv::FnvHashSet;
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

/// Rewrites a recorded `path:lineno` call site
pub type PathFilter = Rc<dyn Fn(&str) -> String>;

/// Context frame pushed for calls into trace targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackContext {
    pub source_name: String,
    pub method_id: String,
    /// Nearest caller location when the target was entered
    pub location: Location,
}

/// Records module dependencies while a session is enabled
pub struct Tracer {
    module_set: ModuleSet,
    ignored_method_ids: Option<IgnoredMethodIds>,
    caller_paths: Option<FnvHashSet<String>>,
    path_filter: Option<PathFilter>,
    options: SessionOptions,
}

impl Tracer {
    /// Build a tracer, resolving module names against `space`
    pub fn new(space: &ObjectSpace, config: &TracerConfig) -> Result<Self> {
        if let Some(paths) = &config.caller_paths {
            if let Some(relative) = paths.iter().find(|path| !Path::new(path).is_absolute()) {
                return Err(TraceError::InvalidArgument(format!(
                    "caller_paths must be absolute paths, got {}",
                    relative
                )));
            }
        }

        let kinds = match &config.trace {
            Some(expr) => EventFilter::from_expr(expr)
                .map_err(|err| TraceError::InvalidEventSet(err.to_string()))?
                .events(),
            None => EventFilter::all().events(),
        };
        let options = SessionOptions {
            kinds,
            excluded_path_prefixes: config.excluded_path_prefixes.clone(),
        };
        options.validate()?;

        let module_set = ModuleSet::resolve(space, config.modules.as_ref(), config.include.clone())?;
        let ignored_method_ids = if config.ignored_method_ids.is_empty() {
            None
        } else {
            Some(IgnoredMethodIds::new(
                space,
                config
                    .ignored_method_ids
                    .iter()
                    .map(|(pattern, mode)| (pattern.as_str(), *mode)),
            )?)
        };

        let path_filter = config.strip_path_prefix.clone().map(|prefix| {
            Rc::new(move |path: &str| path.strip_prefix(prefix.as_str()).unwrap_or(path).to_string())
                as PathFilter
        });

        tracing::debug!(
            ?kinds,
            modules = config.modules.as_ref().map_or(0, Vec::len),
            "tracer configured"
        );

        Ok(Self {
            module_set,
            ignored_method_ids,
            caller_paths: config
                .caller_paths
                .as_ref()
                .map(|paths| paths.iter().cloned().collect()),
            path_filter,
            options,
        })
    }

    /// Replace the path filter applied to recorded call sites
    pub fn with_path_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&str) -> String + 'static,
    {
        let filter: PathFilter = Rc::new(filter);
        self.path_filter = Some(filter);
        self
    }

    /// Create a disabled session recording into a fresh definition
    pub fn new_session<'s, S: EventSource>(
        &self,
        source: &'s S,
        title: &str,
        definition_group: Option<&str>,
    ) -> Result<TraceSession<'s, S>> {
        let definition = Rc::new(RefCell::new(Definition::new(
            title,
            definition_group.map(str::to_string),
        )));
        let mut recorder = Recorder {
            module_set: self.module_set.clone(),
            ignored_method_ids: self.ignored_method_ids.clone(),
            caller_paths: self.caller_paths.clone(),
            path_filter: self.path_filter.clone(),
            definition: Rc::clone(&definition),
        };

        let session = Session::with_options(
            source,
            Rc::new(RefCell::new(CallStack::new())),
            self.options.clone(),
            move |event, stack: &mut CallStack<StackContext>| {
                recorder.on_call(event, stack);
                Ok(())
            },
        )?;

        Ok(TraceSession {
            session,
            definition,
        })
    }

    /// Trace `body` and return the recorded definition
    ///
    /// The session is torn down even when `body` fails.
    pub fn trace<S, F>(
        &self,
        source: &S,
        title: &str,
        definition_group: Option<&str>,
        body: F,
    ) -> Result<Definition>
    where
        S: EventSource,
        F: FnOnce() -> Result<()>,
    {
        let session = self.new_session(source, title, definition_group)?;
        session.start()?;
        let outcome = body();
        let stopped = session.stop();
        if let Err(body_err) = outcome {
            if let Err(stop_err) = stopped {
                tracing::warn!("stop failed after the traced body failed: {}", stop_err);
            }
            return Err(body_err);
        }
        stopped?;
        Ok(session.into_definition())
    }
}

/// A session whose handler records dependencies
pub struct TraceSession<'s, S: EventSource> {
    session: Session<'s, S, CallStack<StackContext>>,
    definition: Rc<RefCell<Definition>>,
}

impl<'s, S: EventSource> TraceSession<'s, S> {
    pub fn start(&self) -> Result<()> {
        self.session.start()
    }

    pub fn stop(&self) -> Result<()> {
        self.session.stop()
    }

    pub fn is_enabled(&self) -> bool {
        self.session.is_enabled()
    }

    pub fn session(&self) -> &Session<'s, S, CallStack<StackContext>> {
        &self.session
    }

    /// Snapshot of what has been recorded so far
    pub fn definition(&self) -> Definition {
        self.definition.borrow().clone()
    }

    /// Release the session and take the definition
    pub fn into_definition(self) -> Definition {
        let TraceSession {
            session,
            definition,
        } = self;
        session.close();
        match Rc::try_unwrap(definition) {
            Ok(cell) => cell.into_inner(),
            Err(shared) => shared.borrow().clone(),
        }
    }
}

struct Recorder {
    module_set: ModuleSet,
    ignored_method_ids: Option<IgnoredMethodIds>,
    caller_paths: Option<FnvHashSet<String>>,
    path_filter: Option<PathFilter>,
    definition: Rc<RefCell<Definition>>,
}

impl Recorder {
    fn on_call(&mut self, event: &CallEvent<'_>, stack: &mut CallStack<StackContext>) {
        if stack.is_ignored() {
            stack.push(None);
            return;
        }

        let space = event.space;
        let module = resolve_owning_type(space, event.receiver);
        let class_receiver = is_module_like(space, event.receiver);

        if let Some(ignored) = &mut self.ignored_method_ids {
            if ignored.is_ignored(space, module, class_receiver, event.method_id) {
                tracing::trace!(method = %event.method_id, "entering ignored call");
                stack.push_ignored();
                return;
            }
        }

        let source_name = if self.module_set.contains(space, module) {
            normalize_display_name(space, module)
        } else {
            None
        };
        let Some(source_name) = source_name else {
            stack.push(None);
            return;
        };

        let location = self.nearest_caller_location(event, stack.stack_size());

        if let Some(caller) = stack.top_context() {
            let mut definition = self.definition.borrow_mut();
            let dependency = definition
                .find_or_build_source(&caller.source_name)
                .find_or_build_dependency(&source_name);
            if let Some(dependency) = dependency {
                let context = if class_receiver {
                    MethodContext::Class
                } else {
                    MethodContext::Instance
                };
                let call_site = location.as_ref().unwrap_or(&caller.location).to_string();
                let call_site = match &self.path_filter {
                    Some(filter) => filter(&call_site),
                    None => call_site,
                };
                tracing::trace!(
                    from = %caller.source_name,
                    to = %source_name,
                    method = %event.method_id,
                    "dependency recorded"
                );
                dependency
                    .find_or_build_method_id(event.method_id, context)
                    .add_path(call_site);
            }
        }

        match location {
            Some(location) => {
                self.definition
                    .borrow_mut()
                    .find_or_build_source(&source_name);
                stack.push(Some(StackContext {
                    source_name,
                    method_id: event.method_id.to_string(),
                    location,
                }));
            }
            None => stack.push(None),
        }
    }

    /// Innermost call site in `caller_paths`, or the method's own definition
    ///
    /// The search is bounded by the stack size: frames further out were
    /// entered before tracing started.
    fn nearest_caller_location(&self, event: &CallEvent<'_>, stack_size: usize) -> Option<Location> {
        let Some(paths) = &self.caller_paths else {
            return event.backtrace.first().cloned();
        };
        event
            .backtrace
            .iter()
            .take(stack_size + 1)
            .find(|location| paths.contains(&location.path))
            .cloned()
            .or_else(|| paths.contains(event.path).then(|| event.location()))
    }
}
