//! Methods whose whole call subtree is left out of the trace
//!
//! Patterns name a module (`"A"`), a class method (`"A.m"`) or an instance
//! method (`"A#m"`). For classes, a pattern on a superclass also covers its
//! subclasses; plain modules are matched only by themselves.

use crate::error::{Result, TraceError};
use crate::helper::{constantize, is_class_like};
use crate::host::{ModuleRef, ObjectSpace, Value};
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};

/// How much of a matching call is ignored
///
/// Both modes currently ignore the complete subtree below the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IgnoreMode {
    Single,
    All,
}

/// `None` values cache a negative answer
type MethodTable = FnvHashMap<ModuleRef, FnvHashMap<String, Option<IgnoreMode>>>;

#[derive(Debug, Clone, Default)]
pub struct IgnoredMethodIds {
    modules: FnvHashMap<ModuleRef, Option<IgnoreMode>>,
    class_methods: MethodTable,
    instance_methods: MethodTable,
}

impl IgnoredMethodIds {
    /// Resolve patterns against `space`
    pub fn new<I, P>(space: &ObjectSpace, patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = (P, IgnoreMode)>,
        P: AsRef<str>,
    {
        let mut ids = Self::default();

        for (pattern, mode) in patterns {
            let pattern = pattern.as_ref();
            if let Some((module, method)) = pattern.split_once('.') {
                let module = constantize(space, module)?;
                ids.class_methods
                    .entry(module)
                    .or_default()
                    .insert(method_name(pattern, method)?, Some(mode));
            } else if let Some((module, method)) = pattern.split_once('#') {
                let module = constantize(space, module)?;
                ids.instance_methods
                    .entry(module)
                    .or_default()
                    .insert(method_name(pattern, method)?, Some(mode));
            } else {
                let module = constantize(space, pattern)?;
                ids.modules.insert(module, Some(mode));
            }
        }

        Ok(ids)
    }

    /// Mode for a call of `method_id` on `module`
    ///
    /// `class_receiver` is true when the method was called on the module
    /// itself rather than on an instance.
    pub fn ignored(
        &mut self,
        space: &ObjectSpace,
        module: ModuleRef,
        class_receiver: bool,
        method_id: &str,
    ) -> Option<IgnoreMode> {
        if let Some(mode) = self.ignored_module(space, module) {
            return Some(mode);
        }
        let table = if class_receiver {
            &mut self.class_methods
        } else {
            &mut self.instance_methods
        };
        ignored_method(table, space, module, method_id)
    }

    pub fn is_ignored(
        &mut self,
        space: &ObjectSpace,
        module: ModuleRef,
        class_receiver: bool,
        method_id: &str,
    ) -> bool {
        self.ignored(space, module, class_receiver, method_id).is_some()
    }

    fn ignored_module(&mut self, space: &ObjectSpace, module: ModuleRef) -> Option<IgnoreMode> {
        if let Some(&cached) = self.modules.get(&module) {
            return cached;
        }
        if !is_class_like(space, Value::Module(module)) {
            self.modules.insert(module, None);
            return None;
        }

        let mut visited = Vec::new();
        let mut current = Some(module);
        let mut found = None;
        while let Some(class) = current {
            if let Some(&cached) = self.modules.get(&class) {
                found = cached;
                break;
            }
            visited.push(class);
            current = space.superclass(class);
        }
        for class in visited {
            self.modules.insert(class, found);
        }
        found
    }
}

fn method_name(pattern: &str, method: &str) -> Result<String> {
    if method.is_empty() {
        return Err(TraceError::InvalidArgument(format!(
            "ignored method id {} has no method name",
            pattern
        )));
    }
    Ok(method.to_string())
}

fn ignored_method(
    table: &mut MethodTable,
    space: &ObjectSpace,
    module: ModuleRef,
    method_id: &str,
) -> Option<IgnoreMode> {
    if let Some(&cached) = table.get(&module).and_then(|methods| methods.get(method_id)) {
        return cached;
    }
    if !is_class_like(space, Value::Module(module)) {
        table
            .entry(module)
            .or_default()
            .insert(method_id.to_string(), None);
        return None;
    }

    let mut visited = Vec::new();
    let mut current = Some(module);
    let mut found = None;
    while let Some(class) = current {
        if let Some(&cached) = table.get(&class).and_then(|methods| methods.get(method_id)) {
            found = cached;
            break;
        }
        visited.push(class);
        current = space.superclass(class);
    }
    for class in visited {
        table
            .entry(class)
            .or_default()
            .insert(method_id.to_string(), found);
    }
    found
}
