//! Trace target membership
//!
//! A module is a target when it is listed explicitly or when its constant
//! was defined in one of the included source files. Classes also inherit
//! membership from their superclasses. Answers are cached per module because
//! the lookup runs on every call-entered event.

use crate::error::Result;
use crate::helper::{constantize, is_class_like};
use crate::host::{ModuleRef, ObjectSpace, Value};
use fnv::{FnvHashMap, FnvHashSet};

#[derive(Debug, Clone, Default)]
pub struct ModuleSet {
    modules: Option<FnvHashSet<ModuleRef>>,
    include: Option<FnvHashSet<String>>,
    cache: FnvHashMap<ModuleRef, bool>,
}

impl ModuleSet {
    /// A set with no targets
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve module names and source paths against `space`
    pub fn resolve<N, P>(space: &ObjectSpace, modules: Option<N>, include: Option<P>) -> Result<Self>
    where
        N: IntoIterator,
        N::Item: AsRef<str>,
        P: IntoIterator,
        P::Item: Into<String>,
    {
        let mut set = Self::new();
        if let Some(names) = modules {
            let resolved = names
                .into_iter()
                .map(|name| constantize(space, name.as_ref()))
                .collect::<Result<Vec<_>>>()?;
            set = set.with_modules(resolved);
        }
        if let Some(paths) = include {
            set = set.with_include(paths);
        }
        Ok(set)
    }

    pub fn with_modules(mut self, modules: impl IntoIterator<Item = ModuleRef>) -> Self {
        self.modules
            .get_or_insert_with(FnvHashSet::default)
            .extend(modules);
        self.cache.clear();
        self
    }

    /// Treat every module whose constant was defined in one of `paths` as a target
    pub fn with_include<I>(mut self, paths: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.include
            .get_or_insert_with(FnvHashSet::default)
            .extend(paths.into_iter().map(Into::into));
        self.cache.clear();
        self
    }

    /// True if calls into `module` should be recorded
    pub fn contains(&mut self, space: &ObjectSpace, module: ModuleRef) -> bool {
        if let Some(&cached) = self.cache.get(&module) {
            return cached;
        }

        if is_class_like(space, Value::Module(module)) {
            self.dig_superclass(space, module)
        } else {
            let included = self.direct(space, module);
            self.cache.insert(module, included);
            included
        }
    }

    /// Walk up the superclass chain, caching every class visited
    fn dig_superclass(&mut self, space: &ObjectSpace, module: ModuleRef) -> bool {
        let mut visited = Vec::new();
        let mut current = Some(module);
        let mut included = false;

        while let Some(class) = current {
            if let Some(&cached) = self.cache.get(&class) {
                included = cached;
                break;
            }
            visited.push(class);
            if self.direct(space, class) {
                included = true;
                break;
            }
            current = space.superclass(class);
        }

        for class in visited {
            self.cache.entry(class).or_insert(included);
        }
        included
    }

    fn direct(&self, space: &ObjectSpace, module: ModuleRef) -> bool {
        let listed = self
            .modules
            .as_ref()
            .is_some_and(|modules| modules.contains(&module));
        listed
            || match (&self.include, space.source_path(module)) {
                (Some(include), Some(path)) => include.contains(path),
                _ => false,
            }
    }
}
