//! Recorded module dependencies
//!
//! A [`Definition`] is the result of one trace: every target module seen
//! (a [`Source`]), the modules it called into (a [`Dependency`]) and, per
//! dependency, the methods called with the call sites they were called from
//! (a [`MethodId`]). Collections are ordered maps so the serialized form is
//! stable and sorted.

use crate::error::{Result, TraceError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Types stored in a sorted map and serialized as a sequence
trait Keyed {
    type Key: Ord;

    fn key(&self) -> Self::Key;
}

mod keyed_seq {
    use super::Keyed;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S, V>(map: &BTreeMap<V::Key, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        V: Keyed + Serialize,
    {
        serializer.collect_seq(map.values())
    }

    pub fn deserialize<'de, D, V>(deserializer: D) -> Result<BTreeMap<V::Key, V>, D::Error>
    where
        D: Deserializer<'de>,
        V: Keyed + Deserialize<'de>,
    {
        let items = Vec::<V>::deserialize(deserializer)?;
        Ok(items.into_iter().map(|item| (item.key(), item)).collect())
    }
}

/// Whether a method was called on the module itself or on an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MethodContext {
    Class,
    Instance,
}

impl MethodContext {
    pub fn as_str(self) -> &'static str {
        match self {
            MethodContext::Class => "class",
            MethodContext::Instance => "instance",
        }
    }
}

impl fmt::Display for MethodContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodId {
    pub name: String,
    pub context: MethodContext,
    /// Call sites, as `path:lineno`
    #[serde(default)]
    pub paths: BTreeSet<String>,
}

impl MethodId {
    pub fn new(name: impl Into<String>, context: MethodContext) -> Self {
        Self {
            name: name.into(),
            context,
            paths: BTreeSet::new(),
        }
    }

    pub fn add_path(&mut self, path: impl Into<String>) {
        self.paths.insert(path.into());
    }

    /// `.name` for class methods, `#name` for instance methods
    pub fn human_method_name(&self) -> String {
        match self.context {
            MethodContext::Class => format!(".{}", self.name),
            MethodContext::Instance => format!("#{}", self.name),
        }
    }
}

impl Keyed for MethodId {
    type Key = (String, MethodContext);

    fn key(&self) -> Self::Key {
        (self.name.clone(), self.context)
    }
}

/// Calls from one source into another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub source_name: String,
    #[serde(with = "keyed_seq", default)]
    method_ids: BTreeMap<(String, MethodContext), MethodId>,
}

impl Dependency {
    pub fn new(source_name: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            method_ids: BTreeMap::new(),
        }
    }

    pub fn find_or_build_method_id(&mut self, name: &str, context: MethodContext) -> &mut MethodId {
        self.method_ids
            .entry((name.to_string(), context))
            .or_insert_with(|| MethodId::new(name, context))
    }

    pub fn method_id(&self, name: &str, context: MethodContext) -> Option<&MethodId> {
        self.method_ids.get(&(name.to_string(), context))
    }

    /// Methods sorted by name, then context
    pub fn method_ids(&self) -> impl Iterator<Item = &MethodId> {
        self.method_ids.values()
    }

    /// Merge dependencies on the same source, unioning method call sites
    pub fn combine(dependencies: impl IntoIterator<Item = Dependency>) -> Vec<Dependency> {
        let mut merged: BTreeMap<String, Dependency> = BTreeMap::new();
        for dependency in dependencies {
            let target = merged
                .entry(dependency.source_name.clone())
                .or_insert_with(|| Dependency::new(dependency.source_name.clone()));
            for method_id in dependency.method_ids.into_values() {
                target
                    .find_or_build_method_id(&method_id.name, method_id.context)
                    .paths
                    .extend(method_id.paths);
            }
        }
        merged.into_values().collect()
    }
}

impl Keyed for Dependency {
    type Key = String;

    fn key(&self) -> Self::Key {
        self.source_name.clone()
    }
}

/// A traced module and everything it called into
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub source_name: String,
    #[serde(with = "keyed_seq", default)]
    dependencies: BTreeMap<String, Dependency>,
}

impl Source {
    pub fn new(source_name: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            dependencies: BTreeMap::new(),
        }
    }

    /// `None` when `dependency_source_name` is this source: calls within a
    /// module are not dependencies
    pub fn find_or_build_dependency(&mut self, dependency_source_name: &str) -> Option<&mut Dependency> {
        if self.source_name == dependency_source_name {
            return None;
        }
        Some(
            self.dependencies
                .entry(dependency_source_name.to_string())
                .or_insert_with(|| Dependency::new(dependency_source_name)),
        )
    }

    pub fn dependency(&self, dependency_source_name: &str) -> Option<&Dependency> {
        self.dependencies.get(dependency_source_name)
    }

    /// Dependencies sorted by source name
    pub fn dependencies(&self) -> impl Iterator<Item = &Dependency> {
        self.dependencies.values()
    }

    /// Merge sources recorded under the same name
    pub fn combine(sources: impl IntoIterator<Item = Source>) -> Result<Source> {
        let sources: Vec<Source> = sources.into_iter().collect();
        let Some(first) = sources.first() else {
            return Err(TraceError::InvalidArgument("sources are empty".to_string()));
        };
        let source_name = first.source_name.clone();
        if let Some(other) = sources.iter().find(|source| source.source_name != source_name) {
            return Err(TraceError::InvalidArgument(format!(
                "sources are unmatched ({}, {})",
                source_name, other.source_name
            )));
        }

        let dependencies = Dependency::combine(
            sources
                .into_iter()
                .flat_map(|source| source.dependencies.into_values()),
        );
        Ok(Source {
            source_name,
            dependencies: dependencies
                .into_iter()
                .map(|dependency| (dependency.key(), dependency))
                .collect(),
        })
    }
}

impl Keyed for Source {
    type Key = String;

    fn key(&self) -> Self::Key {
        self.source_name.clone()
    }
}

/// Result of one trace
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    #[serde(default)]
    pub definition_group: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(with = "keyed_seq", default)]
    sources: BTreeMap<String, Source>,
}

impl Definition {
    pub fn new(title: impl Into<String>, definition_group: Option<String>) -> Self {
        Self {
            definition_group,
            title: title.into(),
            sources: BTreeMap::new(),
        }
    }

    pub fn find_or_build_source(&mut self, source_name: &str) -> &mut Source {
        self.sources
            .entry(source_name.to_string())
            .or_insert_with(|| Source::new(source_name))
    }

    pub fn source(&self, source_name: &str) -> Option<&Source> {
        self.sources.get(source_name)
    }

    /// Sources sorted by name
    pub fn sources(&self) -> impl Iterator<Item = &Source> {
        self.sources.values()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Merge several definitions into one, combining sources by name
    pub fn combine(
        definition_group: Option<String>,
        title: impl Into<String>,
        definitions: impl IntoIterator<Item = Definition>,
    ) -> Definition {
        let mut grouped: BTreeMap<String, Vec<Source>> = BTreeMap::new();
        for definition in definitions {
            for (name, source) in definition.sources {
                grouped.entry(name).or_default().push(source);
            }
        }

        let mut combined = Definition::new(title, definition_group);
        for (name, same_sources) in grouped {
            // Groups are never empty and share one name
            if let Ok(source) = Source::combine(same_sources) {
                combined.sources.insert(name, source);
            }
        }
        combined
    }
}
