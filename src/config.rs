//! Tracer configuration loaded from diverdown.toml
//!
//! # Example diverdown.toml
//!
//! ```toml
//! title = "checkout"
//! definition_group = "web"
//! trace = "trace=all"
//! modules = ["Checkout", "Cart"]
//! include = ["/app/models/order.rb"]
//! caller_paths = ["/app/models/order.rb", "/app/services/checkout.rb"]
//! excluded_path_prefixes = ["/gems/"]
//! strip_path_prefix = "/app/"
//!
//! [ignored_method_ids]
//! "Logger" = "all"
//! "Cart#inspect" = "single"
//! ```

use crate::ignored_method_ids::IgnoreMode;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Everything a [`Tracer`](crate::tracer::Tracer) needs besides the object space
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TracerConfig {
    /// Default title of recorded definitions
    pub title: Option<String>,
    pub definition_group: Option<String>,
    /// `trace=` expression selecting call/return kinds
    pub trace: Option<String>,
    /// Trace targets by constant name
    pub modules: Option<Vec<String>>,
    /// Trace targets by the file their constant was defined in
    pub include: Option<Vec<String>>,
    /// Absolute paths a caller location must be in; unset means any
    pub caller_paths: Option<Vec<String>>,
    pub excluded_path_prefixes: Vec<String>,
    /// Prefix removed from recorded call sites
    pub strip_path_prefix: Option<String>,
    pub ignored_method_ids: BTreeMap<String, IgnoreMode>,
}

impl TracerConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        Self::from_toml_str(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Load configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML")
    }

    /// Config tracing the given modules
    pub fn for_modules<I>(modules: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            modules: Some(modules.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }
}
