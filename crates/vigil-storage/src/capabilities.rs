//! Backend capability declarations.
//!
//! Every backend starts from the conservative [`base_capabilities`] and
//! [`base_storage_capabilities`] maps and declares what it adds through
//! [`merge`]. Callers check a map with [`require`] or [`require_query`]
//! before issuing a request the backend may not support.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};
use crate::filter::FilterExpr;

/// A tree of named flags: `{"alarms": {"query": {"complex": true}}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CapabilityMap {
    Flag(bool),
    Nested(BTreeMap<String, CapabilityMap>),
}

impl CapabilityMap {
    /// Builds a nested map from `(key, value)` pairs.
    pub fn nested<K: Into<String>>(entries: impl IntoIterator<Item = (K, CapabilityMap)>) -> Self {
        CapabilityMap::Nested(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Value at a dotted path such as `"alarms.history.query.complex"`.
    pub fn lookup(&self, path: &str) -> Option<&CapabilityMap> {
        path.split('.').try_fold(self, |node, key| match node {
            CapabilityMap::Nested(children) => children.get(key),
            CapabilityMap::Flag(_) => None,
        })
    }

    /// Whether the flag at `path` is present and true.
    pub fn enabled(&self, path: &str) -> bool {
        matches!(self.lookup(path), Some(CapabilityMap::Flag(true)))
    }
}

/// Deep-merges `overrides` onto `base`, returning a new map.
///
/// Where both sides hold a nested map the merge recurses; anywhere else the
/// override replaces the base value. Keys only present in `base` are kept.
pub fn merge(base: &CapabilityMap, overrides: &CapabilityMap) -> CapabilityMap {
    match (base, overrides) {
        (CapabilityMap::Nested(base), CapabilityMap::Nested(overrides)) => {
            let mut merged = base.clone();
            for (key, value) in overrides {
                let next = match merged.get(key) {
                    Some(existing) => merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            CapabilityMap::Nested(merged)
        }
        (_, overrides) => overrides.clone(),
    }
}

fn query_tiers(simple: bool, complex: bool) -> CapabilityMap {
    CapabilityMap::nested([
        ("simple", CapabilityMap::Flag(simple)),
        ("complex", CapabilityMap::Flag(complex)),
    ])
}

/// Query features every backend supports: simple filters only.
pub fn base_capabilities() -> CapabilityMap {
    CapabilityMap::nested([(
        "alarms",
        CapabilityMap::nested([
            ("query", query_tiers(true, false)),
            ("history", CapabilityMap::nested([("query", query_tiers(true, false))])),
        ]),
    )])
}

pub fn base_storage_capabilities() -> CapabilityMap {
    CapabilityMap::nested([(
        "storage",
        CapabilityMap::nested([("production_ready", CapabilityMap::Flag(false))]),
    )])
}

/// Override declaring complex filter trees for alarms and history.
pub fn complex_query_override() -> CapabilityMap {
    let complex = || CapabilityMap::nested([("complex", CapabilityMap::Flag(true))]);
    CapabilityMap::nested([(
        "alarms",
        CapabilityMap::nested([
            ("query", complex()),
            ("history", CapabilityMap::nested([("query", complex())])),
        ]),
    )])
}

/// Fails with [`StorageError::UnsupportedCapability`] unless `path` is enabled.
pub fn require(capabilities: &CapabilityMap, path: &str) -> Result<()> {
    if capabilities.enabled(path) {
        Ok(())
    } else {
        Err(StorageError::UnsupportedCapability(path.to_string()))
    }
}

/// Checks that a filter can be issued against the query tier at `scope`
/// (`"alarms"` or `"alarms.history"`).
pub fn require_query(capabilities: &CapabilityMap, scope: &str, filter: Option<&FilterExpr>) -> Result<()> {
    let tier = match filter {
        Some(expr) if expr.is_complex() => "complex",
        _ => "simple",
    };
    require(capabilities, &format!("{scope}.query.{tier}"))
}
