//! Declarative application definitions.
//!
//! A [`WebappDefinition`] is the parsed form of one JSON definition file, or
//! the aggregate of several. Definitions are immutable once built; merging
//! always produces a new value.
//!
//! ```json
//! {
//!   "controllers": { "/api/*": "Health", "/pages/*": "pages/$1.rhai" },
//!   "filters":     { "/admin/*": "RequireAdmin" },
//!   "statics":     { "/css/*": "assets/css" },
//!   "listeners":   ["AuditListener"],
//!   "identity_manager": "LocalUsers"
//! }
//! ```
use std::{collections::BTreeSet, fmt, path::Path};

use serde::{
    Deserialize, Deserializer,
    de::{MapAccess, Visitor},
};
use thiserror::Error;

use crate::core::path_bind::{InvalidPatternError, RouteRule};

/// Errors raised while turning a definition file into a [`WebappDefinition`].
///
/// Any of these rejects the whole file; nothing from it is applied.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DefinitionError {
    #[error("Failed to read definition file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed definition JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    InvalidPattern(#[from] InvalidPatternError),

    #[error("Invalid target for route '{route}': {message}")]
    InvalidTarget { route: String, message: String },
}

/// Insertion-ordered `route → target` map.
///
/// Re-inserting an existing key replaces its value but keeps its original
/// position, so first-match ordering is stable across merges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
    entries: Vec<(String, String)>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, route: impl Into<String>, target: impl Into<String>) {
        let route = route.into();
        let target = target.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == route) {
            Some(entry) => entry.1 = target,
            None => self.entries.push((route, target)),
        }
    }

    pub fn get(&self, route: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == route)
            .map(|(_, target)| target.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(r, t)| (r.as_str(), t.as_str()))
    }

    pub fn routes(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(r, _)| r.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn extend_from(&mut self, other: &RouteTable) {
        for (route, target) in other.iter() {
            self.insert(route, target);
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RouteTable {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut table = RouteTable::new();
        for (route, target) in iter {
            table.insert(route, target);
        }
        table
    }
}

impl<'de> Deserialize<'de> for RouteTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RouteTableVisitor;

        impl<'de> Visitor<'de> for RouteTableVisitor {
            type Value = RouteTable;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object mapping route patterns to target strings")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<RouteTable, A::Error> {
                let mut table = RouteTable::new();
                while let Some((route, target)) = map.next_entry::<String, String>()? {
                    table.insert(route, target);
                }
                Ok(table)
            }
        }

        deserializer.deserialize_map(RouteTableVisitor)
    }
}

/// One application's routing definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WebappDefinition {
    pub controllers: RouteTable,
    pub filters: RouteTable,
    pub statics: RouteTable,
    pub listeners: BTreeSet<String>,
    pub identity_manager: Option<String>,
}

impl WebappDefinition {
    /// Parse and validate a definition. Every pattern must compile and every
    /// target must be non-blank, otherwise the whole definition is rejected.
    /// A blank file is the empty definition.
    pub fn from_json(bytes: &[u8]) -> Result<Self, DefinitionError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        let definition: WebappDefinition = serde_json::from_slice(bytes)?;
        definition.validate()?;
        Ok(definition)
    }

    /// Read and parse a definition file.
    pub fn load(path: &Path) -> Result<Self, DefinitionError> {
        let bytes = std::fs::read(path).map_err(|source| DefinitionError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&bytes)
    }

    fn validate(&self) -> Result<(), DefinitionError> {
        for table in [&self.controllers, &self.filters, &self.statics] {
            for (route, target) in table.iter() {
                if target.trim().is_empty() {
                    return Err(DefinitionError::InvalidTarget {
                        route: route.to_string(),
                        message: "target must not be empty".to_string(),
                    });
                }
                RouteRule::compile(route, target)?;
            }
        }
        if let Some(identity) = &self.identity_manager {
            if identity.trim().is_empty() {
                return Err(DefinitionError::InvalidTarget {
                    route: "identity_manager".to_string(),
                    message: "identifier must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }

    /// True when the definition contributes nothing at all.
    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
            && self.filters.is_empty()
            && self.statics.is_empty()
            && self.listeners.is_empty()
            && self.identity_manager.is_none()
    }

    /// Fold `other` on top of `self`: later keys overwrite, listeners union,
    /// the identity manager is replaced only by a present value.
    pub fn merge(&mut self, other: &WebappDefinition) {
        self.controllers.extend_from(&other.controllers);
        self.filters.extend_from(&other.filters);
        self.statics.extend_from(&other.statics);
        self.listeners.extend(other.listeners.iter().cloned());
        if other.identity_manager.is_some() {
            self.identity_manager = other.identity_manager.clone();
        }
    }

    /// Merge `sources` in iteration order into a fresh definition.
    pub fn build<'a>(sources: impl IntoIterator<Item = &'a WebappDefinition>) -> Self {
        let mut aggregate = WebappDefinition::default();
        for source in sources {
            aggregate.merge(source);
        }
        aggregate
    }
}
