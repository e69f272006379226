// ── Namespace/name identity ──
//
// `NsName` is both the cache key and the unit of `Filter::nsname`.
// An empty component is a wildcard when used in a filter.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Returned when a `namespace/name` string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid namespace/name: {0:?}")]
pub struct InvalidNsName(pub String);

/// Identity of an object: `(namespace, name)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NsName {
    pub namespace: String,
    pub name: String,
}

impl NsName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// True when either component is empty, i.e. the id only matches
    /// on the components that are set.
    pub fn is_partial(&self) -> bool {
        self.namespace.is_empty() || self.name.is_empty()
    }
}

impl fmt::Display for NsName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for NsName {
    type Err = InvalidNsName;

    /// Accepts `ns/name`, `ns/`, `/name` and `/`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(namespace), Some(name), None) => Ok(Self::new(namespace, name)),
            _ => Err(InvalidNsName(s.to_owned())),
        }
    }
}
