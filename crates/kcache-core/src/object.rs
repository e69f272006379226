// ── Generic object model ──
//
// The core only interprets identity, labels and the resource version.
// Everything else rides along in `data` untouched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::nsname::NsName;

/// Identity and bookkeeping fields shared by every object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub name: String,

    /// Integer-comparable revision token assigned by the upstream.
    #[serde(default)]
    pub resource_version: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// An opaque upstream resource.
///
/// Uses `#[serde(flatten)]` so every field beyond `metadata` survives a
/// round trip without the core knowing its schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub metadata: ObjectMeta,

    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl Object {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        resource_version: impl Into<String>,
    ) -> Self {
        Self {
            metadata: ObjectMeta {
                namespace: namespace.into(),
                name: name.into(),
                resource_version: resource_version.into(),
                labels: BTreeMap::new(),
            },
            data: Map::new(),
        }
    }

    pub fn with_labels<K, V>(mut self, labels: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.metadata.labels = labels
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn resource_version(&self) -> &str {
        &self.metadata.resource_version
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.metadata.labels
    }

    pub fn key(&self) -> NsName {
        NsName::new(self.namespace(), self.name())
    }

    /// Parsed resource version. See [`parse_version`].
    pub fn version(&self) -> Result<u64, CoreError> {
        parse_version(self.resource_version())
    }

    /// Reject objects that cannot be keyed.
    pub(crate) fn check_identity(&self) -> Result<(), CoreError> {
        if self.name().is_empty() {
            return Err(CoreError::InvalidObject {
                reason: format!("missing name (namespace {:?})", self.namespace()),
            });
        }
        Ok(())
    }
}

/// A versioned snapshot of an upstream collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectList {
    #[serde(default)]
    pub resource_version: String,

    #[serde(default)]
    pub items: Vec<Object>,
}

impl ObjectList {
    pub fn new(resource_version: impl Into<String>, items: Vec<Object>) -> Self {
        Self {
            resource_version: resource_version.into(),
            items,
        }
    }
}

/// Interpret a resource version as a base-10 integer.
///
/// This relies on the upstream's monotonic counter convention. An
/// upstream with opaque version tokens needs a different total order
/// here, and nowhere else.
pub fn parse_version(version: &str) -> Result<u64, CoreError> {
    version
        .parse::<u64>()
        .map_err(|_| CoreError::InvalidVersion {
            version: version.to_owned(),
        })
}
