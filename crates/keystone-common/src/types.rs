//! Core types shared across Keystone components.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Named path fields, e.g. `serviceName -> "svc-A"`
pub type Fields = BTreeMap<String, String>;

/// Store-assigned lease identifier
pub type LeaseId = i64;

/// Build a [`Fields`] map from `(name, value)` pairs
pub fn fields<K, V, I>(pairs: I) -> Fields
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Attribute a listing is ordered by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortTarget {
    Key,
    Version,
    Create,
    /// Last modification revision
    #[default]
    Mod,
    Value,
}

/// Direction of a listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[serde(alias = "asc")]
    Ascend,
    /// Newest first
    #[default]
    #[serde(alias = "desc")]
    Descend,
}

impl std::str::FromStr for SortTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "key" => Ok(Self::Key),
            "version" => Ok(Self::Version),
            "create" => Ok(Self::Create),
            "mod" => Ok(Self::Mod),
            "value" => Ok(Self::Value),
            other => Err(format!("unknown sort target '{}'", other)),
        }
    }
}

impl std::str::FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" | "ascend" => Ok(Self::Ascend),
            "desc" | "descend" => Ok(Self::Descend),
            other => Err(format!("unknown sort order '{}'", other)),
        }
    }
}

/// A stored key with its revision metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision of the put that created the key
    pub create_revision: i64,
    /// Revision of the last put
    pub mod_revision: i64,
    /// Number of puts since creation
    pub version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease: Option<LeaseId>,
}

impl KeyValue {
    /// Compare two records by the given target
    pub fn cmp_by(&self, other: &Self, target: SortTarget) -> Ordering {
        match target {
            SortTarget::Key => self.key.cmp(&other.key),
            SortTarget::Version => self.version.cmp(&other.version),
            SortTarget::Create => self.create_revision.cmp(&other.create_revision),
            SortTarget::Mod => self.mod_revision.cmp(&other.mod_revision),
            SortTarget::Value => self.value.cmp(&other.value),
        }
        .then_with(|| self.key.cmp(&other.key))
    }
}

/// Order records in place and truncate to `limit`
pub fn sort_and_limit(
    kvs: &mut Vec<KeyValue>,
    target: SortTarget,
    order: SortOrder,
    limit: Option<usize>,
) {
    kvs.sort_by(|a, b| match order {
        SortOrder::Ascend => a.cmp_by(b, target),
        SortOrder::Descend => b.cmp_by(a, target),
    });
    if let Some(limit) = limit {
        kvs.truncate(limit);
    }
}

/// Kind of change observed on a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Put,
    Delete,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Put => "put",
            Self::Delete => "delete",
        }
    }
}

/// Self-announcement written under a lease
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration<T> {
    /// Announcing node
    pub node_id: String,

    /// Unix epoch seconds of the first announcement
    pub registered_at: i64,

    /// Caller payload
    pub data: T,
}

impl<T> Registration<T> {
    pub fn new(node_id: impl Into<String>, data: T) -> Self {
        Self {
            node_id: node_id.into(),
            registered_at: chrono::Utc::now().timestamp(),
            data,
        }
    }
}
