//! kubediff core types: resource kinds, extracted values, the aggregation table
//! and the diff report produced by the cross-context comparator.

#![forbid(unsafe_code)]

pub mod compare;
pub mod path;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use compare::{diff_values, env_map, strip_registry, Comparator, DiffMode, Mismatch};
pub use path::{
    check, matching_key, resolve, Field, Path, PathError, Record, ResolveError, Segment, Shape, METADATA_KEY,
    OBJECT_META, TYPE_META,
};

/// Workload kinds a source can list.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Deployment,
    DaemonSet,
    StatefulSet,
    ConfigMap,
}

impl ResourceKind {
    /// Kinds scanned by the `images` and `envs` modes.
    pub const WORKLOADS: [ResourceKind; 3] =
        [ResourceKind::Deployment, ResourceKind::StatefulSet, ResourceKind::DaemonSet];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Deployment => "deployment",
            ResourceKind::DaemonSet => "daemonset",
            ResourceKind::StatefulSet => "statefulset",
            ResourceKind::ConfigMap => "configmap",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deployment" | "deploy" => Ok(ResourceKind::Deployment),
            "daemonset" | "ds" => Ok(ResourceKind::DaemonSet),
            "statefulset" | "sts" => Ok(ResourceKind::StatefulSet),
            "configmap" | "cm" => Ok(ResourceKind::ConfigMap),
            _ => Err(ConfigError::UnsupportedKind(s.to_string())),
        }
    }
}

/// Setup problems detected before any source is queried.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("at least two contexts are required (got {0})")]
    TooFewSources(usize),
    #[error("context {0} is configured more than once")]
    DuplicateSource(String),
    #[error("resource {0} not supported")]
    UnsupportedKind(String),
    #[error("no resource kinds to scan")]
    NoResources,
    #[error(transparent)]
    MalformedPath(#[from] PathError),
    #[error("path {path} does not exist on {kind}: {cause}")]
    UnknownField { kind: ResourceKind, path: String, cause: ResolveError },
}

/// Result of resolving a path against one record.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractedValue {
    /// Path without wildcard segments.
    Single(Value),
    /// Flattened leaves in collection order.
    Sequence(Vec<Value>),
}

impl ExtractedValue {
    pub fn len(&self) -> usize {
        match self {
            ExtractedValue::Single(_) => 1,
            ExtractedValue::Sequence(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_values(self) -> Vec<Value> {
        match self {
            ExtractedValue::Single(v) => vec![v],
            ExtractedValue::Sequence(v) => v,
        }
    }
}

/// Values extracted for one resource, keyed by source id.
pub type SourceValues = FxHashMap<String, Vec<Value>>;

/// resource name -> source id -> extracted values, in fetch order.
#[derive(Debug, Clone, Default)]
pub struct AggregationTable {
    entries: BTreeMap<String, SourceValues>,
}

impl AggregationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `source` returned `resource`, even if it yields no values.
    pub fn touch(&mut self, resource: &str, source: &str) {
        self.slot(resource, source);
    }

    pub fn append(&mut self, resource: &str, source: &str, value: Value) {
        self.slot(resource, source).push(value);
    }

    fn slot(&mut self, resource: &str, source: &str) -> &mut Vec<Value> {
        self.entries
            .entry(resource.to_string())
            .or_default()
            .entry(source.to_string())
            .or_default()
    }

    pub fn get(&self, resource: &str, source: &str) -> Option<&[Value]> {
        self.entries.get(resource)?.get(source).map(Vec::as_slice)
    }

    /// Resource names in lexicographic order.
    pub fn resources(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SourceValues)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One discrepancy for a resource across a pair of sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiffEntry {
    Missing {
        source: String,
    },
    CardinalityMismatch {
        source_a: String,
        len_a: usize,
        source_b: String,
        len_b: usize,
    },
    ValueMismatch {
        source_a: String,
        source_b: String,
        path: String,
        value_a: Option<Value>,
        value_b: Option<Value>,
    },
}

impl fmt::Display for DiffEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn show(v: &Option<Value>) -> String {
            match v {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => "<missing>".to_string(),
            }
        }
        match self {
            DiffEntry::Missing { source } => write!(f, "Not found in {}", source),
            DiffEntry::CardinalityMismatch { source_a, len_a, source_b, len_b } => write!(
                f,
                "Different number of elements in {} ({}) and {} ({})",
                source_a, len_a, source_b, len_b
            ),
            DiffEntry::ValueMismatch { path, value_a, value_b, .. } => {
                write!(f, "{}: {} != {}", path, show(value_a), show(value_b))
            }
        }
    }
}

/// resource name -> ordered diff entries. Empty means no drift.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiffReport {
    entries: BTreeMap<String, Vec<DiffEntry>>,
}

impl DiffReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, resource: &str, entries: Vec<DiffEntry>) {
        if !entries.is_empty() {
            self.entries.insert(resource.to_string(), entries);
        }
    }

    pub fn get(&self, resource: &str) -> Option<&[DiffEntry]> {
        self.entries.get(resource).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[DiffEntry])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn resources(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub mod prelude {
    pub use super::{
        AggregationTable, Comparator, ConfigError, DiffEntry, DiffMode, DiffReport, ExtractedValue, Path,
        ResourceKind,
    };
}
