//! Pairwise cross-context comparison of an aggregation table.

use std::collections::{BTreeSet, HashSet};

use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use tracing::debug;

use crate::{AggregationTable, DiffEntry, DiffReport, SourceValues};

pub const IMAGE_PATHS: [&str; 2] =
    ["Spec.Template.Spec.Containers[*].Image", "Spec.Template.Spec.InitContainers[*].Image"];
pub const ENV_PATHS: [&str; 1] = ["Spec.Template.Spec.Containers[*].Env"];

/// Selects the value transform applied before comparing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffMode {
    /// Arbitrary path, whole-value equality.
    Generic,
    /// Container image fields; optionally ignore the registry host.
    Images { strip_registry: bool },
    /// Container env lists compared as name -> value maps.
    Envs { ignore: BTreeSet<String> },
}

impl DiffMode {
    /// Fixed paths for the specialised modes. `None` for generic.
    pub fn fixed_paths(&self) -> Option<&'static [&'static str]> {
        match self {
            DiffMode::Generic => None,
            DiffMode::Images { .. } => Some(&IMAGE_PATHS[..]),
            DiffMode::Envs { .. } => Some(&ENV_PATHS[..]),
        }
    }

    pub fn transform(&self, value: &Value) -> Value {
        match self {
            DiffMode::Generic => value.clone(),
            DiffMode::Images { strip_registry: true } => match value {
                Value::String(image) => Value::String(strip_registry(image)),
                other => other.clone(),
            },
            DiffMode::Images { strip_registry: false } => value.clone(),
            DiffMode::Envs { ignore } => env_map(value, ignore),
        }
    }
}

/// Drop the first `/`-delimited segment of an image reference.
pub fn strip_registry(image: &str) -> String {
    match image.split_once('/') {
        Some((_, rest)) => rest.to_string(),
        None => image.to_string(),
    }
}

/// Turn a container env list into `{name: value}` without the ignored names.
///
/// `value` wins when set, otherwise the `valueFrom` source is compared as-is.
pub fn env_map(env: &Value, ignore: &BTreeSet<String>) -> Value {
    let items = match env {
        Value::Null => return Value::Object(Map::new()),
        Value::Array(items) => items,
        other => return other.clone(),
    };
    let mut out = Map::new();
    for item in items {
        let Some(name) = item.get("name").and_then(Value::as_str) else { continue };
        if ignore.contains(name) {
            continue;
        }
        let value = match (item.get("value"), item.get("valueFrom")) {
            (Some(v), _) if !v.is_null() => v.clone(),
            (_, Some(from)) if !from.is_null() => from.clone(),
            _ => Value::String(String::new()),
        };
        out.insert(name.to_string(), value);
    }
    Value::Object(out)
}

/// A structural difference between two values at `path`.
#[derive(Debug, Clone, PartialEq)]
pub struct Mismatch {
    pub path: String,
    pub a: Option<Value>,
    pub b: Option<Value>,
}

/// Deep structural diff. Objects compare key-wise (sorted), arrays index-wise.
pub fn diff_values(a: &Value, b: &Value) -> Vec<Mismatch> {
    let mut out = Vec::new();
    walk(&mut String::new(), Some(a), Some(b), &mut out);
    out
}

fn walk(path: &mut String, a: Option<&Value>, b: Option<&Value>, out: &mut Vec<Mismatch>) {
    match (a, b) {
        (Some(Value::Object(ao)), Some(Value::Object(bo))) => {
            let keys: BTreeSet<&String> = ao.keys().chain(bo.keys()).collect();
            for k in keys {
                let len = path.len();
                push_key(path, k);
                walk(path, ao.get(k), bo.get(k), out);
                path.truncate(len);
            }
        }
        (Some(Value::Array(aa)), Some(Value::Array(ba))) => {
            for i in 0..aa.len().max(ba.len()) {
                let len = path.len();
                path.push_str(&format!("[{}]", i));
                walk(path, aa.get(i), ba.get(i), out);
                path.truncate(len);
            }
        }
        (av, bv) => {
            if av != bv {
                let p = if path.is_empty() { ".".to_string() } else { path.clone() };
                out.push(Mismatch { path: p, a: av.cloned(), b: bv.cloned() });
            }
        }
    }
}

fn push_key(path: &mut String, key: &str) {
    let plain = !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if plain {
        path.push('.');
        path.push_str(key);
    } else {
        path.push_str(&format!("[{:?}]", key));
    }
}

/// Rule-driven comparator over a completed aggregation table.
#[derive(Debug, Clone)]
pub struct Comparator {
    mode: DiffMode,
    ignore_non_existent: bool,
}

impl Comparator {
    pub fn new(mode: DiffMode) -> Self {
        Self { mode, ignore_non_existent: false }
    }

    pub fn ignore_non_existent(mut self, on: bool) -> Self {
        self.ignore_non_existent = on;
        self
    }

    pub fn mode(&self) -> &DiffMode {
        &self.mode
    }

    /// Compare every pair `(i, j)`, `i < j`, of `source_order` for every resource.
    pub fn compare(&self, table: &AggregationTable, source_order: &[String]) -> DiffReport {
        let mut report = DiffReport::new();
        for (resource, sources) in table.iter() {
            let entries = self.compare_resource(sources, source_order);
            if !entries.is_empty() {
                debug!(resource, entries = entries.len(), "drift detected");
            }
            report.insert(resource, entries);
        }
        report
    }

    fn compare_resource(&self, sources: &SourceValues, order: &[String]) -> Vec<DiffEntry> {
        let transformed: FxHashMap<&str, Value> = order
            .iter()
            .filter_map(|id| {
                let values = sources.get(id)?;
                Some((id.as_str(), Value::Array(values.iter().map(|v| self.mode.transform(v)).collect())))
            })
            .collect();

        let mut entries = Vec::new();
        let mut reported_missing: HashSet<&str> = HashSet::new();
        for (i, a) in order.iter().enumerate() {
            for b in &order[i + 1..] {
                let (va, vb) = match (transformed.get(a.as_str()), transformed.get(b.as_str())) {
                    (Some(va), Some(vb)) => (va, vb),
                    (va, vb) => {
                        if !self.ignore_non_existent {
                            for (id, v) in [(a, va), (b, vb)] {
                                if v.is_none() && reported_missing.insert(id.as_str()) {
                                    entries.push(DiffEntry::Missing { source: id.clone() });
                                }
                            }
                        }
                        continue;
                    }
                };
                let (len_a, len_b) = (seq_len(va), seq_len(vb));
                if len_a != len_b {
                    entries.push(DiffEntry::CardinalityMismatch {
                        source_a: a.clone(),
                        len_a,
                        source_b: b.clone(),
                        len_b,
                    });
                    continue;
                }
                for m in diff_values(va, vb) {
                    entries.push(DiffEntry::ValueMismatch {
                        source_a: a.clone(),
                        source_b: b.clone(),
                        path: m.path,
                        value_a: m.a,
                        value_b: m.b,
                    });
                }
            }
        }
        entries
    }
}

fn seq_len(v: &Value) -> usize {
    v.as_array().map_or(0, Vec::len)
}
