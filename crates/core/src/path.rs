//! Dot-path grammar and resolution against structured records.
//!
//! A path such as `Spec.Template.Spec.Containers[*].Image` is parsed once and
//! then resolved against every fetched object. Segments suffixed with `[*]`
//! fan out over a list field and resolve the remaining suffix against each
//! element, flattening the results in collection order.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;
use smallvec::SmallVec;

use crate::ExtractedValue;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path is empty")]
    Empty,
    #[error("path '{0}' contains an empty segment")]
    EmptySegment(String),
    #[error("invalid path segment '{0}' (expect name or name[*])")]
    InvalidSegment(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("field '{0}' not found")]
    FieldNotFound(String),
    #[error("field '{0}' is not a list")]
    NotACollection(String),
    #[error("path is empty")]
    EmptyPath,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Plain named field.
    Field(String),
    /// `name[*]`: iterate every element of a list field.
    Each(String),
}

impl Segment {
    pub fn name(&self) -> &str {
        match self {
            Segment::Field(n) | Segment::Each(n) => n,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Segment::Each(_))
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Field(n) => f.write_str(n),
            Segment::Each(n) => write!(f, "{}[*]", n),
        }
    }
}

/// Parsed, immutable attribute path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    segments: SmallVec<[Segment; 8]>,
}

impl Path {
    pub fn parse(s: &str) -> Result<Self, PathError> {
        s.parse()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn has_wildcard(&self) -> bool {
        self.segments.iter().any(Segment::is_wildcard)
    }
}

impl FromStr for Path {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PathError::Empty);
        }
        let mut segments = SmallVec::new();
        for raw in s.split('.') {
            if raw.is_empty() {
                return Err(PathError::EmptySegment(s.to_string()));
            }
            let (name, each) = match raw.strip_suffix("[*]") {
                Some(name) => (name, true),
                None => (raw, false),
            };
            let valid = !name.is_empty()
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
            if !valid {
                return Err(PathError::InvalidSegment(raw.to_string()));
            }
            let name = name.to_string();
            segments.push(if each { Segment::Each(name) } else { Segment::Field(name) });
        }
        Ok(Path { segments })
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{}", seg)?;
        }
        Ok(())
    }
}

/// Outcome of a named-field lookup.
#[derive(Debug)]
pub enum Field<'a, R> {
    Present(&'a R),
    /// Known to be unset (missing key or explicit null).
    Absent,
    /// The cursor is a scalar or list and has no named fields.
    NotAStruct,
}

/// Named-field access over a structured record.
pub trait Record: Sized {
    fn field(&self, name: &str) -> Field<'_, Self>;

    /// Elements when the value is an ordered collection.
    fn elements(&self) -> Option<&[Self]>;

    fn is_absent(&self) -> bool;

    fn to_value(&self) -> Value;
}

/// Embedded struct names addressable as path segments, as in Go's API types.
pub const OBJECT_META: &str = "ObjectMeta";
pub const TYPE_META: &str = "TypeMeta";
/// JSON key holding the embedded `ObjectMeta`.
pub const METADATA_KEY: &str = "metadata";

/// Exact key first, otherwise the first key equal ignoring ASCII case.
///
/// Go-style names (`Spec.Template`) address camelCase keys (`spec.template`).
pub fn matching_key<'k>(keys: impl IntoIterator<Item = &'k String>, name: &str) -> Option<&'k str> {
    let mut folded = None;
    for key in keys {
        if key == name {
            return Some(key);
        }
        if folded.is_none() && key.eq_ignore_ascii_case(name) {
            folded = Some(key.as_str());
        }
    }
    folded
}

impl Record for Value {
    fn field(&self, name: &str) -> Field<'_, Self> {
        let Value::Object(map) = self else {
            return Field::NotAStruct;
        };
        if let Some(v) = matching_key(map.keys(), name).and_then(|k| map.get(k)) {
            return present(v);
        }
        // apiVersion and kind sit on the object itself
        if name.eq_ignore_ascii_case(TYPE_META) {
            return Field::Present(self);
        }
        let meta = map.get(METADATA_KEY);
        if name.eq_ignore_ascii_case(OBJECT_META) {
            return meta.map_or(Field::Absent, present);
        }
        // promoted ObjectMeta fields: Labels, Annotations, Name...
        if let Some(Value::Object(meta)) = meta {
            if let Some(v) = matching_key(meta.keys(), name).and_then(|k| meta.get(k)) {
                return present(v);
            }
        }
        Field::Absent
    }

    fn elements(&self) -> Option<&[Self]> {
        self.as_array().map(Vec::as_slice)
    }

    fn is_absent(&self) -> bool {
        Value::is_null(self)
    }

    fn to_value(&self) -> Value {
        self.clone()
    }
}

fn present(v: &Value) -> Field<'_, Value> {
    if v.is_null() {
        Field::Absent
    } else {
        Field::Present(v)
    }
}

/// Static shape of a record type.
///
/// Lets a path be checked once, before any fetch, so that a misspelled field
/// is told apart from a field that is merely unset on some object.
pub trait Shape: Sized {
    /// Shape of the named field, `None` when the type has no such field.
    fn field(&self, name: &str) -> Option<Self>;

    /// Element shape when this is a list.
    fn items(&self) -> Option<Self>;
}

/// Check that every segment of `path` names a field of `shape`.
pub fn check<S: Shape>(shape: S, path: &Path) -> Result<(), ResolveError> {
    if path.segments().is_empty() {
        return Err(ResolveError::EmptyPath);
    }
    let mut cursor = shape;
    for seg in path.segments() {
        let field = cursor.field(seg.name()).ok_or_else(|| ResolveError::FieldNotFound(seg.name().to_string()))?;
        cursor = match seg {
            Segment::Field(_) => field,
            Segment::Each(name) => field.items().ok_or_else(|| ResolveError::NotACollection(name.clone()))?,
        };
    }
    Ok(())
}

/// Resolve `path` against `record`.
pub fn resolve<R: Record>(record: &R, path: &Path) -> Result<ExtractedValue, ResolveError> {
    resolve_segments(record, path.segments())
}

fn resolve_segments<R: Record>(record: &R, segments: &[Segment]) -> Result<ExtractedValue, ResolveError> {
    if segments.is_empty() {
        return Err(ResolveError::EmptyPath);
    }
    if record.is_absent() {
        return Err(ResolveError::FieldNotFound(segments[0].name().to_string()));
    }
    let mut cursor = Some(record);
    // segment that came back unset; the next lookup cannot continue past it
    let mut unset: Option<&str> = None;
    for (i, seg) in segments.iter().enumerate() {
        let Some(current) = cursor else {
            return Err(ResolveError::FieldNotFound(unset.unwrap_or(seg.name()).to_string()));
        };
        match seg {
            Segment::Field(name) => {
                cursor = match current.field(name) {
                    Field::Present(v) => Some(v),
                    Field::Absent => {
                        unset = Some(name.as_str());
                        None
                    }
                    Field::NotAStruct => return Err(ResolveError::FieldNotFound(name.clone())),
                };
            }
            Segment::Each(name) => {
                let items: &[R] = match current.field(name) {
                    Field::Present(v) => v.elements().ok_or_else(|| ResolveError::NotACollection(name.clone()))?,
                    // an unset list is an empty list
                    Field::Absent => &[],
                    Field::NotAStruct => return Err(ResolveError::FieldNotFound(name.clone())),
                };
                let rest = &segments[i + 1..];
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    if rest.is_empty() {
                        out.push(item.to_value());
                    } else {
                        match resolve_segments(item, rest)? {
                            ExtractedValue::Single(v) => out.push(v),
                            ExtractedValue::Sequence(vs) => out.extend(vs),
                        }
                    }
                }
                return Ok(ExtractedValue::Sequence(out));
            }
        }
    }
    Ok(ExtractedValue::Single(cursor.map_or(Value::Null, Record::to_value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment() -> Value {
        json!({
            "metadata": { "name": "api" },
            "spec": {
                "replicas": 2,
                "template": {
                    "spec": {
                        "containers": [
                            { "name": "app", "image": "reg.a/app:1.0", "env": [{ "name": "A", "value": "1" }] },
                            { "name": "sidecar", "image": "reg.a/proxy:2.1", "ports": [{ "containerPort": 80 }, { "containerPort": 443 }] }
                        ]
                    }
                }
            }
        })
    }

    #[test]
    fn parse_roundtrips_display() {
        let p = Path::parse("Spec.Template.Spec.Containers[*].Env").unwrap();
        assert_eq!(p.segments().len(), 5);
        assert!(p.has_wildcard());
        assert_eq!(p.segments()[3], Segment::Each("Containers".into()));
        assert_eq!(p.to_string(), "Spec.Template.Spec.Containers[*].Env");
    }

    #[test]
    fn parse_rejects_malformed() {
        assert_eq!(Path::parse("").unwrap_err(), PathError::Empty);
        assert_eq!(Path::parse("  ").unwrap_err(), PathError::Empty);
        assert!(matches!(Path::parse("Spec..Template"), Err(PathError::EmptySegment(_))));
        assert!(matches!(Path::parse("Spec.Containers[0]"), Err(PathError::InvalidSegment(_))));
        assert!(matches!(Path::parse("Spec.[*]"), Err(PathError::InvalidSegment(_))));
        assert!(matches!(Path::parse("Spec.Contain ers"), Err(PathError::InvalidSegment(_))));
    }

    #[test]
    fn plain_path_yields_one_value() {
        let p = Path::parse("Spec.Replicas").unwrap();
        assert_eq!(resolve(&deployment(), &p).unwrap(), ExtractedValue::Single(json!(2)));
    }

    #[test]
    fn exact_key_wins_over_case_insensitive() {
        let v = json!({ "Name": "upper", "name": "lower" });
        let p = Path::parse("name").unwrap();
        assert_eq!(resolve(&v, &p).unwrap(), ExtractedValue::Single(json!("lower")));
    }

    #[test]
    fn unset_leaf_is_null_but_unset_parent_fails() {
        let p = Path::parse("Spec.Strategy").unwrap();
        assert_eq!(resolve(&deployment(), &p).unwrap(), ExtractedValue::Single(Value::Null));
        let p = Path::parse("Spec.Strategy.Type").unwrap();
        assert_eq!(resolve(&deployment(), &p).unwrap_err(), ResolveError::FieldNotFound("Strategy".into()));
        let p = Path::parse("Spec.Templat.Spec").unwrap();
        assert_eq!(resolve(&deployment(), &p).unwrap_err(), ResolveError::FieldNotFound("Templat".into()));
    }

    #[test]
    fn field_on_scalar_is_not_found() {
        let p = Path::parse("Spec.Replicas.Value").unwrap();
        assert_eq!(resolve(&deployment(), &p).unwrap_err(), ResolveError::FieldNotFound("Value".into()));
    }

    #[test]
    fn wildcard_returns_one_value_per_element() {
        let p = Path::parse("Spec.Template.Spec.Containers[*].Image").unwrap();
        assert_eq!(
            resolve(&deployment(), &p).unwrap(),
            ExtractedValue::Sequence(vec![json!("reg.a/app:1.0"), json!("reg.a/proxy:2.1")])
        );
    }

    #[test]
    fn trailing_wildcard_returns_elements() {
        let p = Path::parse("Spec.Template.Spec.Containers[*]").unwrap();
        let out = resolve(&deployment(), &p).unwrap();
        assert_eq!(out.len(), 2);
        let ExtractedValue::Sequence(items) = out else { panic!("expected sequence") };
        assert_eq!(items[1]["name"], json!("sidecar"));
    }

    #[test]
    fn nested_wildcards_flatten_in_order() {
        let p = Path::parse("Spec.Template.Spec.Containers[*].Ports[*].ContainerPort").unwrap();
        // first container has no ports: contributes nothing
        assert_eq!(
            resolve(&deployment(), &p).unwrap(),
            ExtractedValue::Sequence(vec![json!(80), json!(443)])
        );
    }

    #[test]
    fn wildcard_on_non_list_fails() {
        let p = Path::parse("Spec.Template[*].Spec").unwrap();
        assert_eq!(resolve(&deployment(), &p).unwrap_err(), ResolveError::NotACollection("Template".into()));
    }

    #[test]
    fn unset_or_empty_list_yields_empty_sequence() {
        let p = Path::parse("Spec.Template.Spec.InitContainers[*].Image").unwrap();
        assert_eq!(resolve(&deployment(), &p).unwrap(), ExtractedValue::Sequence(vec![]));
        let v = json!({ "items": [] });
        assert_eq!(resolve(&v, &Path::parse("items[*]").unwrap()).unwrap(), ExtractedValue::Sequence(vec![]));
    }

    #[test]
    fn unset_field_per_element_is_null() {
        let p = Path::parse("Spec.Template.Spec.Containers[*].Env").unwrap();
        let ExtractedValue::Sequence(items) = resolve(&deployment(), &p).unwrap() else { panic!("expected sequence") };
        assert_eq!(items.len(), 2);
        assert_eq!(items[1], Value::Null);
    }

    #[test]
    fn embedded_meta_names_reach_metadata() {
        let v = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "api", "labels": { "app": "api" } },
            "spec": { "replicas": 1 }
        });
        let labels = ExtractedValue::Single(json!({ "app": "api" }));
        assert_eq!(resolve(&v, &Path::parse("Labels").unwrap()).unwrap(), labels);
        assert_eq!(resolve(&v, &Path::parse("ObjectMeta.Labels").unwrap()).unwrap(), labels);
        assert_eq!(resolve(&v, &Path::parse("Name").unwrap()).unwrap(), ExtractedValue::Single(json!("api")));
        assert_eq!(resolve(&v, &Path::parse("TypeMeta.Kind").unwrap()).unwrap(), ExtractedValue::Single(json!("Deployment")));
        // unset promoted field is null, like any other unset leaf
        assert_eq!(resolve(&v, &Path::parse("Annotations").unwrap()).unwrap(), ExtractedValue::Single(Value::Null));
    }

    /// Tiny hand-written shape: objects list their fields, `[]` marks a list.
    #[derive(Clone, Copy)]
    struct Fixed(&'static str);

    impl Shape for Fixed {
        fn field(&self, name: &str) -> Option<Self> {
            let fields: &[(&str, &str)] = match self.0 {
                "root" => &[("spec", "spec")],
                "spec" => &[("replicas", "int"), ("containers", "[]container")],
                "container" => &[("image", "string")],
                _ => &[],
            };
            fields.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|&(_, s)| Fixed(s))
        }

        fn items(&self) -> Option<Self> {
            self.0.strip_prefix("[]").map(Fixed)
        }
    }

    #[test]
    fn check_rejects_unknown_fields_before_resolution() {
        let ok = |p: &str| check(Fixed("root"), &Path::parse(p).unwrap());
        assert_eq!(ok("Spec.Replicas"), Ok(()));
        assert_eq!(ok("Spec.Containers[*].Image"), Ok(()));
        assert_eq!(ok("Spec.Replicaz"), Err(ResolveError::FieldNotFound("Replicaz".into())));
        assert_eq!(ok("Spec.Replicas.Value"), Err(ResolveError::FieldNotFound("Value".into())));
        assert_eq!(ok("Spec[*].Replicas"), Err(ResolveError::NotACollection("Spec".into())));
    }

    #[test]
    fn empty_segment_list_is_rejected() {
        assert_eq!(resolve_segments(&deployment(), &[]).unwrap_err(), ResolveError::EmptyPath);
    }
}
