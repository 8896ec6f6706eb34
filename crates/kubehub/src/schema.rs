//! Path checks against the OpenAPI schema of each supported kind.

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::ConfigMap;
use kubediff_core::{check, matching_key, ConfigError, Path, ResourceKind, Shape, METADATA_KEY, OBJECT_META, TYPE_META};
use schemars::schema::{RootSchema, Schema, SchemaObject, SingleOrVec};
use schemars::schema_for;
use tracing::debug;

const DEFINITIONS: &str = "#/definitions/";
const MAX_REF_HOPS: usize = 16;

/// Generated schema for one resource kind.
pub struct KindSchema {
    kind: ResourceKind,
    root: RootSchema,
}

impl KindSchema {
    pub fn new(kind: ResourceKind) -> Self {
        let root = match kind {
            ResourceKind::Deployment => schema_for!(Deployment),
            ResourceKind::DaemonSet => schema_for!(DaemonSet),
            ResourceKind::StatefulSet => schema_for!(StatefulSet),
            ResourceKind::ConfigMap => schema_for!(ConfigMap),
        };
        debug!(%kind, definitions = root.definitions.len(), "schema loaded");
        Self { kind, root }
    }

    /// Reject `path` when one of its segments is not a field of this kind.
    pub fn check(&self, path: &Path) -> Result<(), ConfigError> {
        let cursor = Cursor { root: &self.root, node: Some(&self.root.schema) };
        check(cursor, path).map_err(|cause| ConfigError::UnknownField { kind: self.kind, path: path.to_string(), cause })
    }
}

/// Check every path against every kind it will be resolved on.
pub fn check_paths(kinds: &[ResourceKind], paths: &[Path]) -> Result<(), ConfigError> {
    for kind in kinds {
        let schema = KindSchema::new(*kind);
        for path in paths {
            schema.check(path)?;
        }
    }
    Ok(())
}

/// Position in a schema; `node: None` is a free-form value that accepts any suffix.
#[derive(Clone, Copy)]
struct Cursor<'a> {
    root: &'a RootSchema,
    node: Option<&'a SchemaObject>,
}

impl<'a> Cursor<'a> {
    fn enter(&self, schema: &'a Schema) -> Self {
        let mut node = match schema {
            Schema::Bool(_) => return self.any(),
            Schema::Object(obj) => obj,
        };
        for _ in 0..MAX_REF_HOPS {
            let Some(reference) = node.reference.as_deref() else { break };
            match reference.strip_prefix(DEFINITIONS).and_then(|name| self.root.definitions.get(name)) {
                Some(Schema::Object(obj)) => node = obj,
                _ => return self.any(),
            }
        }
        let opaque = node.instance_type.is_none() && node.object.is_none() && node.array.is_none();
        Cursor { root: self.root, node: if opaque { None } else { Some(node) } }
    }

    fn any(&self) -> Self {
        Cursor { root: self.root, node: None }
    }

    fn property(&self, name: &str) -> Option<Self> {
        let props = &self.node?.object.as_deref()?.properties;
        matching_key(props.keys(), name).and_then(|k| props.get(k)).map(|s| self.enter(s))
    }
}

impl Shape for Cursor<'_> {
    fn field(&self, name: &str) -> Option<Self> {
        let Some(node) = self.node else {
            return Some(*self);
        };
        let obj = node.object.as_deref()?;
        if let Some(child) = self.property(name) {
            return Some(child);
        }
        if name.eq_ignore_ascii_case(TYPE_META) && obj.properties.contains_key("kind") {
            return Some(*self);
        }
        if let Some(meta) = self.property(METADATA_KEY) {
            if name.eq_ignore_ascii_case(OBJECT_META) {
                return Some(meta);
            }
            if let Some(promoted) = meta.property(name) {
                return Some(promoted);
            }
        }
        // maps (labels, data) accept any key
        obj.additional_properties.as_deref().map(|s| self.enter(s))
    }

    fn items(&self) -> Option<Self> {
        let Some(node) = self.node else {
            return Some(*self);
        };
        match node.array.as_deref()?.items.as_ref() {
            Some(SingleOrVec::Single(item)) => Some(self.enter(item)),
            _ => Some(self.any()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubediff_core::ResolveError;

    fn check(kind: ResourceKind, path: &str) -> Result<(), ConfigError> {
        KindSchema::new(kind).check(&Path::parse(path).unwrap())
    }

    #[test]
    fn known_workload_paths_pass() {
        for kind in ResourceKind::WORKLOADS {
            for path in kubediff_core::compare::IMAGE_PATHS.iter().chain(&kubediff_core::compare::ENV_PATHS) {
                assert_eq!(check(kind, path), Ok(()), "{} {}", kind, path);
            }
        }
        assert_eq!(check(ResourceKind::Deployment, "Spec.Replicas"), Ok(()));
        assert_eq!(check(ResourceKind::Deployment, "Spec.Template.Spec.Containers[*].Ports[*].ContainerPort"), Ok(()));
        assert_eq!(check(ResourceKind::Deployment, "Spec.Template.Spec.Containers[*].Resources.Limits.cpu"), Ok(()));
    }

    #[test]
    fn misspelled_leaf_is_rejected() {
        assert_eq!(
            check(ResourceKind::Deployment, "Spec.Replicaz"),
            Err(ConfigError::UnknownField {
                kind: ResourceKind::Deployment,
                path: "Spec.Replicaz".into(),
                cause: ResolveError::FieldNotFound("Replicaz".into()),
            })
        );
    }

    #[test]
    fn misspelled_parent_names_itself() {
        let err = check(ResourceKind::StatefulSet, "Spec.Templat.Spec").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownField { cause: ResolveError::FieldNotFound(f), .. } if f == "Templat"));
    }

    #[test]
    fn scalar_and_list_misuse_is_rejected() {
        let err = check(ResourceKind::Deployment, "Spec.Replicas.Value").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownField { cause: ResolveError::FieldNotFound(f), .. } if f == "Value"));
        let err = check(ResourceKind::Deployment, "Spec.Template[*].Spec").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownField { cause: ResolveError::NotACollection(f), .. } if f == "Template"));
    }

    #[test]
    fn embedded_meta_names_are_accepted() {
        for path in ["Labels", "Annotations", "ObjectMeta.Labels", "TypeMeta.Kind", "Spec.Template.Labels", "Labels.app"] {
            assert_eq!(check(ResourceKind::Deployment, path), Ok(()), "{}", path);
        }
    }

    #[test]
    fn configmap_has_data_but_no_spec() {
        assert_eq!(check(ResourceKind::ConfigMap, "Data.anything"), Ok(()));
        let err = check(ResourceKind::ConfigMap, "Spec.Replicas").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownField { kind: ResourceKind::ConfigMap, cause: ResolveError::FieldNotFound(f), .. } if f == "Spec"));
    }

    #[test]
    fn check_paths_covers_every_kind() {
        let paths = vec![Path::parse("Spec.Replicas").unwrap()];
        assert_eq!(check_paths(&[ResourceKind::Deployment, ResourceKind::StatefulSet], &paths), Ok(()));
        assert!(check_paths(&[ResourceKind::Deployment, ResourceKind::ConfigMap], &paths).is_err());
    }
}
