//! Object metadata shared by every resource kind.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Common metadata carried by all resources.
///
/// Identity is (namespace, name). `generation` increments on every spec
/// change and is compared against `observed_generation` in status to decide
/// whether the last-seen spec has been applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectMeta {
    /// Namespace the object lives in
    pub namespace: String,
    /// Object name, unique within (kind, namespace)
    pub name: String,
    /// Server-assigned unique identifier
    pub uid: String,
    /// Monotonic counter incremented on every spec change
    pub generation: i64,
    /// Opaque version used for optimistic concurrency
    pub resource_version: u64,
    /// Creation timestamp, set by the server
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Set when deletion has been requested; the object is removed once
    /// all finalizers have been cleared
    pub deletion_timestamp: Option<DateTime<Utc>>,
    /// User and controller labels
    pub labels: BTreeMap<String, String>,
    /// Unstructured annotations
    pub annotations: BTreeMap<String, String>,
    /// Deferred-cleanup markers
    pub finalizers: Vec<String>,
    /// References to owning objects for cascading deletion
    pub owner_references: Vec<OwnerReference>,
}

impl ObjectMeta {
    /// Create metadata with just namespace and name.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// "namespace/name" key, unique per kind.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Whether deletion has been requested.
    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    /// Whether the given finalizer is present.
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Add a finalizer if missing. Returns true when the list changed.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Remove a finalizer if present. Returns true when the list changed.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        self.finalizers.len() != before
    }

    /// Whether any owner reference points at the given uid.
    pub fn owned_by(&self, owner_uid: &str) -> bool {
        self.owner_references.iter().any(|r| r.uid == owner_uid)
    }
}

/// Reference to an owning object, used for cascading garbage collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    /// Kind of the owner
    pub kind: String,
    /// Name of the owner (same namespace as the owned object)
    pub name: String,
    /// Uid of the owner
    pub uid: String,
    /// Whether the owner is the managing controller
    #[serde(default)]
    pub controller: bool,
}

/// Reference to another resource by name.
///
/// The namespace defaults to the referring object's namespace when empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectRef {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            namespace: String::new(),
            name: name.into(),
        }
    }

    /// Resolve the effective namespace given the referrer's namespace.
    pub fn namespace_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        if self.namespace.is_empty() {
            fallback
        } else {
            &self.namespace
        }
    }
}

/// Reference to a single key inside a Secret.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

/// Typed resource contract consumed by the cluster store and the
/// reconciliation framework.
pub trait Resource: Clone + Send + Sync + 'static {
    /// Kind name, e.g. "VirtualMachine"
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// JSON rendering of the spec, used for generation bumping on update.
    fn spec_json(&self) -> serde_json::Value;

    /// Admission validation. Returns human-readable failures; empty means
    /// the object is admitted. `old` is the stored object on update.
    fn validate(&self, _old: Option<&Self>) -> Vec<String> {
        Vec::new()
    }
}

/// Build an owner reference pointing at `owner`.
pub fn owner_reference_to<R: Resource>(owner: &R, controller: bool) -> OwnerReference {
    OwnerReference {
        kind: R::KIND.to_string(),
        name: owner.meta().name.clone(),
        uid: owner.meta().uid.clone(),
        controller,
    }
}

/// Implements [`Resource`] for kinds with plain spec/status layout and no
/// extra admission rules.
#[macro_export]
macro_rules! impl_resource {
    ($ty:ty, $kind:literal) => {
        impl $crate::meta::Resource for $ty {
            const KIND: &'static str = $kind;

            fn meta(&self) -> &$crate::meta::ObjectMeta {
                &self.meta
            }

            fn meta_mut(&mut self) -> &mut $crate::meta::ObjectMeta {
                &mut self.meta
            }

            fn spec_json(&self) -> serde_json::Value {
                serde_json::to_value(&self.spec).unwrap_or(serde_json::Value::Null)
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finalizer_helpers() {
        let mut meta = ObjectMeta::new("default", "vm-1");
        assert!(!meta.has_finalizer("virtrigaud.io/vm"));
        assert!(meta.add_finalizer("virtrigaud.io/vm"));
        assert!(!meta.add_finalizer("virtrigaud.io/vm"));
        assert!(meta.has_finalizer("virtrigaud.io/vm"));
        assert!(meta.remove_finalizer("virtrigaud.io/vm"));
        assert!(!meta.remove_finalizer("virtrigaud.io/vm"));
    }

    #[test]
    fn test_object_ref_namespace_fallback() {
        let r = ObjectRef::new("web-class");
        assert_eq!(r.namespace_or("tenant-a"), "tenant-a");

        let r = ObjectRef {
            namespace: "shared".to_string(),
            name: "web-class".to_string(),
        };
        assert_eq!(r.namespace_or("tenant-a"), "shared");
    }
}
