//! Generic object access
//!
//! Mirrored objects are handled as `DynamicObject`s regardless of kind.
//! `kube::ResourceExt` already covers name, namespace, labels, annotations,
//! UID, resource version and finalizers; [`ManagedObject`] adds the kind
//! identity and the two control markers this crate persists.

use std::fmt;

use kube::api::{DynamicObject, TypeMeta};
use kube::ResourceExt;

use crate::crd::GroupVersionKind;
use crate::Error;

/// Annotation naming the cluster that currently writes the object
pub const OWNERSHIP_ANNOTATION: &str = "k8s.cisco.com/resource-owner-cluster-id";

/// Annotation preserving the pre-remap kind identity
pub const ORIGINAL_GVK_ANNOTATION: &str = "k8s.cisco.com/original-group-version-kind";

/// "Last applied configuration" annotations written by kubectl and by
/// the object matcher library; both must not travel to the destination
pub const LAST_APPLIED_ANNOTATIONS: [&str; 2] = [
    "kubectl.kubernetes.io/last-applied-configuration",
    "banzaicloud.com/last-applied",
];

/// Coordinates of one object in one cluster
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// Kind identity
    pub gvk: GroupVersionKind,
    /// Namespace (`None` for cluster-scoped objects)
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Build a key; an empty namespace is treated as cluster-scoped
    pub fn new(gvk: GroupVersionKind, namespace: Option<String>, name: impl Into<String>) -> Self {
        Self {
            gvk,
            namespace: namespace.filter(|ns| !ns.is_empty()),
            name: name.into(),
        }
    }

    /// Key of an existing object; the object must carry apiVersion/kind and a name
    pub fn of(obj: &DynamicObject) -> Result<Self, Error> {
        let gvk = obj
            .gvk()
            .ok_or_else(|| Error::invalid_object("object has no apiVersion/kind"))?;
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::invalid_object(format!("{gvk} object has no name")))?;
        Ok(Self::new(gvk, obj.namespace(), name))
    }

    /// Same namespace and name under another kind
    pub fn with_gvk(&self, gvk: GroupVersionKind) -> Self {
        Self {
            gvk,
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    /// `namespace/name`, or just `name` when cluster-scoped
    pub fn namespaced_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}/{}", self.name),
            None => self.name.clone(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.gvk, self.namespaced_name())
    }
}

/// Kind identity and control-marker accessors for generic objects
pub trait ManagedObject {
    /// Kind identity from apiVersion/kind, if set
    fn gvk(&self) -> Option<GroupVersionKind>;

    /// Overwrite apiVersion/kind
    fn set_gvk(&mut self, gvk: &GroupVersionKind);

    /// Builder-style [`ManagedObject::set_gvk`]
    fn with_gvk(self, gvk: &GroupVersionKind) -> Self;

    /// Cluster named by the ownership marker (empty markers count as unset)
    fn owner_cluster(&self) -> Option<&str>;

    /// Whether the ownership annotation key is present at all
    fn has_ownership_marker(&self) -> bool;

    /// Kind identity recorded before a remap, if any and parseable
    fn original_gvk(&self) -> Option<GroupVersionKind>;
}

impl ManagedObject for DynamicObject {
    fn gvk(&self) -> Option<GroupVersionKind> {
        self.types
            .as_ref()
            .filter(|t| !t.api_version.is_empty() && !t.kind.is_empty())
            .map(|t| GroupVersionKind::from_api_version(&t.api_version, &t.kind))
    }

    fn set_gvk(&mut self, gvk: &GroupVersionKind) {
        self.types = Some(TypeMeta {
            api_version: gvk.api_version(),
            kind: gvk.kind.clone(),
        });
    }

    fn with_gvk(mut self, gvk: &GroupVersionKind) -> Self {
        self.set_gvk(gvk);
        self
    }

    fn owner_cluster(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(OWNERSHIP_ANNOTATION))
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }

    fn has_ownership_marker(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .is_some_and(|a| a.contains_key(OWNERSHIP_ANNOTATION))
    }

    fn original_gvk(&self) -> Option<GroupVersionKind> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ORIGINAL_GVK_ANNOTATION))
            .and_then(|raw| raw.parse().ok())
    }
}
