//! ResourceSyncRule Custom Resource Definition
//!
//! A ResourceSyncRule names a resource kind to mirror from a remote cluster
//! into the local one, which objects of that kind qualify, and how they are
//! mutated on the way in.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{GroupVersionKind, KeyValueMutations, ObjectKeyMatch, ObjectSelector, OverlayPatch};

/// Specification for a ResourceSyncRule
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "clusterregistry.k8s.cisco.com",
    version = "v1alpha1",
    kind = "ResourceSyncRule",
    plural = "resourcesyncrules",
    shortname = "rsr",
    namespaced = false,
    printcolumn = r#"{"name":"Kind","type":"string","jsonPath":".spec.groupVersionKind.kind"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSyncRuleSpec {
    /// Kind of the objects this rule mirrors
    pub group_version_kind: GroupVersionKind,

    /// Match/mutation pairs; an object is synced when any rule matches
    #[serde(default)]
    pub rules: Vec<SyncRule>,
}

impl ResourceSyncRuleSpec {
    /// Validate the rule specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        let gvk = &self.group_version_kind;
        if gvk.version.is_empty() || gvk.kind.is_empty() {
            return Err(crate::Error::rule_match(
                "groupVersionKind must set both version and kind",
            ));
        }
        for rule in &self.rules {
            if let Some(target) = &rule.mutations.group_version_kind {
                if target.version.is_empty() || target.kind.is_empty() {
                    return Err(crate::Error::rule_match(
                        "mutations.groupVersionKind must set both version and kind",
                    ));
                }
            }
        }
        Ok(())
    }
}

/// One match/mutation pair
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncRule {
    /// Any of these must hold; empty means every object of the kind
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<SyncRuleMatch>,

    /// Changes applied to matched objects
    #[serde(default)]
    pub mutations: Mutations,
}

/// Criteria for a single match; all present criteria must hold
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncRuleMatch {
    /// Exact name and/or namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_key: Option<ObjectKeyMatch>,

    /// Allowed namespaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,

    /// Label selectors; every selector must match
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<ObjectSelector>,

    /// Annotation selectors; every selector must match
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<ObjectSelector>,
}

/// Mutations applied to a matched object before it is written
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Mutations {
    /// Annotation changes
    #[serde(default)]
    pub annotations: KeyValueMutations,

    /// Label changes
    #[serde(default)]
    pub labels: KeyValueMutations,

    /// Overlay patches applied after metadata mutation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<OverlayPatch>,

    /// Write the object under this kind instead of its own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_version_kind: Option<GroupVersionKind>,

    /// Push the source status onto the mirrored object after writing it
    #[serde(default)]
    pub sync_status: bool,
}
