//! Shared types for the ResourceSyncRule CRD

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Separator between the API version and kind in a kind identity string
const KIND_SEPARATOR: &str = ", Kind=";

/// Fully-qualified resource type discriminator.
///
/// Wraps kube's [`kube::api::GroupVersionKind`] (it derefs to it) and adds
/// the CRD schema plus the string form used in reconcile keys and the
/// original-kind annotation: `"<apiVersion>, Kind=<kind>"`, e.g.
/// `"apps/v1, Kind=Deployment"` or `"v1, Kind=ConfigMap"` for the core group.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(from = "GvkFields", into = "GvkFields")]
pub struct GroupVersionKind(kube::api::GroupVersionKind);

/// Serialized shape; `group` may be omitted for the core group
#[derive(Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct GvkFields {
    /// API group ("" for the core group)
    #[serde(default)]
    group: String,
    /// API version (e.g. "v1")
    version: String,
    /// Resource kind (e.g. "ConfigMap")
    kind: String,
}

impl From<GvkFields> for GroupVersionKind {
    fn from(f: GvkFields) -> Self {
        Self::gvk(&f.group, &f.version, &f.kind)
    }
}

impl From<GroupVersionKind> for GvkFields {
    fn from(gvk: GroupVersionKind) -> Self {
        let kube::api::GroupVersionKind {
            group,
            version,
            kind,
        } = gvk.0;
        Self {
            group,
            version,
            kind,
        }
    }
}

impl JsonSchema for GroupVersionKind {
    fn schema_name() -> String {
        "GroupVersionKind".to_string()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        GvkFields::json_schema(gen)
    }
}

impl Default for GroupVersionKind {
    fn default() -> Self {
        Self::gvk("", "", "")
    }
}

impl Deref for GroupVersionKind {
    type Target = kube::api::GroupVersionKind;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for GroupVersionKind {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<kube::api::GroupVersionKind> for GroupVersionKind {
    fn from(gvk: kube::api::GroupVersionKind) -> Self {
        Self(gvk)
    }
}

impl From<GroupVersionKind> for kube::api::GroupVersionKind {
    fn from(gvk: GroupVersionKind) -> Self {
        gvk.0
    }
}

impl GroupVersionKind {
    /// Build a kind identity from its parts
    pub fn gvk(group: &str, version: &str, kind: &str) -> Self {
        Self(kube::api::GroupVersionKind::gvk(group, version, kind))
    }

    /// Build a kind identity from an apiVersion string and a kind
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        let (group, version) = match api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", api_version),
        };
        Self::gvk(group, version, kind)
    }

    /// The apiVersion string (`group/version`, or just `version` for core)
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for GroupVersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.api_version(), KIND_SEPARATOR, self.kind)
    }
}

impl FromStr for GroupVersionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (api_version, kind) = s
            .split_once(KIND_SEPARATOR)
            .ok_or_else(|| Error::serialization(format!("missing '{KIND_SEPARATOR}' in {s:?}")))?;

        // Tolerate a leading slash for the empty core group ("/v1")
        let gvk = Self::from_api_version(api_version.trim_start_matches('/'), kind);
        if gvk.version.is_empty() || gvk.version.contains('/') {
            return Err(Error::serialization(format!("invalid api version in {s:?}")));
        }
        if gvk.kind.is_empty() || gvk.kind.contains(char::is_whitespace) {
            return Err(Error::serialization(format!("invalid kind in {s:?}")));
        }
        Ok(gvk)
    }
}

/// Set of key/value additions and key removals applied to a string map.
///
/// Additions are applied before removals, so a key listed in both ends up removed.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeyValueMutations {
    /// Entries to add or overwrite
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub add: BTreeMap<String, String>,
    /// Keys to remove
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<String>,
}

impl KeyValueMutations {
    /// Apply add-then-remove to the given map
    pub fn apply_to(&self, map: &mut BTreeMap<String, String>) {
        for (k, v) in &self.add {
            map.insert(k.clone(), v.clone());
        }
        for k in &self.remove {
            map.remove(k);
        }
    }

    /// Fold another mutation set into this one
    pub fn merge(&mut self, other: &KeyValueMutations) {
        self.add
            .extend(other.add.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.remove.extend(other.remove.iter().cloned());
    }

    /// True when nothing would change
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

/// Overlay patch operation
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OverlayPatchType {
    /// Set the value at the path, creating the leaf when absent
    #[default]
    Replace,
    /// Remove the value at the path, ignoring absent paths
    Remove,
}

/// One overlay patch applied to a mirrored object
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OverlayPatch {
    /// Operation to perform
    #[serde(rename = "type", default)]
    pub type_: OverlayPatchType,
    /// JSON pointer to the target field (e.g. "/spec/replicas")
    pub path: String,
    /// New value for replace operations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub value: Option<serde_json::Value>,
    /// Parse a string value as YAML before applying it
    #[serde(default)]
    pub parse_value: bool,
}

/// Operator for a selector requirement
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SelectorOperator {
    /// Value is one of `values`
    In,
    /// Key is absent or value is not one of `values`
    NotIn,
    /// Key is present
    Exists,
    /// Key is absent
    DoesNotExist,
}

/// Single key requirement of an [`ObjectSelector`]
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SelectorRequirement {
    /// Label or annotation key
    pub key: String,
    /// How the key relates to `values`
    pub operator: SelectorOperator,
    /// Values for In/NotIn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl SelectorRequirement {
    fn matches(&self, map: &BTreeMap<String, String>) -> bool {
        let value = map.get(&self.key);
        match self.operator {
            SelectorOperator::In => value.is_some_and(|v| self.values.contains(v)),
            SelectorOperator::NotIn => value.is_none_or(|v| !self.values.contains(v)),
            SelectorOperator::Exists => value.is_some(),
            SelectorOperator::DoesNotExist => value.is_none(),
        }
    }
}

/// Selector over a string map (labels or annotations)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSelector {
    /// Exact key/value pairs that must be present
    #[serde(default, alias = "matchAnnotations", skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    /// Set-based requirements
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<SelectorRequirement>,
}

impl ObjectSelector {
    /// True when every pair and every requirement holds for the map
    pub fn matches(&self, map: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| map.get(k) == Some(v))
            && self.match_expressions.iter().all(|req| req.matches(map))
    }
}

/// Exact object coordinates
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectKeyMatch {
    /// Object name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Object namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

fn preserve_unknown_fields(_gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    schemars::schema::Schema::Object(schemars::schema::SchemaObject {
        extensions: [(
            "x-kubernetes-preserve-unknown-fields".to_string(),
            serde_json::Value::Bool(true),
        )]
        .into_iter()
        .collect(),
        ..Default::default()
    })
}
