//! Reconcile request codec
//!
//! A request key is `"<kind identity>|<name>"`; the namespace travels next to
//! it rather than inside it. Keeping the kind in the key lets one queue carry
//! requests for the rule's kind and for remapped kinds without ambiguity.

use std::fmt;

use crate::crd::GroupVersionKind;
use crate::sync::ObjectKey;
use crate::Error;

/// Separator between kind identity and name
pub const KEY_SEPARATOR: char = '|';

/// Encode a kind identity and name into a request key
pub fn encode(gvk: &GroupVersionKind, name: &str) -> String {
    format!("{gvk}{KEY_SEPARATOR}{name}")
}

/// Decode a request key into its kind identity and name
pub fn decode(key: &str) -> Result<(GroupVersionKind, String), Error> {
    let (kind, name) = key
        .split_once(KEY_SEPARATOR)
        .ok_or_else(|| Error::malformed_key(key, format!("missing '{KEY_SEPARATOR}' separator")))?;

    let gvk: GroupVersionKind = kind
        .parse()
        .map_err(|e: Error| Error::malformed_key(key, format!("could not parse kind identity: {e}")))?;

    if name.is_empty() {
        return Err(Error::malformed_key(key, "empty object name"));
    }

    Ok((gvk, name.to_string()))
}

/// One unit of work for the sync pipeline
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReconcileRequest {
    /// Namespace of the object (`None` for cluster-scoped kinds)
    pub namespace: Option<String>,
    /// Encoded `<kind identity>|<name>`
    pub key: String,
}

impl ReconcileRequest {
    /// Encode a request for an object of the given kind
    pub fn new(gvk: &GroupVersionKind, namespace: Option<String>, name: &str) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()),
            key: encode(gvk, name),
        }
    }

    /// Wrap an already-encoded key (e.g. from a manual trigger)
    pub fn from_raw(namespace: Option<String>, key: impl Into<String>) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()),
            key: key.into(),
        }
    }

    /// Decode into the coordinates of the source object
    pub fn object_key(&self) -> Result<ObjectKey, Error> {
        let (gvk, name) = decode(&self.key)?;
        Ok(ObjectKey::new(gvk, self.namespace.clone(), name))
    }
}

impl fmt::Display for ReconcileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.key),
            None => f.write_str(&self.key),
        }
    }
}
