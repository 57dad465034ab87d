//! Rule engine
//!
//! A [`RuleMatcher`] decides whether an object is mirrored and how it is
//! mutated on the way. [`SyncRuleMatcher`] is the strategy backed by a
//! `ResourceSyncRule`; it is built once per controller and shared by all
//! workers.

use std::collections::BTreeMap;

use kube::api::DynamicObject;
use kube::ResourceExt;

#[cfg(test)]
use mockall::automock;

use crate::crd::{
    GroupVersionKind, KeyValueMutations, Mutations, ObjectKeyMatch, OverlayPatch,
    ResourceSyncRuleSpec, SyncRuleMatch,
};
use crate::sync::ManagedObject;
use crate::Error;

/// Merged mutations of every rule that matched an object
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MutationSet {
    /// Annotation add/remove sets
    pub annotations: KeyValueMutations,
    /// Label add/remove sets
    pub labels: KeyValueMutations,
    /// Overlay patches in rule order
    pub overrides: Vec<OverlayPatch>,
    /// Kind to write the object under, if remapped
    pub group_version_kind: Option<GroupVersionKind>,
    /// Push status back after writing
    pub sync_status: bool,
}

impl MutationSet {
    /// Fold one rule's mutations into the set.
    ///
    /// The first rule that remaps wins; later remaps are ignored.
    pub fn merge(&mut self, mutations: &Mutations) {
        self.annotations.merge(&mutations.annotations);
        self.labels.merge(&mutations.labels);
        self.overrides.extend(mutations.overrides.iter().cloned());
        if self.group_version_kind.is_none() {
            self.group_version_kind = mutations.group_version_kind.clone();
        }
        self.sync_status |= mutations.sync_status;
    }

    /// Kind an object of kind `current` is remapped to, if it changes
    pub fn mutated_gvk(&self, current: &GroupVersionKind) -> Option<&GroupVersionKind> {
        self.group_version_kind
            .as_ref()
            .filter(|target| *target != current)
    }
}

/// Match predicate and mutation source for one rule
#[cfg_attr(test, automock)]
pub trait RuleMatcher: Send + Sync {
    /// Kind the rule watches in the source cluster
    fn target_gvk(&self) -> GroupVersionKind;

    /// Evaluate an object; `Ok(None)` when no rule matches
    fn match_object(&self, obj: &DynamicObject) -> Result<Option<MutationSet>, Error>;

    /// Kind the rule remaps `gvk` to, independent of any particular object
    fn remapped_gvk(&self, gvk: &GroupVersionKind) -> Option<GroupVersionKind>;
}

/// [`RuleMatcher`] for a `ResourceSyncRule` spec
#[derive(Clone, Debug)]
pub struct SyncRuleMatcher {
    spec: ResourceSyncRuleSpec,
}

impl SyncRuleMatcher {
    /// Build a matcher, rejecting specs that cannot be evaluated
    pub fn new(spec: ResourceSyncRuleSpec) -> Result<Self, Error> {
        spec.validate()?;
        Ok(Self { spec })
    }
}

impl RuleMatcher for SyncRuleMatcher {
    fn target_gvk(&self) -> GroupVersionKind {
        self.spec.group_version_kind.clone()
    }

    fn match_object(&self, obj: &DynamicObject) -> Result<Option<MutationSet>, Error> {
        let gvk = obj
            .gvk()
            .ok_or_else(|| Error::rule_match("object has no apiVersion/kind"))?;
        if gvk != self.spec.group_version_kind {
            return Ok(None);
        }
        if obj.metadata.name.is_none() {
            return Err(Error::rule_match(format!("{gvk} object has no name")));
        }

        let mut matched: Option<MutationSet> = None;
        for rule in &self.spec.rules {
            if rule.matches.is_empty() || rule.matches.iter().any(|m| match_one(m, obj)) {
                matched.get_or_insert_with(MutationSet::default).merge(&rule.mutations);
            }
        }
        Ok(matched)
    }

    fn remapped_gvk(&self, gvk: &GroupVersionKind) -> Option<GroupVersionKind> {
        if *gvk != self.spec.group_version_kind {
            return None;
        }
        self.spec
            .rules
            .iter()
            .find_map(|rule| rule.mutations.group_version_kind.as_ref())
            .filter(|target| *target != gvk)
            .cloned()
    }
}

fn match_one(criteria: &SyncRuleMatch, obj: &DynamicObject) -> bool {
    let namespace = obj.namespace().unwrap_or_default();

    if let Some(ObjectKeyMatch { name, namespace: ns }) = &criteria.object_key {
        if name.as_deref().is_some_and(|n| Some(n) != obj.metadata.name.as_deref()) {
            return false;
        }
        if ns.as_deref().is_some_and(|n| n != namespace) {
            return false;
        }
    }

    if !criteria.namespaces.is_empty() && !criteria.namespaces.contains(&namespace) {
        return false;
    }

    let empty = BTreeMap::new();
    let labels = obj.metadata.labels.as_ref().unwrap_or(&empty);
    let annotations = obj.metadata.annotations.as_ref().unwrap_or(&empty);

    criteria.labels.iter().all(|s| s.matches(labels))
        && criteria.annotations.iter().all(|s| s.matches(annotations))
}
