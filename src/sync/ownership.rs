//! Ownership arbitration
//!
//! A mirrored object names its writer in the ownership annotation. A claim
//! survives until its claimant is gone: a pass from another cluster may only
//! take the object over once the claimant drops out of the cluster registry.

use std::collections::HashMap;

use kube::api::DynamicObject;

use crate::clusters::ClusterInfo;
use crate::sync::ManagedObject;

/// Arbitration decisions for one pipeline pass
///
/// Built from a single registry snapshot so that both decisions in a pass
/// see the same liveness view.
pub struct OwnershipPolicy<'a> {
    claimant: &'a str,
    destination_id: &'a str,
    alive: &'a HashMap<String, ClusterInfo>,
}

impl<'a> OwnershipPolicy<'a> {
    /// `claimant` is the identity this pass writes under; `destination_id`
    /// identifies the cluster being written to.
    pub fn new(
        claimant: &'a str,
        destination_id: &'a str,
        alive: &'a HashMap<String, ClusterInfo>,
    ) -> Self {
        Self {
            claimant,
            destination_id,
            alive,
        }
    }

    /// May `desired` be created in the destination?
    pub fn should_create(&self, desired: &DynamicObject) -> bool {
        may_create(desired.owner_cluster(), self.destination_id)
    }

    /// May `current` be overwritten by this pass?
    pub fn should_update(&self, current: &DynamicObject) -> bool {
        may_update(current.owner_cluster(), self.claimant, |id| {
            self.alive.contains_key(id)
        })
    }
}

/// Creation is refused only when the marker names the destination itself
pub fn may_create(owner: Option<&str>, destination_id: &str) -> bool {
    owner != Some(destination_id)
}

/// Update is refused only while another, still alive, cluster holds the claim
pub fn may_update(owner: Option<&str>, claimant: &str, is_alive: impl Fn(&str) -> bool) -> bool {
    match owner {
        None => true,
        Some(owner) if owner == claimant => true,
        Some(owner) => !is_alive(owner),
    }
}
