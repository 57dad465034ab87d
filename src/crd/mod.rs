//! Custom Resource Definitions for cluster-sync
//!
//! This module contains the ResourceSyncRule CRD and the shared types its
//! spec is built from.

mod sync_rule;
mod types;

pub use sync_rule::{Mutations, ResourceSyncRule, ResourceSyncRuleSpec, SyncRule, SyncRuleMatch};
pub use types::{
    GroupVersionKind, KeyValueMutations, ObjectKeyMatch, ObjectSelector, OverlayPatch,
    OverlayPatchType, SelectorOperator, SelectorRequirement,
};
