//! Sync building blocks
//!
//! Pure pieces the reconciliation pipeline is assembled from: the request
//! codec, generic object accessors, ownership arbitration, the metadata
//! sanitizer, and the rule engine, overlay and rate-limit capabilities.

pub mod key;
mod object;
mod overlay;
mod ownership;
mod ratelimit;
mod rule;
mod sanitize;

pub use key::ReconcileRequest;
pub use object::{
    ManagedObject, ObjectKey, LAST_APPLIED_ANNOTATIONS, ORIGINAL_GVK_ANNOTATION,
    OWNERSHIP_ANNOTATION,
};
pub use overlay::{JsonPatchOverlay, OverlayApplier};
pub use ownership::{may_create, may_update, OwnershipPolicy};
pub use ratelimit::{RateLimitResult, RateLimiter, WindowRateLimiter};
pub use rule::{MutationSet, RuleMatcher, SyncRuleMatcher};
pub use sanitize::sanitize;

#[cfg(test)]
pub use overlay::MockOverlayApplier;
#[cfg(test)]
pub use ratelimit::MockRateLimiter;
#[cfg(test)]
pub use rule::MockRuleMatcher;
