//! Metadata sanitizer
//!
//! Strips fields that only make sense in the cluster an object was read
//! from, so the same source object always produces the same write.

use kube::api::DynamicObject;

use crate::sync::LAST_APPLIED_ANNOTATIONS;

/// Remove server-populated bookkeeping and last-applied markers in place.
///
/// Idempotent: sanitizing a sanitized object changes nothing.
pub fn sanitize(obj: &mut DynamicObject) {
    let meta = &mut obj.metadata;
    meta.uid = None;
    meta.resource_version = None;
    meta.generation = None;
    meta.creation_timestamp = None;
    meta.deletion_timestamp = None;
    meta.deletion_grace_period_seconds = None;
    meta.finalizers = None;
    meta.managed_fields = None;
    meta.self_link = None;

    if let Some(annotations) = meta.annotations.as_mut() {
        for key in LAST_APPLIED_ANNOTATIONS {
            annotations.remove(key);
        }
    }
}
