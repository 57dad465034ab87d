//! Sync controller
//!
//! The reconciliation pipeline plus the machinery that drives it: lazily
//! created reverse watches on the destination cluster, the request store
//! the kube-runtime controller schedules from, and the runner that joins
//! the three request sources into one controller per rule.

mod informer;
mod reconciler;
mod runner;
mod store;

pub use informer::{reverse_request, LocalInformerRegistry, ReverseWatch};
pub use reconciler::{reconcile, SyncContext, SyncContextBuilder, SyncOutcome};
pub use runner::{forward_object, SyncController, Trigger};
pub use store::RequestStore;

#[cfg(test)]
pub use informer::MockReverseWatch;
