//! Local informer registry
//!
//! Reverse watches on the destination cluster, one per kind, created the
//! first time the pipeline writes an object of that kind. Updates and
//! deletes of objects this crate manages are fed back into the controller
//! so that local edits are overwritten and local deletes are re-created.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use kube::ResourceExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::GroupVersionKind;
use crate::retry::RetryConfig;
use crate::sync::{ManagedObject, ReconcileRequest};
use crate::transport::{watch_forever, ClusterApi, ObjectEvent, ObjectEventStream};

/// Establishes reverse watches on demand
#[cfg_attr(test, automock)]
pub trait ReverseWatch: Send + Sync {
    /// Ensure a reverse watch for `gvk` exists; true when this call started it
    fn ensure_watch(&self, gvk: &GroupVersionKind) -> bool;
}

/// Map a destination-cluster event to the request that re-syncs its source.
///
/// Creates are ignored, as are objects without an ownership marker. The key
/// uses the pre-remap kind when the object was remapped.
pub fn reverse_request(event: &ObjectEvent) -> Option<ReconcileRequest> {
    let obj = match event {
        ObjectEvent::Added(_) => return None,
        ObjectEvent::Modified(obj) | ObjectEvent::Deleted(obj) => obj,
    };
    if !obj.has_ownership_marker() {
        return None;
    }
    let gvk = obj.original_gvk().or_else(|| obj.gvk())?;
    let name = obj.metadata.name.as_deref()?;
    Some(ReconcileRequest::new(&gvk, obj.namespace(), name))
}

/// Registry of reverse watches, keyed by kind
///
/// Grows monotonically. A watch whose stream ends is reopened with backoff,
/// so a registered kind stays watched until the registry's shutdown token
/// is cancelled.
pub struct LocalInformerRegistry {
    destination: Arc<dyn ClusterApi>,
    sink: mpsc::UnboundedSender<ReconcileRequest>,
    watches: DashMap<GroupVersionKind, CancellationToken>,
    backoff: RetryConfig,
    shutdown: CancellationToken,
}

impl LocalInformerRegistry {
    /// Create a registry that enqueues into `sink`
    pub fn new(
        destination: Arc<dyn ClusterApi>,
        sink: mpsc::UnboundedSender<ReconcileRequest>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            destination,
            sink,
            watches: DashMap::new(),
            backoff: RetryConfig::default(),
            shutdown,
        }
    }

    /// Backoff between reopened watches
    pub fn with_backoff(mut self, backoff: RetryConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Kinds with an established reverse watch
    pub fn watched_kinds(&self) -> Vec<GroupVersionKind> {
        self.watches.iter().map(|e| e.key().clone()).collect()
    }

    /// Whether a reverse watch exists for `gvk`
    pub fn is_watching(&self, gvk: &GroupVersionKind) -> bool {
        self.watches.contains_key(gvk)
    }
}

impl ReverseWatch for LocalInformerRegistry {
    fn ensure_watch(&self, gvk: &GroupVersionKind) -> bool {
        // The entry guard holds the shard lock until the watch is registered.
        match self.watches.entry(gvk.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let token = self.shutdown.child_token();
                let stream = watch_forever(
                    Arc::clone(&self.destination),
                    gvk.clone(),
                    self.backoff.clone(),
                );
                tokio::spawn(run_reverse_watch(
                    gvk.clone(),
                    stream,
                    self.sink.clone(),
                    token.clone(),
                ));
                slot.insert(token);
                info!(gvk = %gvk, "started local informer");
                true
            }
        }
    }
}

async fn run_reverse_watch(
    gvk: GroupVersionKind,
    mut stream: ObjectEventStream,
    sink: mpsc::UnboundedSender<ReconcileRequest>,
    token: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(event)) => {
                let Some(request) = reverse_request(&event) else {
                    continue;
                };
                debug!(gvk = %gvk, request = %request, "local change, enqueueing");
                if sink.send(request).is_err() {
                    break;
                }
            }
            Some(Err(e)) => warn!(gvk = %gvk, error = %e, "local watch error"),
            None => break,
        }
    }
    debug!(gvk = %gvk, "local informer stopped");
}
