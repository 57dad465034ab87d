//! Reconciliation pipeline
//!
//! One pass mirrors one source object into the destination cluster:
//! resolve identity, decode, fetch, rate-limit, match, mutate, sanitize,
//! patch, arbitrate ownership, apply, sync status, ensure the reverse watch.
//! Every stage re-reads what it needs, so a pass that fails half way is
//! safe to run again from the top.

use std::sync::Arc;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::DynamicObject;
use kube::ResourceExt;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use crate::clusters::{AliveClusters, ClusterRegistry};
use crate::controller::ReverseWatch;
use crate::events::{EventPublisher, NoopEventPublisher, SyncEvent};
use crate::sync::{
    sanitize, JsonPatchOverlay, ManagedObject, MutationSet, ObjectKey, OverlayApplier,
    OwnershipPolicy, RateLimiter, ReconcileRequest, RuleMatcher, ORIGINAL_GVK_ANNOTATION,
    OWNERSHIP_ANNOTATION,
};
use crate::transport::ClusterApi;
use crate::Error;

/// How a pass ended when it did not fail
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Destination object written
    Synced {
        /// True when the object was created rather than replaced
        created: bool,
    },
    /// Source object is gone; destination copy deleted (or already absent)
    Removed,
    /// Over the per-key budget; nothing written
    RateLimited,
    /// No rule matched; nothing written
    NoMatch,
    /// Ownership arbitration refused the write
    OwnershipSkipped,
    /// Create raced with an existing object; run the pass again
    Requeue,
}

/// Shared state for all passes of one sync controller
///
/// Use [`SyncContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = SyncContext::builder(cluster_id, source, destination, matcher)
///     .rule(rule.object_ref(&()))
///     .rate_limiter(limiter)
///     .build();
/// ```
pub struct SyncContext {
    /// Governing rule, target of emitted events
    pub rule: ObjectReference,
    /// Identity written into empty ownership markers
    pub claimant: String,
    /// Cluster objects are read from
    pub source: Arc<dyn ClusterApi>,
    /// Cluster objects are written to
    pub destination: Arc<dyn ClusterApi>,
    /// Rule engine
    pub matcher: Arc<dyn RuleMatcher>,
    /// Cluster liveness
    pub clusters: Arc<dyn ClusterRegistry>,
    /// Overlay patch applier
    pub overlay: Arc<dyn OverlayApplier>,
    /// Optional per-key rate limiter
    pub rate_limiter: Option<Arc<dyn RateLimiter>>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Reverse watch registry for written kinds
    pub reverse_watch: Option<Arc<dyn ReverseWatch>>,
    local_cluster_id: OnceCell<String>,
}

impl SyncContext {
    /// Create a builder for constructing a SyncContext
    pub fn builder(
        claimant: impl Into<String>,
        source: Arc<dyn ClusterApi>,
        destination: Arc<dyn ClusterApi>,
        matcher: Arc<dyn RuleMatcher>,
    ) -> SyncContextBuilder {
        SyncContextBuilder::new(claimant.into(), source, destination, matcher)
    }

    /// Identity of the destination cluster, resolved on first use
    pub async fn local_cluster_id(&self) -> Result<&str, Error> {
        self.local_cluster_id
            .get_or_try_init(|| async {
                let id = self.destination.cluster_id().await?;
                if id.is_empty() {
                    return Err(Error::cluster_identity("destination reported an empty cluster id"));
                }
                info!(local_cluster_id = %id, "resolved local cluster id");
                Ok(id)
            })
            .await
            .map(String::as_str)
    }

    fn rule_name(&self) -> &str {
        self.rule.name.as_deref().unwrap_or_default()
    }
}

/// Builder for [`SyncContext`]
pub struct SyncContextBuilder {
    claimant: String,
    source: Arc<dyn ClusterApi>,
    destination: Arc<dyn ClusterApi>,
    matcher: Arc<dyn RuleMatcher>,
    rule: ObjectReference,
    clusters: Option<Arc<dyn ClusterRegistry>>,
    overlay: Option<Arc<dyn OverlayApplier>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    events: Option<Arc<dyn EventPublisher>>,
    reverse_watch: Option<Arc<dyn ReverseWatch>>,
}

impl SyncContextBuilder {
    fn new(
        claimant: String,
        source: Arc<dyn ClusterApi>,
        destination: Arc<dyn ClusterApi>,
        matcher: Arc<dyn RuleMatcher>,
    ) -> Self {
        Self {
            claimant,
            source,
            destination,
            matcher,
            rule: ObjectReference::default(),
            clusters: None,
            overlay: None,
            rate_limiter: None,
            events: None,
            reverse_watch: None,
        }
    }

    /// Destination cluster the context will write to
    pub fn destination(&self) -> Arc<dyn ClusterApi> {
        Arc::clone(&self.destination)
    }

    /// Set the governing rule reference
    pub fn rule(mut self, rule: ObjectReference) -> Self {
        self.rule = rule;
        self
    }

    /// Set the cluster registry (defaults to an empty liveness set)
    pub fn clusters(mut self, clusters: Arc<dyn ClusterRegistry>) -> Self {
        self.clusters = Some(clusters);
        self
    }

    /// Override the overlay applier
    pub fn overlay(mut self, overlay: Arc<dyn OverlayApplier>) -> Self {
        self.overlay = Some(overlay);
        self
    }

    /// Enable per-key rate limiting
    pub fn rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Set the event publisher (defaults to no-op)
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set the reverse watch registry
    pub fn reverse_watch(mut self, reverse_watch: Arc<dyn ReverseWatch>) -> Self {
        self.reverse_watch = Some(reverse_watch);
        self
    }

    /// Build the SyncContext
    pub fn build(self) -> SyncContext {
        SyncContext {
            rule: self.rule,
            claimant: self.claimant,
            source: self.source,
            destination: self.destination,
            matcher: self.matcher,
            clusters: self
                .clusters
                .unwrap_or_else(|| Arc::new(AliveClusters::new())),
            overlay: self.overlay.unwrap_or_else(|| Arc::new(JsonPatchOverlay)),
            rate_limiter: self.rate_limiter,
            events: self.events.unwrap_or_else(|| Arc::new(NoopEventPublisher)),
            reverse_watch: self.reverse_watch,
            local_cluster_id: OnceCell::new(),
        }
    }
}

/// Run one pipeline pass for a request
///
/// Benign endings (source gone, rate limited, no match, ownership refusal,
/// create race) are returned as a [`SyncOutcome`]. Errors carry the request
/// key and stage; [`Error::is_retryable`] decides whether to requeue.
#[instrument(skip(req, ctx), fields(request = %req, rule = %ctx.rule_name()))]
pub async fn reconcile(req: &ReconcileRequest, ctx: &SyncContext) -> Result<SyncOutcome, Error> {
    let request = req.to_string();
    let stage = |name: &'static str| {
        let request = request.clone();
        move |e: Error| e.at_stage(request, name)
    };

    let local_cluster_id = ctx.local_cluster_id().await.map_err(stage("identity"))?;
    let key = req.object_key().map_err(stage("decode"))?;

    debug!("reconciling");
    let source = ctx.source.get(&key).await.map_err(stage("fetch"))?;
    let Some(source) = source else {
        return remove_destination(&key, ctx).await.map_err(stage("delete"));
    };
    let source = source.with_gvk(&key.gvk);

    if is_rate_limited(req, ctx).await.map_err(stage("ratelimit"))? {
        return Ok(SyncOutcome::RateLimited);
    }

    let Some(mutations) = ctx.matcher.match_object(&source).map_err(stage("match"))? else {
        debug!("no rule matched");
        return Ok(SyncOutcome::NoMatch);
    };

    let mut desired = mutate(source, &mutations, &ctx.claimant);
    sanitize(&mut desired);
    let desired = apply_overlays(desired, &mutations, ctx.overlay.as_ref()).map_err(stage("patch"))?;

    let alive = ctx.clusters.alive_clusters();
    let policy = OwnershipPolicy::new(&ctx.claimant, local_cluster_id, &alive);
    let outcome = apply(&desired, &policy, ctx).await.map_err(stage("apply"))?;
    if !matches!(outcome, SyncOutcome::Synced { .. }) {
        return Ok(outcome);
    }
    info!(?outcome, "object reconciled");

    if ctx.rule.uid.is_some() {
        let event = SyncEvent::Reconciled {
            request: req.to_string(),
        };
        ctx.events.publish(&ctx.rule, event).await;
    }

    if mutations.sync_status {
        sync_status(&desired, ctx).await.map_err(stage("status"))?;
    }

    if let (Some(reverse_watch), Some(gvk)) = (&ctx.reverse_watch, desired.gvk()) {
        reverse_watch.ensure_watch(&gvk);
    }

    Ok(outcome)
}

/// Delete the destination copy of a vanished source object
async fn remove_destination(key: &ObjectKey, ctx: &SyncContext) -> Result<SyncOutcome, Error> {
    let target = match ctx.matcher.remapped_gvk(&key.gvk) {
        Some(gvk) => key.with_gvk(gvk),
        None => key.clone(),
    };

    info!(target = %target, "source object was removed, deleting destination copy");
    match ctx.destination.delete(&target).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => debug!(target = %target, "destination copy already absent"),
        Err(e) => return Err(e),
    }
    Ok(SyncOutcome::Removed)
}

async fn is_rate_limited(req: &ReconcileRequest, ctx: &SyncContext) -> Result<bool, Error> {
    let Some(limiter) = &ctx.rate_limiter else {
        return Ok(false);
    };

    let key = format!("{}/{req}", ctx.rule_name());
    let result = limiter.rate_limit(&key, 1)?;
    if !result.limited {
        return Ok(false);
    }

    let retry_after = result.retry_after.unwrap_or(result.reset_after);
    warn!(?retry_after, limit = result.limit, "ratelimited, too frequent reconciles for this object");
    let event = SyncEvent::RateLimited {
        request: req.to_string(),
        retry_after,
    };
    ctx.events.publish(&ctx.rule, event).await;
    Ok(true)
}

/// Apply metadata mutations, claim an unclaimed object, and remap its kind
fn mutate(mut obj: DynamicObject, mutations: &MutationSet, claimant: &str) -> DynamicObject {
    let original_gvk = obj.gvk();

    let annotations = obj.annotations_mut();
    mutations.annotations.apply_to(annotations);
    if annotations
        .get(OWNERSHIP_ANNOTATION)
        .is_none_or(|owner| owner.is_empty())
    {
        annotations.insert(OWNERSHIP_ANNOTATION.to_string(), claimant.to_string());
    }

    mutations.labels.apply_to(obj.labels_mut());

    if let Some(current) = original_gvk {
        if let Some(target) = mutations.mutated_gvk(&current) {
            obj.annotations_mut()
                .insert(ORIGINAL_GVK_ANNOTATION.to_string(), current.to_string());
            obj.set_gvk(target);
        }
    }
    obj
}

/// Run overlays and turn the result back into a generic object
fn apply_overlays(
    obj: DynamicObject,
    mutations: &MutationSet,
    overlay: &dyn OverlayApplier,
) -> Result<DynamicObject, Error> {
    if mutations.overrides.is_empty() {
        return Ok(obj);
    }
    let gvk = obj
        .gvk()
        .ok_or_else(|| Error::invalid_object("object has no apiVersion/kind"))?;

    let patched = overlay.apply_overlay(&obj, &gvk, &mutations.overrides)?;
    let patched: DynamicObject = serde_json::from_value(patched)
        .map_err(|e| Error::invalid_object(format!("patched {gvk} is not an object: {e}")))?;
    ObjectKey::of(&patched)?;
    Ok(patched)
}

/// Create or replace the destination object as ownership allows
async fn apply(
    desired: &DynamicObject,
    policy: &OwnershipPolicy<'_>,
    ctx: &SyncContext,
) -> Result<SyncOutcome, Error> {
    let key = ObjectKey::of(desired)?;

    let Some(current) = ctx.destination.get(&key).await? else {
        if !policy.should_create(desired) {
            info!(target = %key, "object originates in the destination cluster, not creating");
            return Ok(SyncOutcome::OwnershipSkipped);
        }
        return match ctx.destination.create(desired).await {
            Ok(_) => Ok(SyncOutcome::Synced { created: true }),
            Err(e) if e.is_already_exists() => {
                info!(target = %key, "object already exists, requeue");
                Ok(SyncOutcome::Requeue)
            }
            Err(e) => Err(e),
        };
    };

    if !policy.should_update(&current) {
        info!(
            target = %key,
            owner = current.owner_cluster().unwrap_or_default(),
            "object is claimed by another live cluster, skipping"
        );
        return Ok(SyncOutcome::OwnershipSkipped);
    }

    let mut update = desired.clone();
    update.metadata.resource_version = current.resource_version();
    ctx.destination.replace(&update).await?;
    Ok(SyncOutcome::Synced { created: false })
}

/// Push the desired status onto the freshly written destination object
async fn sync_status(desired: &DynamicObject, ctx: &SyncContext) -> Result<(), Error> {
    let key = ObjectKey::of(desired)?;
    let current = ctx
        .destination
        .get(&key)
        .await?
        .ok_or_else(|| Error::not_found(key.gvk.to_string(), key.namespaced_name()))?;

    let mut snapshot = desired.clone();
    snapshot.metadata.resource_version = current.resource_version();
    ctx.destination.update_status(&snapshot).await?;
    debug!(target = %key, "status synced");
    Ok(())
}
