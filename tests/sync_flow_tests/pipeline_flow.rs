//! Single reconcile passes against in-memory clusters

use std::sync::Arc;

use cluster_sync::clusters::{AliveClusters, ClusterInfo};
use cluster_sync::controller::{reconcile, SyncContext, SyncOutcome};
use cluster_sync::sync::{ManagedObject, ReconcileRequest, OWNERSHIP_ANNOTATION};
use kube::ResourceExt;

use super::*;

fn context(source: &Arc<FakeCluster>, destination: &Arc<FakeCluster>) -> SyncContext {
    let clusters = Arc::new(AliveClusters::new());
    clusters.mark_alive(REMOTE_ID, ClusterInfo::new("remote"));
    clusters.mark_alive("other-cluster", ClusterInfo::new("other"));

    SyncContext::builder(
        REMOTE_ID,
        source.clone(),
        destination.clone(),
        Arc::new(default_namespace_rule()),
    )
    .clusters(clusters)
    .build()
}

fn request(namespace: &str, name: &str) -> ReconcileRequest {
    ReconcileRequest::new(&configmap_gvk(), Some(namespace.to_string()), name)
}

fn claimed_by(owner: &str) -> DynamicObject {
    let mut obj = configmap("default", "cfg");
    obj.annotations_mut()
        .insert(OWNERSHIP_ANNOTATION.to_string(), owner.to_string());
    obj
}

/// Story: an unclaimed source object lands in the destination claimed and clean
#[tokio::test]
async fn story_new_object_is_created_claimed_and_sanitized() {
    let source = FakeCluster::new(REMOTE_ID);
    let destination = FakeCluster::new(LOCAL_ID);
    source.seed(configmap("default", "cfg"));
    let ctx = context(&source, &destination);

    let outcome = reconcile(&request("default", "cfg"), &ctx).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Synced { created: true });

    let copy = destination.object(&key("default", "cfg")).unwrap();
    assert_eq!(copy.owner_cluster(), Some(REMOTE_ID));
    assert_eq!(copy.labels().get("synced").map(String::as_str), Some("true"));
    assert_ne!(copy.metadata.uid.as_deref(), Some("remote-cluster-cfg"));
    assert_eq!(copy.metadata.finalizers, None);
    assert!(!copy
        .annotations()
        .contains_key("kubectl.kubernetes.io/last-applied-configuration"));
    assert_eq!(copy.data["data"]["greeting"], "hello");
}

/// Story: a second pass over an unchanged object is a no-op update
#[tokio::test]
async fn story_repeated_pass_leaves_copy_unchanged() {
    let source = FakeCluster::new(REMOTE_ID);
    let destination = FakeCluster::new(LOCAL_ID);
    source.seed(configmap("default", "cfg"));
    let ctx = context(&source, &destination);

    reconcile(&request("default", "cfg"), &ctx).await.unwrap();
    let first = destination.object(&key("default", "cfg")).unwrap();

    let outcome = reconcile(&request("default", "cfg"), &ctx).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Synced { created: false });
    let second = destination.object(&key("default", "cfg")).unwrap();
    assert_eq!(first.metadata.resource_version, second.metadata.resource_version);
}

/// Story: deleting the source removes the copy, and removing twice is fine
#[tokio::test]
async fn story_source_deletion_removes_copy() {
    let source = FakeCluster::new(REMOTE_ID);
    let destination = FakeCluster::new(LOCAL_ID);
    source.seed(configmap("default", "cfg"));
    let ctx = context(&source, &destination);
    reconcile(&request("default", "cfg"), &ctx).await.unwrap();

    source.remove(&key("default", "cfg"));

    let outcome = reconcile(&request("default", "cfg"), &ctx).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Removed);
    assert!(destination.object(&key("default", "cfg")).is_none());

    let outcome = reconcile(&request("default", "cfg"), &ctx).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Removed);
}

/// Story: a copy claimed by another live cluster is left alone
#[tokio::test]
async fn story_live_owner_keeps_its_claim() {
    let source = FakeCluster::new(REMOTE_ID);
    let destination = FakeCluster::new(LOCAL_ID);
    source.seed(configmap("default", "cfg"));
    let mut theirs = claimed_by("other-cluster");
    theirs.data = serde_json::json!({ "data": { "greeting": "theirs" } });
    destination.seed(theirs);
    let ctx = context(&source, &destination);

    let outcome = reconcile(&request("default", "cfg"), &ctx).await.unwrap();
    assert_eq!(outcome, SyncOutcome::OwnershipSkipped);

    let copy = destination.object(&key("default", "cfg")).unwrap();
    assert_eq!(copy.owner_cluster(), Some("other-cluster"));
    assert_eq!(copy.data["data"]["greeting"], "theirs");
}

/// Story: a claim held by a cluster that is no longer alive is taken over
#[tokio::test]
async fn story_dead_owner_loses_its_claim() {
    let source = FakeCluster::new(REMOTE_ID);
    let destination = FakeCluster::new(LOCAL_ID);
    source.seed(configmap("default", "cfg"));
    destination.seed(claimed_by("departed-cluster"));
    let ctx = context(&source, &destination);

    let outcome = reconcile(&request("default", "cfg"), &ctx).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Synced { created: false });

    let copy = destination.object(&key("default", "cfg")).unwrap();
    assert_eq!(copy.owner_cluster(), Some(REMOTE_ID));
}

/// Story: an object that originated in the destination is not echoed back
#[tokio::test]
async fn story_object_from_destination_is_not_recreated() {
    let source = FakeCluster::new(REMOTE_ID);
    let destination = FakeCluster::new(LOCAL_ID);
    source.seed(claimed_by(LOCAL_ID));
    let ctx = context(&source, &destination);

    let outcome = reconcile(&request("default", "cfg"), &ctx).await.unwrap();
    assert_eq!(outcome, SyncOutcome::OwnershipSkipped);
    assert!(destination.object(&key("default", "cfg")).is_none());
}

/// Story: objects outside the rule's namespaces are never written
#[tokio::test]
async fn story_unmatched_object_is_skipped() {
    let source = FakeCluster::new(REMOTE_ID);
    let destination = FakeCluster::new(LOCAL_ID);
    source.seed(configmap("kube-public", "cfg"));
    let ctx = context(&source, &destination);

    let outcome = reconcile(&request("kube-public", "cfg"), &ctx).await.unwrap();
    assert_eq!(outcome, SyncOutcome::NoMatch);
    assert!(destination.object(&key("kube-public", "cfg")).is_none());
}

/// Story: a garbage request key fails without being retried
#[tokio::test]
async fn story_malformed_request_is_permanent() {
    let source = FakeCluster::new(REMOTE_ID);
    let destination = FakeCluster::new(LOCAL_ID);
    let ctx = context(&source, &destination);

    let err = reconcile(&ReconcileRequest::from_raw(None, "no-separator"), &ctx)
        .await
        .unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(err.stage(), Some("decode"));
}
