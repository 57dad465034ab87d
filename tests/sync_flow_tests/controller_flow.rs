//! A running SyncController wired to in-memory clusters

use std::sync::Arc;
use std::time::Duration;

use cluster_sync::config::SyncConfig;
use cluster_sync::controller::{SyncContext, SyncController};
use cluster_sync::sync::ManagedObject;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::*;

struct Running {
    source: Arc<FakeCluster>,
    destination: Arc<FakeCluster>,
    controller: Option<SyncController>,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Running {
    fn new() -> Self {
        let source = FakeCluster::new(REMOTE_ID);
        let destination = FakeCluster::new(LOCAL_ID);
        let shutdown = CancellationToken::new();
        let ctx = SyncContext::builder(
            REMOTE_ID,
            source.clone(),
            destination.clone(),
            Arc::new(default_namespace_rule()),
        );
        let config = SyncConfig::default().with_workers(2);
        let controller = SyncController::new(ctx, config, shutdown.clone());
        Self {
            source,
            destination,
            controller: Some(controller),
            shutdown,
            handle: None,
        }
    }

    fn start(&mut self) {
        if let Some(controller) = self.controller.take() {
            self.handle = Some(tokio::spawn(controller.run()));
        }
    }

    async fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .expect("controller stops after cancellation")
                .expect("controller task does not panic");
        }
    }

    async fn wait_for_copy(&self, name: &str) {
        let destination = self.destination.clone();
        let key = key("default", name);
        eventually(&format!("copy of {name}"), || {
            let found = destination.object(&key).is_some();
            async move { found }
        })
        .await;
    }
}

/// Story: existing and new source objects are mirrored, deletions follow
#[tokio::test]
async fn story_controller_mirrors_source_changes() {
    let mut running = Running::new();
    running.source.seed(configmap("default", "cfg"));
    running.start();

    running.wait_for_copy("cfg").await;
    let copy = running.destination.object(&key("default", "cfg")).unwrap();
    assert_eq!(copy.owner_cluster(), Some(REMOTE_ID));
    assert_eq!(copy.metadata.finalizers, None);

    running.source.create(&configmap("default", "late")).await.unwrap();
    running.wait_for_copy("late").await;

    running.source.remove(&key("default", "cfg"));
    let destination = running.destination.clone();
    eventually("copy of cfg to be deleted", || {
        let gone = destination.object(&key("default", "cfg")).is_none();
        async move { gone }
    })
    .await;

    running.stop().await;
}

/// Story: writing a kind starts exactly one reverse watch on the destination
#[tokio::test]
async fn story_reverse_watch_is_registered_once() {
    let mut running = Running::new();
    let informers = running.controller.as_ref().unwrap().informers();
    running.source.seed(configmap("default", "cfg"));
    running.source.seed(configmap("default", "other"));
    running.start();

    running.wait_for_copy("cfg").await;
    running.wait_for_copy("other").await;

    assert!(informers.is_watching(&configmap_gvk()));
    assert_eq!(informers.watched_kinds(), vec![configmap_gvk()]);
    assert_eq!(running.destination.watched_kinds(), vec![configmap_gvk()]);

    running.stop().await;
}

/// Story: edits to the copy in the destination are reverted from the source
#[tokio::test]
async fn story_tampered_copy_is_repaired() {
    let mut running = Running::new();
    running.source.seed(configmap("default", "cfg"));
    running.start();
    running.wait_for_copy("cfg").await;

    let destination = running.destination.clone();
    let informers_ready = destination.clone();
    eventually("reverse watch", || {
        let ready = !informers_ready.watched_kinds().is_empty();
        async move { ready }
    })
    .await;

    let mut tampered = destination.object(&key("default", "cfg")).unwrap();
    tampered.data = serde_json::json!({ "data": { "greeting": "tampered" } });
    destination.replace(&tampered).await.unwrap();

    eventually("copy to be repaired", || {
        let repaired = destination
            .object(&key("default", "cfg"))
            .is_some_and(|obj| obj.data["data"]["greeting"] == "hello");
        async move { repaired }
    })
    .await;

    destination.delete(&key("default", "cfg")).await.unwrap();
    running.wait_for_copy("cfg").await;

    running.stop().await;
}

/// Story: a manual trigger syncs an object no watch reported
#[tokio::test]
async fn story_manual_trigger_syncs_quiet_object() {
    let mut running = Running::new();
    let trigger = running.controller.as_ref().unwrap().trigger();
    running.start();

    running.source.seed(configmap("default", "quiet"));
    trigger
        .trigger_object(&configmap_gvk(), Some("default".to_string()), "quiet")
        .unwrap();
    running.wait_for_copy("quiet").await;

    running.stop().await;
}

/// Story: a source watch closed by the server is reopened and keeps syncing
#[tokio::test]
async fn story_closed_source_watch_is_reopened() {
    let mut running = Running::new();
    running.source.seed(configmap("default", "cfg"));
    running.start();
    running.wait_for_copy("cfg").await;

    let source = running.source.clone();
    let before = source.watched_kinds().len();
    source.restart_watches();
    eventually("source watch to be reopened", || {
        let reopened = source.watched_kinds().len() > before;
        async move { reopened }
    })
    .await;

    source.create(&configmap("default", "late")).await.unwrap();
    running.wait_for_copy("late").await;

    running.stop().await;
}

/// Story: a copy whose source was deleted is removed even if the source
/// object never reached the controller through the watch
#[tokio::test]
async fn story_triggered_orphan_copy_is_removed() {
    let mut running = Running::new();
    let trigger = running.controller.as_ref().unwrap().trigger();
    let requests = running.controller.as_ref().unwrap().requests();
    running.start();

    running.source.seed(configmap("default", "quiet"));
    trigger
        .trigger_object(&configmap_gvk(), Some("default".to_string()), "quiet")
        .unwrap();
    running.wait_for_copy("quiet").await;

    // Source removed without an event; a second trigger cleans up the copy
    running.source.seed_removal(&key("default", "quiet"));
    trigger
        .trigger_object(&configmap_gvk(), Some("default".to_string()), "quiet")
        .unwrap();
    let destination = running.destination.clone();
    eventually("orphaned copy to be deleted", || {
        let gone = destination.object(&key("default", "quiet")).is_none();
        async move { gone }
    })
    .await;
    eventually("request entry to be evicted", || {
        let evicted = requests.get(Some("default"), "quiet").is_none();
        async move { evicted }
    })
    .await;

    running.stop().await;
}

/// Story: triggers fail once the controller has stopped
#[tokio::test]
async fn story_trigger_after_shutdown_fails() {
    let mut running = Running::new();
    let trigger = running.controller.as_ref().unwrap().trigger();
    running.start();
    running.stop().await;

    assert!(trigger
        .trigger_object(&configmap_gvk(), Some("default".to_string()), "cfg")
        .is_err());
}
