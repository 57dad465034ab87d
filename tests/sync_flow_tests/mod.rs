//! Shared fixtures for the sync flow tests

mod controller_flow;
mod pipeline_flow;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{DynamicObject, ObjectMeta, TypeMeta};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use cluster_sync::crd::{GroupVersionKind, ResourceSyncRuleSpec};
use cluster_sync::sync::{ManagedObject, ObjectKey, SyncRuleMatcher};
use cluster_sync::transport::{ClusterApi, ObjectEvent, ObjectEventStream};
use cluster_sync::Error;

pub const REMOTE_ID: &str = "remote-cluster";
pub const LOCAL_ID: &str = "local-cluster";

pub fn configmap_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("", "v1", "ConfigMap")
}

/// In-memory cluster with API-server-like create/replace/delete semantics
///
/// Writes assign a fresh uid and bump the resource version; a replace that
/// changes nothing emits no watch event.
pub struct FakeCluster {
    id: String,
    objects: Mutex<HashMap<ObjectKey, DynamicObject>>,
    events: Mutex<broadcast::Sender<ObjectEvent>>,
    revision: AtomicU64,
    watched: Mutex<Vec<GroupVersionKind>>,
}

impl FakeCluster {
    pub fn new(id: &str) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            id: id.to_string(),
            objects: Mutex::new(HashMap::new()),
            events: Mutex::new(events),
            revision: AtomicU64::new(1),
            watched: Mutex::new(Vec::new()),
        })
    }

    /// Store an object without emitting a watch event
    pub fn seed(&self, mut obj: DynamicObject) {
        let key = ObjectKey::of(&obj).expect("seeded objects need kind and name");
        obj.metadata.resource_version = Some(self.next_revision());
        self.objects.lock().insert(key, obj);
    }

    /// Drop an object without emitting a watch event
    pub fn seed_removal(&self, key: &ObjectKey) {
        self.objects.lock().remove(key);
    }

    /// Remove an object the way a user would, emitting `Deleted`
    pub fn remove(&self, key: &ObjectKey) {
        if let Some(obj) = self.objects.lock().remove(key) {
            let _ = self.events.lock().send(ObjectEvent::Deleted(obj));
        }
    }

    /// End every open watch stream, as an API server does on timeout
    pub fn restart_watches(&self) {
        let (events, _) = broadcast::channel(256);
        *self.events.lock() = events;
    }

    pub fn object(&self, key: &ObjectKey) -> Option<DynamicObject> {
        self.objects.lock().get(key).cloned()
    }

    pub fn watched_kinds(&self) -> Vec<GroupVersionKind> {
        self.watched.lock().clone()
    }

    fn next_revision(&self) -> String {
        self.revision.fetch_add(1, Ordering::SeqCst).to_string()
    }
}

fn same_content(a: &DynamicObject, b: &DynamicObject) -> bool {
    a.data == b.data
        && a.metadata.labels == b.metadata.labels
        && a.metadata.annotations == b.metadata.annotations
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn cluster_id(&self) -> Result<String, Error> {
        Ok(self.id.clone())
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, Error> {
        Ok(self.object(key))
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, Error> {
        let key = ObjectKey::of(obj)?;
        let mut objects = self.objects.lock();
        if objects.contains_key(&key) {
            return Err(Error::already_exists(key.gvk.to_string(), key.namespaced_name()));
        }
        let mut created = obj.clone();
        created.metadata.uid = Some(format!("{}-uid-{}", self.id, self.next_revision()));
        created.metadata.resource_version = Some(self.next_revision());
        objects.insert(key, created.clone());
        let _ = self.events.lock().send(ObjectEvent::Added(created.clone()));
        Ok(created)
    }

    async fn replace(&self, obj: &DynamicObject) -> Result<DynamicObject, Error> {
        let key = ObjectKey::of(obj)?;
        let mut objects = self.objects.lock();
        let Some(current) = objects.get(&key).cloned() else {
            return Err(Error::not_found(key.gvk.to_string(), key.namespaced_name()));
        };
        if obj.metadata.resource_version != current.metadata.resource_version {
            return Err(Error::internal_with_context("replace", "resource version conflict"));
        }
        if same_content(&current, obj) {
            return Ok(current);
        }
        let mut replaced = obj.clone();
        replaced.metadata.uid = current.metadata.uid.clone();
        replaced.metadata.resource_version = Some(self.next_revision());
        objects.insert(key, replaced.clone());
        let _ = self.events.lock().send(ObjectEvent::Modified(replaced.clone()));
        Ok(replaced)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), Error> {
        let removed = self.objects.lock().remove(key);
        match removed {
            Some(obj) => {
                let _ = self.events.lock().send(ObjectEvent::Deleted(obj));
                Ok(())
            }
            None => Err(Error::not_found(key.gvk.to_string(), key.namespaced_name())),
        }
    }

    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject, Error> {
        let key = ObjectKey::of(obj)?;
        let mut objects = self.objects.lock();
        let Some(current) = objects.get_mut(&key) else {
            return Err(Error::not_found(key.gvk.to_string(), key.namespaced_name()));
        };
        if let Some(status) = obj.data.get("status") {
            current.data["status"] = status.clone();
            current.metadata.resource_version = Some(self.next_revision());
        }
        Ok(current.clone())
    }

    fn watch(&self, gvk: &GroupVersionKind) -> ObjectEventStream {
        self.watched.lock().push(gvk.clone());

        let receiver = self.events.lock().subscribe();
        let initial: Vec<_> = self
            .objects
            .lock()
            .values()
            .filter(|obj| obj.gvk().as_ref() == Some(gvk))
            .cloned()
            .map(|obj| Ok(ObjectEvent::Added(obj)))
            .collect();

        let wanted = gvk.clone();
        let live = BroadcastStream::new(receiver).filter_map(move |event| {
            let out = match event {
                Ok(event) if event.object().gvk().as_ref() == Some(&wanted) => Some(Ok(event)),
                _ => None,
            };
            futures::future::ready(out)
        });
        futures::stream::iter(initial).chain(live).boxed()
    }
}

pub fn configmap(namespace: &str, name: &str) -> DynamicObject {
    DynamicObject {
        types: Some(TypeMeta {
            api_version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
        }),
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("{REMOTE_ID}-{name}")),
            finalizers: Some(vec!["example.com/protect".to_string()]),
            annotations: Some(BTreeMap::from([(
                "kubectl.kubernetes.io/last-applied-configuration".to_string(),
                "{}".to_string(),
            )])),
            ..Default::default()
        },
        data: serde_json::json!({ "data": { "greeting": "hello" } }),
    }
}

pub fn key(namespace: &str, name: &str) -> ObjectKey {
    ObjectKey::new(configmap_gvk(), Some(namespace.to_string()), name)
}

/// ConfigMaps in `default`, labelled `synced=true` on the way in
pub fn default_namespace_rule() -> SyncRuleMatcher {
    let spec: ResourceSyncRuleSpec = serde_yaml::from_str(
        r#"
groupVersionKind:
  version: v1
  kind: ConfigMap
rules:
  - matches:
      - namespaces: [default]
    mutations:
      labels:
        add:
          synced: "true"
"#,
    )
    .expect("rule parses");
    SyncRuleMatcher::new(spec).expect("rule is valid")
}

/// Poll until `check` holds or two seconds pass
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
