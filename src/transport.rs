//! Generic cluster access over arbitrary resource kinds
//!
//! The sync pipeline never touches typed Kubernetes structs. Every read,
//! write and watch goes through [`ClusterApi`] with `DynamicObject`s, so one
//! code path serves ConfigMaps, Deployments and CRDs alike.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryFutureExt};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::{ApiCapabilities, ApiResource, Scope};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Config, ResourceExt};
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::GroupVersionKind;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::sync::{ManagedObject, ObjectKey};
use crate::Error;

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "cluster-sync";

/// Namespace whose UID identifies a cluster
const CLUSTER_ID_NAMESPACE: &str = "kube-system";


/// A change observed on a watched kind
#[derive(Clone, Debug)]
pub enum ObjectEvent {
    /// Object seen for the first time by this watch
    Added(DynamicObject),
    /// Object changed
    Modified(DynamicObject),
    /// Object removed
    Deleted(DynamicObject),
}

impl ObjectEvent {
    /// The object the event is about
    pub fn object(&self) -> &DynamicObject {
        match self {
            ObjectEvent::Added(obj) | ObjectEvent::Modified(obj) | ObjectEvent::Deleted(obj) => {
                obj
            }
        }
    }

    /// Take the object out of the event
    pub fn into_object(self) -> DynamicObject {
        match self {
            ObjectEvent::Added(obj) | ObjectEvent::Modified(obj) | ObjectEvent::Deleted(obj) => {
                obj
            }
        }
    }
}

/// Stream of watch events for one kind
pub type ObjectEventStream = BoxStream<'static, Result<ObjectEvent, Error>>;

/// Cluster API transport: get/apply/delete/watch over any kind
///
/// Writes take the kind from the object's own `apiVersion`/`kind`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Stable identity of this cluster
    async fn cluster_id(&self) -> Result<String, Error>;

    /// Fetch an object; `Ok(None)` when it does not exist
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, Error>;

    /// Create an object; fails with `AlreadyExists` if it is already there
    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, Error>;

    /// Replace an object; `obj` must carry the current resource version
    async fn replace(&self, obj: &DynamicObject) -> Result<DynamicObject, Error>;

    /// Delete an object; fails with `NotFound` if it is already gone
    async fn delete(&self, key: &ObjectKey) -> Result<(), Error>;

    /// Write only the status of an object, guarded by its resource version
    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject, Error>;

    /// Watch every object of a kind across all namespaces
    fn watch(&self, gvk: &GroupVersionKind) -> ObjectEventStream;
}

/// Discovery cache shared between a transport and its watch streams.
#[derive(Clone)]
struct ResourceResolver {
    client: Client,
    cache: Arc<DashMap<GroupVersionKind, (ApiResource, ApiCapabilities)>>,
}

impl ResourceResolver {
    /// Resolve a kind through API discovery, caching hits.
    ///
    /// Misses are not cached and not guessed: a wrong plural would turn every
    /// GET into a 404, which the pipeline reads as "source deleted".
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, ApiCapabilities), Error> {
        if let Some(entry) = self.cache.get(gvk) {
            return Ok(entry.clone());
        }

        let resolved = kube::discovery::pinned_kind(&self.client, gvk)
            .await
            .map_err(|e| {
                Error::internal_with_context("discovery", format!("could not resolve {gvk}: {e}"))
            })?;

        debug!(gvk = %gvk, plural = %resolved.0.plural, "resolved resource kind");
        self.cache.insert(gvk.clone(), resolved.clone());
        Ok(resolved)
    }

    async fn api(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> Result<Api<DynamicObject>, Error> {
        let (ar, caps) = self.resolve(gvk).await?;
        let api = match (caps.scope, namespace) {
            (Scope::Namespaced, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        };
        Ok(api)
    }
}

/// [`ClusterApi`] backed by a kube-rs client
pub struct KubeClusterApi {
    resolver: ResourceResolver,
    watch_timeout_secs: u32,
}

impl KubeClusterApi {
    /// Wrap a client; watches are closed by the server after `watch_timeout_secs`
    pub fn new(client: Client, watch_timeout_secs: u32) -> Self {
        Self {
            resolver: ResourceResolver {
                client,
                cache: Arc::new(DashMap::new()),
            },
            watch_timeout_secs,
        }
    }

    fn client(&self) -> Client {
        self.resolver.client.clone()
    }
}

fn post_params() -> PostParams {
    PostParams {
        dry_run: false,
        field_manager: Some(FIELD_MANAGER.to_string()),
    }
}

/// Translate kube API failures into tagged not-found/already-exists errors.
fn tag_kube_error(err: kube::Error, gvk: &GroupVersionKind, name: &str) -> Error {
    match &err {
        kube::Error::Api(ae) if ae.code == 404 => Error::not_found(gvk.to_string(), name),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            Error::already_exists(gvk.to_string(), name)
        }
        _ => Error::Kube(err),
    }
}

fn identity(obj: &DynamicObject) -> String {
    obj.metadata
        .uid
        .clone()
        .unwrap_or_else(|| format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any()))
}

/// Turns raw watcher events into Added/Modified/Deleted.
///
/// After a desync the watcher re-lists (`Init`, `InitApply`.., `InitDone`)
/// and only reports objects that still exist. Anything seen before and
/// missing from the re-list was deleted while disconnected; it is reported
/// as `Deleted` once the re-list completes.
#[derive(Default)]
struct EventClassifier {
    seen: HashMap<String, DynamicObject>,
    relisted: Option<HashSet<String>>,
}

impl EventClassifier {
    fn classify(
        &mut self,
        gvk: &GroupVersionKind,
        event: watcher::Event<DynamicObject>,
    ) -> Vec<ObjectEvent> {
        match event {
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(obj) => {
                let obj = obj.with_gvk(gvk);
                if let Some(relisted) = self.relisted.as_mut() {
                    relisted.insert(identity(&obj));
                }
                vec![self.applied(obj)]
            }
            watcher::Event::Apply(obj) => vec![self.applied(obj.with_gvk(gvk))],
            watcher::Event::Delete(obj) => {
                let obj = obj.with_gvk(gvk);
                self.seen.remove(&identity(&obj));
                vec![ObjectEvent::Deleted(obj)]
            }
            watcher::Event::InitDone => {
                let Some(relisted) = self.relisted.take() else {
                    return Vec::new();
                };
                let gone: Vec<String> = self
                    .seen
                    .keys()
                    .filter(|id| !relisted.contains(*id))
                    .cloned()
                    .collect();
                if !gone.is_empty() {
                    info!(gvk = %gvk, count = gone.len(), "objects deleted while the watch was down");
                }
                gone.iter()
                    .filter_map(|id| self.seen.remove(id))
                    .map(ObjectEvent::Deleted)
                    .collect()
            }
        }
    }

    fn applied(&mut self, obj: DynamicObject) -> ObjectEvent {
        match self.seen.insert(identity(&obj), obj.clone()) {
            None => ObjectEvent::Added(obj),
            Some(_) => ObjectEvent::Modified(obj),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn cluster_id(&self) -> Result<String, Error> {
        let namespaces: Api<Namespace> = Api::all(self.client());
        let ns = namespaces
            .get(CLUSTER_ID_NAMESPACE)
            .await
            .map_err(|e| Error::cluster_identity(e.to_string()))?;
        ns.metadata
            .uid
            .filter(|uid| !uid.is_empty())
            .ok_or_else(|| Error::cluster_identity(format!("{CLUSTER_ID_NAMESPACE} has no uid")))
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, Error> {
        let api = self.resolver.api(&key.gvk, key.namespace.as_deref()).await?;
        let obj = api
            .get_opt(&key.name)
            .await
            .map_err(|e| tag_kube_error(e, &key.gvk, &key.name))?;
        Ok(obj.map(|o| o.with_gvk(&key.gvk)))
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, Error> {
        let key = ObjectKey::of(obj)?;
        let api = self.resolver.api(&key.gvk, key.namespace.as_deref()).await?;
        api.create(&post_params(), obj)
            .await
            .map_err(|e| tag_kube_error(e, &key.gvk, &key.name))
    }

    async fn replace(&self, obj: &DynamicObject) -> Result<DynamicObject, Error> {
        let key = ObjectKey::of(obj)?;
        let api = self.resolver.api(&key.gvk, key.namespace.as_deref()).await?;
        api.replace(&key.name, &post_params(), obj)
            .await
            .map_err(|e| tag_kube_error(e, &key.gvk, &key.name))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), Error> {
        let api = self.resolver.api(&key.gvk, key.namespace.as_deref()).await?;
        api.delete(&key.name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| tag_kube_error(e, &key.gvk, &key.name))
    }

    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject, Error> {
        let key = ObjectKey::of(obj)?;
        let Some(status) = obj.data.get("status") else {
            debug!(object = %key, "object has no status to write");
            return Ok(obj.clone());
        };

        let api = self.resolver.api(&key.gvk, key.namespace.as_deref()).await?;
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": obj.metadata.resource_version },
            "status": status,
        });
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.patch_status(&key.name, &params, &Patch::Merge(&patch))
            .await
            .map_err(|e| tag_kube_error(e, &key.gvk, &key.name))
    }

    fn watch(&self, gvk: &GroupVersionKind) -> ObjectEventStream {
        let resolver = self.resolver.clone();
        let gvk = gvk.clone();
        let config = watcher::Config::default().timeout(self.watch_timeout_secs);

        async move {
            // A kind that is not served yet (CRD still installing) is retried
            // here rather than ending the stream.
            let api = retry_with_backoff(&RetryConfig::default(), "resolve watched kind", || {
                resolver.api(&gvk, None)
            })
            .await?;
            info!(gvk = %gvk, "starting watch");
            let mut classifier = EventClassifier::default();
            let events = watcher(api, config)
                .default_backoff()
                .flat_map(move |event| {
                    let out: Vec<Result<ObjectEvent, Error>> = match event {
                        Ok(ev) => classifier.classify(&gvk, ev).into_iter().map(Ok).collect(),
                        Err(e) => vec![Err(Error::internal_with_context("watch", e.to_string()))],
                    };
                    stream::iter(out)
                });
            Ok::<_, Error>(events)
        }
        .try_flatten_stream()
        .boxed()
    }
}

/// Keep a watch on `gvk` open for as long as the stream is polled.
///
/// The first watch is opened immediately. Whenever the underlying stream
/// ends a new one is opened after a backoff
/// delay. The delay grows with consecutive empty restarts and resets once
/// a watch delivers an event.
pub fn watch_forever(
    cluster: Arc<dyn ClusterApi>,
    gvk: GroupVersionKind,
    backoff: RetryConfig,
) -> ObjectEventStream {
    struct State {
        cluster: Arc<dyn ClusterApi>,
        gvk: GroupVersionKind,
        backoff: RetryConfig,
        events: Option<ObjectEventStream>,
        restarts: u32,
    }

    let events = Some(cluster.watch(&gvk));
    let state = State {
        cluster,
        gvk,
        backoff,
        events,
        restarts: 0,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(events) = state.events.as_mut() {
                match events.next().await {
                    Some(event) => {
                        if event.is_ok() {
                            state.restarts = 0;
                        }
                        return Some((event, state));
                    }
                    None => {
                        state.events = None;
                        state.restarts = state.restarts.saturating_add(1);
                    }
                }
            }
            if state.restarts > 0 {
                let delay = state.backoff.delay_for_attempt(state.restarts);
                warn!(gvk = %state.gvk, restarts = state.restarts, retry_in = ?delay, "watch ended, reopening");
                tokio::time::sleep(delay).await;
            }
            state.events = Some(state.cluster.watch(&state.gvk));
        }
    })
    .boxed()
}

/// Timeouts applied to every kube client this crate builds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientTimeouts {
    /// TCP/TLS connect deadline
    pub connect: Duration,
    /// Per-response read deadline; watches are bounded by their own timeout
    pub read: Duration,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            read: Duration::from_secs(30),
        }
    }
}

impl ClientTimeouts {
    fn apply(&self, config: &mut Config) {
        config.connect_timeout = Some(self.connect);
        config.read_timeout = Some(self.read);
    }
}

/// Load client configuration from a kubeconfig file, or infer it
/// (in-cluster service account, then `$KUBECONFIG`) when no path is given.
async fn load_config(kubeconfig: Option<&Path>) -> Result<Config, Error> {
    let client_error = |what: String| Error::internal_with_context("client", what);
    let Some(path) = kubeconfig else {
        return Config::infer()
            .await
            .map_err(|e| client_error(format!("no usable cluster config: {e}")));
    };
    let kubeconfig = Kubeconfig::read_from(path)
        .map_err(|e| client_error(format!("reading {}: {e}", path.display())))?;
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| client_error(format!("loading {}: {e}", path.display())))
}

/// Build a kube client for one side of the sync
pub async fn create_client(kubeconfig: Option<&Path>, timeouts: ClientTimeouts) -> Result<Client, Error> {
    let mut config = load_config(kubeconfig).await?;
    timeouts.apply(&mut config);
    Client::try_from(config)
        .map_err(|e| Error::internal_with_context("client", format!("building client: {e}")))
}
