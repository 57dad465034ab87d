//! Sync controller runner
//!
//! Each rule runs one kube-runtime [`Controller`] over `DynamicObject`s of
//! the rule's kind. The remote watch, filtered by the rule before anything
//! is scheduled, is the controller's primary stream. Reverse watches and
//! manual triggers share one channel handed to `reconcile_on`. The
//! controller runs at most one pass per key at a time and bounds overall
//! concurrency; per-key backoff lives in [`error_policy`].

use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{Stream, StreamExt};
use kube::api::DynamicObject;
use kube::runtime::controller::{self, Action};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{watcher, Controller};
use kube::ResourceExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::controller::{
    reconcile, LocalInformerRegistry, RequestStore, SyncContext, SyncContextBuilder, SyncOutcome,
};
use crate::crd::GroupVersionKind;
use crate::retry::RetryConfig;
use crate::sync::{ManagedObject, ReconcileRequest, RuleMatcher};
use crate::transport::{watch_forever, ObjectEvent};
use crate::Error;

/// Handle for forcing a pass outside of watch events
#[derive(Clone)]
pub struct Trigger {
    sender: mpsc::UnboundedSender<ReconcileRequest>,
}

impl Trigger {
    /// Enqueue a request; fails once the controller has stopped
    pub fn trigger(&self, request: ReconcileRequest) -> Result<(), Error> {
        self.sender
            .send(request)
            .map_err(|_| Error::internal_with_context("trigger", "sync controller has stopped"))
    }

    /// Enqueue a pass for one source object
    pub fn trigger_object(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<String>,
        name: &str,
    ) -> Result<(), Error> {
        self.trigger(ReconcileRequest::new(gvk, namespace, name))
    }
}

/// One rule's controller: forward watch, reverse watches and triggers
pub struct SyncController {
    ctx: Arc<SyncContext>,
    config: SyncConfig,
    requests: Arc<RequestStore>,
    sender: mpsc::UnboundedSender<ReconcileRequest>,
    receiver: mpsc::UnboundedReceiver<ReconcileRequest>,
    informers: Arc<LocalInformerRegistry>,
    shutdown: CancellationToken,
}

impl SyncController {
    /// Wire a controller; the builder's reverse watch is replaced by the
    /// controller's own informer registry
    pub fn new(ctx: SyncContextBuilder, config: SyncConfig, shutdown: CancellationToken) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let informers = Arc::new(
            LocalInformerRegistry::new(ctx.destination(), sender.clone(), shutdown.child_token())
                .with_backoff(config.requeue_backoff.clone()),
        );
        let ctx = Arc::new(ctx.reverse_watch(informers.clone()).build());
        let requests = Arc::new(RequestStore::new(ctx.matcher.target_gvk()));

        Self {
            ctx,
            config,
            requests,
            sender,
            receiver,
            informers,
            shutdown,
        }
    }

    /// Handle for manual triggers
    pub fn trigger(&self) -> Trigger {
        Trigger {
            sender: self.sender.clone(),
        }
    }

    /// Shared pipeline context
    pub fn context(&self) -> Arc<SyncContext> {
        Arc::clone(&self.ctx)
    }

    /// Reverse watch registry
    pub fn informers(&self) -> Arc<LocalInformerRegistry> {
        Arc::clone(&self.informers)
    }

    /// Keys the controller can schedule
    pub fn requests(&self) -> Arc<RequestStore> {
        Arc::clone(&self.requests)
    }

    /// Run until the shutdown token is cancelled
    pub async fn run(self) {
        let SyncController {
            ctx,
            config,
            requests,
            sender: _,
            receiver,
            informers: _,
            shutdown,
        } = self;

        let rule = ctx.rule.name.clone().unwrap_or_default();
        info!(
            rule = %rule,
            gvk = %requests.gvk(),
            workers = config.workers,
            "starting sync controller"
        );

        let forward = forward_stream(
            Arc::clone(&ctx),
            Arc::clone(&requests),
            config.requeue_backoff.clone(),
        );
        let triggers = trigger_stream(receiver, Arc::clone(&requests));
        let concurrency = u16::try_from(config.workers.max(1)).unwrap_or(u16::MAX);
        let state = Arc::new(RunnerState::new(
            ctx,
            Arc::clone(&requests),
            &config,
            shutdown.clone(),
        ));

        Controller::for_stream_with(forward, requests.reader(), requests.resource().clone())
            .with_config(controller::Config::default().concurrency(concurrency))
            .reconcile_on(triggers)
            .graceful_shutdown_on(shutdown.cancelled_owned())
            .run(reconcile_object, error_policy, state)
            .for_each(log_reconcile_result(rule.clone()))
            .await;

        info!(rule = %rule, "sync controller stopped");
    }
}

/// Record a remote watch event and return the object to schedule when the
/// rule matches it.
///
/// A matched deletion stays in the store as a tombstone so the pass that
/// removes the destination copy can still be scheduled.
pub fn forward_object(
    matcher: &dyn RuleMatcher,
    requests: &RequestStore,
    event: ObjectEvent,
) -> Option<DynamicObject> {
    let deleted = matches!(event, ObjectEvent::Deleted(_));
    let obj = event.into_object().with_gvk(requests.gvk());
    let matched = match matcher.match_object(&obj) {
        Ok(found) => found.is_some(),
        Err(e) => {
            warn!(gvk = %requests.gvk(), object = %obj.name_any(), error = %e, "could not match object");
            false
        }
    };

    if deleted && !matched {
        requests.remove(&obj);
    } else {
        requests.upsert(&obj);
    }
    matched.then_some(obj)
}

fn forward_stream(
    ctx: Arc<SyncContext>,
    requests: Arc<RequestStore>,
    backoff: RetryConfig,
) -> impl Stream<Item = Result<DynamicObject, watcher::Error>> + Send + 'static {
    let gvk = requests.gvk().clone();
    watch_forever(Arc::clone(&ctx.source), gvk.clone(), backoff).filter_map(move |event| {
        let scheduled = match event {
            Ok(event) => forward_object(ctx.matcher.as_ref(), &requests, event)
                .map(Ok::<DynamicObject, watcher::Error>),
            Err(e) => {
                warn!(gvk = %gvk, error = %e, "remote watch error");
                None
            }
        };
        ready(scheduled)
    })
}

fn trigger_stream(
    receiver: mpsc::UnboundedReceiver<ReconcileRequest>,
    requests: Arc<RequestStore>,
) -> impl Stream<Item = ObjectRef<DynamicObject>> + Send + 'static {
    UnboundedReceiverStream::new(receiver).filter_map(move |request| {
        let admitted = match requests.admit(&request) {
            Ok(Some(obj_ref)) => {
                debug!(request = %request, "scheduling triggered pass");
                Some(obj_ref)
            }
            Ok(None) => {
                debug!(request = %request, gvk = %requests.gvk(), "request for another kind, ignoring");
                None
            }
            Err(e) => {
                error!(request = %request, error = %e, "dropping malformed request");
                None
            }
        };
        ready(admitted)
    })
}

/// State shared by every pass of one controller
struct RunnerState {
    ctx: Arc<SyncContext>,
    requests: Arc<RequestStore>,
    backoff: RetryConfig,
    failures: DashMap<ReconcileRequest, u32>,
    reconcile_timeout: Duration,
    shutdown: CancellationToken,
}

impl RunnerState {
    fn new(
        ctx: Arc<SyncContext>,
        requests: Arc<RequestStore>,
        config: &SyncConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            requests,
            backoff: config.requeue_backoff.clone(),
            failures: DashMap::new(),
            reconcile_timeout: config.reconcile_timeout,
            shutdown,
        }
    }

    fn request_for(&self, obj: &DynamicObject) -> ReconcileRequest {
        ReconcileRequest::new(self.requests.gvk(), obj.namespace(), &obj.name_any())
    }

    /// Count another failed pass for `request` and return its requeue delay
    fn next_backoff(&self, request: &ReconcileRequest) -> Duration {
        let mut attempts = self.failures.entry(request.clone()).or_insert(0);
        *attempts = attempts.saturating_add(1);
        self.backoff.delay_for_attempt(*attempts)
    }

    fn forget(&self, request: &ReconcileRequest) {
        self.failures.remove(request);
    }
}

/// Run the pipeline for one scheduled object, bounded by the per-pass
/// deadline and the shutdown token
async fn reconcile_object(obj: Arc<DynamicObject>, state: Arc<RunnerState>) -> Result<Action, Error> {
    let request = state.request_for(&obj);
    let outcome = tokio::select! {
        biased;
        _ = state.shutdown.cancelled() => {
            return Err(Error::Cancelled { key: request.to_string() });
        }
        result = tokio::time::timeout(state.reconcile_timeout, reconcile(&request, &state.ctx)) => {
            result.map_err(|_| Error::Timeout { key: request.to_string() })??
        }
    };

    match outcome {
        SyncOutcome::Requeue => {
            let delay = state.next_backoff(&request);
            debug!(request = %request, requeue_in = ?delay, "requeueing");
            Ok(Action::requeue(delay))
        }
        SyncOutcome::Removed => {
            state.forget(&request);
            state.requests.evict(&obj);
            Ok(Action::await_change())
        }
        outcome => {
            state.forget(&request);
            debug!(request = %request, ?outcome, "pass finished");
            Ok(Action::await_change())
        }
    }
}

/// Back off retryable failures per key; drop the rest
fn error_policy(obj: Arc<DynamicObject>, error: &Error, state: Arc<RunnerState>) -> Action {
    let request = state.request_for(&obj);
    if !error.is_retryable() {
        state.forget(&request);
        error!(request = %request, error = %error, "reconcile failed permanently, dropping request");
        return Action::await_change();
    }
    let delay = state.next_backoff(&request);
    warn!(request = %request, error = %error, requeue_in = ?delay, "reconcile failed, requeueing");
    Action::requeue(delay)
}

/// Failed passes are already logged by [`error_policy`]
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug, Q: std::fmt::Debug>(
    rule: String,
) -> impl Fn(Result<T, controller::Error<E, Q>>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => debug!(rule = %rule, ?action, "reconciliation completed"),
            Err(controller::Error::ReconcilerFailed(..)) => {}
            Err(e) => warn!(rule = %rule, error = ?e, "reconciliation error"),
        }
        ready(())
    }
}
