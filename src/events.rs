//! Kubernetes Events on the governing ResourceSyncRule
//!
//! `kubectl describe resourcesyncrule <name>` shows which objects were
//! written and which were held back by the rate limiter. Publishing is
//! fire-and-forget: a failure is logged and the pass carries on.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

#[cfg(test)]
use mockall::automock;

/// Event reason strings
pub mod reasons {
    /// Too many passes for one object inside the rate-limit window
    pub const OBJECT_RECONCILE_RATE_LIMITED: &str = "ObjectReconcileRateLimited";
    /// Object written to the destination cluster
    pub const OBJECT_RECONCILED: &str = "ObjectReconciled";
}

/// Action recorded on every sync event
pub const SYNC_ACTION: &str = "Sync";

/// Something a pass wants recorded against its rule
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncEvent {
    /// The object for `request` was written
    Reconciled {
        /// Request that was reconciled
        request: String,
    },
    /// The pass for `request` was skipped by the rate limiter
    RateLimited {
        /// Request that was held back
        request: String,
        /// When the limiter admits the key again
        retry_after: Duration,
    },
}

impl SyncEvent {
    /// Normal for writes, Warning for throttling
    pub fn type_(&self) -> EventType {
        match self {
            SyncEvent::Reconciled { .. } => EventType::Normal,
            SyncEvent::RateLimited { .. } => EventType::Warning,
        }
    }

    /// Machine-readable reason
    pub fn reason(&self) -> &'static str {
        match self {
            SyncEvent::Reconciled { .. } => reasons::OBJECT_RECONCILED,
            SyncEvent::RateLimited { .. } => reasons::OBJECT_RECONCILE_RATE_LIMITED,
        }
    }

    /// Human-readable note naming the request
    pub fn note(&self) -> String {
        match self {
            SyncEvent::Reconciled { request } => {
                format!("object reconciled (resource: {request})")
            }
            SyncEvent::RateLimited {
                request,
                retry_after,
            } => format!(
                "ratelimited, too frequent reconciles were happening for this object \
                 (resource: {request}, retry after {}s)",
                retry_after.as_secs()
            ),
        }
    }
}

/// Sink for sync events
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Record `event` against the rule object `rule`
    async fn publish(&self, rule: &ObjectReference, event: SyncEvent);
}

/// Publisher backed by the kube-rs event [`Recorder`]
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Report as `controller_name` (the Event's reportingComponent)
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, rule: &ObjectReference, event: SyncEvent) {
        let reason = event.reason();
        let recorded = Event {
            type_: event.type_(),
            reason: reason.to_string(),
            note: Some(event.note()),
            action: SYNC_ACTION.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&recorded, rule).await {
            warn!(rule = ?rule.name, reason, error = %e, "failed to publish event");
        }
    }
}

/// Publisher that drops everything
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _rule: &ObjectReference, _event: SyncEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconciled_is_normal() {
        let event = SyncEvent::Reconciled {
            request: "default/v1, Kind=ConfigMap|cfg".to_string(),
        };
        assert!(matches!(event.type_(), EventType::Normal));
        assert_eq!(event.reason(), "ObjectReconciled");
        assert_eq!(
            event.note(),
            "object reconciled (resource: default/v1, Kind=ConfigMap|cfg)"
        );
    }

    #[test]
    fn rate_limited_is_a_warning_with_retry_hint() {
        let event = SyncEvent::RateLimited {
            request: "default/v1, Kind=ConfigMap|cfg".to_string(),
            retry_after: Duration::from_secs(42),
        };
        assert!(matches!(event.type_(), EventType::Warning));
        assert_eq!(event.reason(), "ObjectReconcileRateLimited");
        let note = event.note();
        assert!(note.starts_with("ratelimited, too frequent reconciles"));
        assert!(note.contains("retry after 42s"));
    }

    #[tokio::test]
    async fn noop_publisher_accepts_events() {
        NoopEventPublisher
            .publish(
                &ObjectReference::default(),
                SyncEvent::Reconciled {
                    request: "cfg".to_string(),
                },
            )
            .await;
    }
}
