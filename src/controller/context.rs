//! Shared context for the controller.
//!
//! The Context struct holds shared state that is passed to the reconciler,
//! including the Kubernetes client, the event recorder, the Redis server
//! pool and the managers of the per-Sentinel background tasks.

use std::sync::Arc;

use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::reflector::ObjectRef;
use kube::{Client, Resource};
use tokio::sync::mpsc;

use crate::crd::Sentinel;
use crate::health::HealthState;
use crate::redis::{SentinelMetrics, ServerPool};
use crate::threads::Manager;

/// Field manager name for the operator
pub const FIELD_MANAGER: &str = "saas-operator";

/// Reconcile trigger sent by the background tasks.
pub type Trigger = ObjectRef<Sentinel>;

/// Shared context for the controller
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Event reporter identity
    reporter: Reporter,
    /// Optional health state for metrics and readiness
    pub health_state: Option<Arc<HealthState>>,
    /// Process-wide Redis server pool
    pub pool: Arc<ServerPool>,
    /// Sentinel event watchers, one per Sentinel URI and resource
    pub watchers: Manager<Trigger>,
    /// Sentinel metrics gatherers, one per Sentinel URI and resource
    pub gatherers: Manager<Trigger>,
    /// Sink of the Sentinel gauges and event counters
    pub sentinel_metrics: Arc<SentinelMetrics>,
}

impl Context {
    /// Create a new context. Background tasks request reconciles through `tx`.
    pub fn new(
        client: Client,
        health_state: Option<Arc<HealthState>>,
        pool: Arc<ServerPool>,
        tx: mpsc::Sender<Trigger>,
    ) -> Self {
        let sentinel_metrics = health_state
            .as_ref()
            .map(|state| state.metrics.sentinel.clone())
            .unwrap_or_default();
        Self {
            client,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
            health_state,
            pool,
            watchers: Manager::new(tx.clone()),
            gatherers: Manager::new(tx),
            sentinel_metrics,
        }
    }

    /// Create an event recorder for publishing Kubernetes events
    fn recorder(&self) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone())
    }

    async fn publish(&self, resource: &Sentinel, type_: EventType, reason: &str, action: &str, note: Option<String>) {
        let recorder = self.recorder();
        let object_ref = resource.object_ref(&());
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!(reason = %reason, error = %e, "Failed to publish event");
        }
    }

    /// Publish a normal event for a resource
    pub async fn publish_normal_event(
        &self,
        resource: &Sentinel,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.publish(resource, EventType::Normal, reason, action, note)
            .await;
    }

    /// Publish a warning event for a resource
    pub async fn publish_warning_event(
        &self,
        resource: &Sentinel,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.publish(resource, EventType::Warning, reason, action, note)
            .await;
    }
}
