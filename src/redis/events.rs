//! Sentinel event watcher.
//!
//! One watcher per Sentinel endpoint subscribes to the failover channels and
//! turns every event into a reconcile request for the owning resource. Event
//! counters are optionally kept in [`SentinelMetrics`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};

use super::client::{PubSubMessage, Subscription};
use super::metrics::{EventLabels, SentinelMetrics};
use super::sharded::SentinelServer;
use super::types::{InstanceKind, SentinelEvent, WATCHED_EVENT_PATTERNS};
use crate::threads::{RunnableThread, TaskHandle, ThreadError};

/// Delay before subscribing again after the subscription failed or closed.
pub const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(10);

/// Watches one Sentinel's pub/sub channels.
pub struct SentinelEventWatcher<E> {
    id: String,
    sentinel: SentinelServer,
    event: E,
    metrics: Arc<SentinelMetrics>,
    export_metrics: bool,
    tx: Option<mpsc::Sender<E>>,
    task: Option<TaskHandle>,
}

impl<E: Clone + Send + Sync + 'static> SentinelEventWatcher<E> {
    /// `id` is the Sentinel URI; `event` is what gets sent to request a
    /// reconcile.
    pub fn new(
        id: impl Into<String>,
        sentinel: SentinelServer,
        event: E,
        metrics: Arc<SentinelMetrics>,
        export_metrics: bool,
    ) -> Self {
        Self {
            id: id.into(),
            sentinel,
            event,
            metrics,
            export_metrics,
            tx: None,
            task: None,
        }
    }
}

#[async_trait]
impl<E: Clone + Send + Sync + 'static> RunnableThread<E> for SentinelEventWatcher<E> {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_channel(&mut self, tx: mpsc::Sender<E>) {
        self.tx = Some(tx);
    }

    fn start(&mut self) -> Result<(), ThreadError> {
        if self.is_started() {
            return Ok(());
        }
        let tx = self
            .tx
            .clone()
            .ok_or_else(|| ThreadError::NoChannel { id: self.id.clone() })?;

        let watch = Watch {
            sentinel: self.sentinel.clone(),
            event: self.event.clone(),
            tx,
            metrics: self.export_metrics.then(|| self.metrics.clone()),
        };
        let span = info_span!("sentinel_event_watcher", sentinel = %self.id);
        self.task = Some(TaskHandle::spawn(span, |token| watch.run(token)));
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.stop().await;
            info!(sentinel = %self.id, "Event watcher stopped");
        }
    }

    fn is_started(&self) -> bool {
        self.task.as_ref().is_some_and(TaskHandle::is_running)
    }
}

/// State moved into the spawned task.
struct Watch<E> {
    sentinel: SentinelServer,
    event: E,
    tx: mpsc::Sender<E>,
    metrics: Option<Arc<SentinelMetrics>>,
}

impl<E: Clone + Send + Sync + 'static> Watch<E> {
    async fn run(self, token: CancellationToken) {
        let patterns: Vec<String> = WATCHED_EVENT_PATTERNS.iter().map(|p| p.to_string()).collect();

        loop {
            let subscribed = tokio::select! {
                _ = token.cancelled() => return,
                result = self.sentinel.psubscribe(&patterns) => result,
            };

            match subscribed {
                Ok(subscription) => {
                    info!("Subscribed to sentinel events");
                    if self.consume(subscription, &token).await {
                        return;
                    }
                    warn!("Sentinel event subscription closed");
                }
                Err(e) => warn!(error = %e, "Failed to subscribe to sentinel events"),
            }

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
            }
        }
    }

    /// Drain the subscription. Returns `true` when cancelled.
    async fn consume(&self, mut subscription: Box<dyn Subscription>, token: &CancellationToken) -> bool {
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => None,
                message = subscription.next_message() => Some(message),
            };
            match next {
                None => {
                    subscription.close().await;
                    return true;
                }
                Some(Some(message)) => self.handle(&message),
                Some(None) => return false,
            }
        }
    }

    fn handle(&self, message: &PubSubMessage) {
        debug!(channel = %message.channel, payload = %message.payload, "Sentinel event received");

        match self.tx.try_send(self.event.clone()) {
            Ok(()) => {}
            // A reconcile is already queued; it will observe this change too.
            Err(TrySendError::Full(_)) => debug!("Reconcile trigger coalesced"),
            Err(TrySendError::Closed(_)) => warn!("Reconcile trigger channel closed"),
        }

        let Some(metrics) = &self.metrics else {
            return;
        };
        match SentinelEvent::parse(&message.channel, &message.payload) {
            Ok(event) => record_event(metrics, &self.sentinel.id(), &event),
            Err(e) => warn!(channel = %message.channel, error = %e, "Skipping malformed sentinel event"),
        }
    }
}

/// Increment the counter matching a decoded event.
pub fn record_event(metrics: &SentinelMetrics, sentinel: &str, event: &SentinelEvent) {
    match event {
        SentinelEvent::SwitchMaster {
            shard, new_master, ..
        } => metrics
            .switch_master
            .get_or_create(&EventLabels::new(sentinel, shard, new_master, InstanceKind::Master))
            .inc(),
        SentinelEvent::FailoverAbortNoGoodSlave { shard, master } => metrics
            .failover_abort_no_good_slave
            .get_or_create(&EventLabels::new(sentinel, shard, master, InstanceKind::Master))
            .inc(),
        SentinelEvent::SDown {
            kind,
            shard,
            server,
        } => {
            let family = match kind {
                InstanceKind::Sentinel => &metrics.sdown_sentinel,
                InstanceKind::Master | InstanceKind::Slave => &metrics.sdown,
            };
            family
                .get_or_create(&EventLabels::new(sentinel, shard, server, *kind))
                .inc()
        }
        SentinelEvent::SDownCleared {
            kind,
            shard,
            server,
        } => {
            let family = match kind {
                InstanceKind::Sentinel => &metrics.sdown_cleared_sentinel,
                InstanceKind::Master | InstanceKind::Slave => &metrics.sdown_cleared,
            };
            family
                .get_or_create(&EventLabels::new(sentinel, shard, server, *kind))
                .inc()
        }
    };
}
