//! Sentinel metrics gatherer.
//!
//! Polls one Sentinel on an interval and republishes what it reports about
//! masters and slaves as gauges.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};

use super::client::RedisError;
use super::metrics::{SentinelMetrics, ServerLabels, set_gauge};
use super::server::ServerPool;
use super::sharded::SentinelServer;
use super::types::{Role, SentinelMasterInfo, SentinelSlaveInfo};
use crate::threads::{RunnableThread, TaskHandle, ThreadError};

/// Default polling interval.
pub const DEFAULT_GATHER_INTERVAL: Duration = Duration::from_secs(30);

/// Republishes one Sentinel's view of its shards as gauges.
pub struct SentinelMetricsGatherer {
    id: String,
    sentinel: SentinelServer,
    pool: Arc<ServerPool>,
    metrics: Arc<SentinelMetrics>,
    interval: Duration,
    task: Option<TaskHandle>,
}

impl SentinelMetricsGatherer {
    /// `id` is the Sentinel URI. The pool resolves server aliases for labels.
    pub fn new(
        id: impl Into<String>,
        sentinel: SentinelServer,
        pool: Arc<ServerPool>,
        metrics: Arc<SentinelMetrics>,
        interval: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            sentinel,
            pool,
            metrics,
            interval,
            task: None,
        }
    }
}

#[async_trait]
impl<E: Send + 'static> RunnableThread<E> for SentinelMetricsGatherer {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_channel(&mut self, _tx: mpsc::Sender<E>) {
        // Gatherers never request reconciles.
    }

    fn start(&mut self) -> Result<(), ThreadError> {
        if RunnableThread::<E>::is_started(self) {
            return Ok(());
        }
        if self.interval.is_zero() {
            return Err(ThreadError::Start {
                id: self.id.clone(),
                reason: "polling interval must be positive".to_string(),
            });
        }

        let gather = Gather {
            sentinel: self.sentinel.clone(),
            pool: self.pool.clone(),
            metrics: self.metrics.clone(),
            written: HashSet::new(),
        };
        let interval = self.interval;
        let span = info_span!("sentinel_metrics_gatherer", sentinel = %self.id);
        self.task = Some(TaskHandle::spawn(span, move |token| gather.run(interval, token)));
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.stop().await;
            info!(sentinel = %self.id, "Metrics gatherer stopped");
        }
    }

    fn is_started(&self) -> bool {
        self.task.as_ref().is_some_and(TaskHandle::is_running)
    }
}

/// State moved into the spawned task.
struct Gather {
    sentinel: SentinelServer,
    pool: Arc<ServerPool>,
    metrics: Arc<SentinelMetrics>,
    /// Every live series this task has written, removed again on stop.
    written: HashSet<ServerLabels>,
}

impl Gather {
    async fn run(mut self, interval: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let result = tokio::select! {
                _ = token.cancelled() => break,
                result = self.gather() => result,
            };
            if let Err(e) = result {
                warn!(error = %e, "Failed to gather sentinel metrics");
            }
        }

        for labels in self.written.drain() {
            self.metrics.remove_server(&labels);
        }
    }

    /// Publish one snapshot of Sentinel's view.
    ///
    /// Series written earlier but absent from this snapshot are removed, so
    /// replicas Sentinel forgot and labels that changed do not linger. When
    /// a shard's slaves cannot be listed its previous slave series are kept.
    async fn gather(&mut self) -> Result<(), RedisError> {
        let masters = self.sentinel.masters().await?;
        debug!(masters = masters.len(), "Gathering sentinel metrics");

        let mut seen = HashSet::new();
        for master in masters {
            seen.insert(self.record_master(&master));
            match self.sentinel.slaves(&master.name).await {
                Ok(slaves) => {
                    for slave in &slaves {
                        seen.insert(self.record_slave(&master.name, slave));
                    }
                }
                Err(e) => {
                    warn!(shard = %master.name, error = %e, "Failed to list slaves");
                    seen.extend(
                        self.written
                            .iter()
                            .filter(|l| l.shard == master.name && l.role == Role::Slave)
                            .cloned(),
                    );
                }
            }
        }

        let stale: Vec<ServerLabels> = self.written.difference(&seen).cloned().collect();
        for labels in &stale {
            debug!(shard = %labels.shard, server = %labels.redis_server, role = %labels.role, "Removing stale series");
            self.metrics.remove_server(labels);
        }
        self.written = seen;
        Ok(())
    }

    fn labels(&self, shard: &str, address: String, role: Role) -> ServerLabels {
        let alias = self
            .pool
            .lookup(&address)
            .and_then(|s| s.alias())
            .unwrap_or_default();
        ServerLabels {
            sentinel: self.sentinel.id(),
            shard: shard.to_string(),
            redis_server: address,
            redis_server_alias: alias,
            role,
        }
    }

    fn record_master(&mut self, master: &SentinelMasterInfo) -> ServerLabels {
        let labels = self.labels(&master.name, master.address(), Role::Master);
        self.written.insert(labels.clone());

        let m = &self.metrics;
        set_gauge(&m.link_pending_commands, &labels, master.link_pending_commands);
        set_gauge(&m.last_ok_ping_reply, &labels, master.last_ok_ping_reply);
        set_gauge(&m.role_reported_time, &labels, master.role_reported_time);
        set_gauge(&m.num_slaves, &labels, master.num_slaves);
        set_gauge(&m.num_other_sentinels, &labels, master.num_other_sentinels);
        labels
    }

    fn record_slave(&mut self, shard: &str, slave: &SentinelSlaveInfo) -> ServerLabels {
        let labels = self.labels(shard, slave.address(), Role::Slave);
        self.written.insert(labels.clone());

        let m = &self.metrics;
        set_gauge(&m.link_pending_commands, &labels, slave.link_pending_commands);
        set_gauge(&m.last_ok_ping_reply, &labels, slave.last_ok_ping_reply);
        set_gauge(&m.role_reported_time, &labels, slave.role_reported_time);
        set_gauge(&m.master_link_down_time, &labels, slave.master_link_down_time);
        set_gauge(&m.slave_repl_offset, &labels, slave.slave_repl_offset);
        labels
    }
}
