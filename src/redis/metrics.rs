//! Prometheus families fed by the Sentinel watchers and gatherers.
//!
//! One [`SentinelMetrics`] is created by the owner of the registry, registered
//! once, and shared by `Arc` with every background task. Families are cheap
//! handles, so tests can build an unregistered instance and read values back.

use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use super::types::{InstanceKind, Role};

const GAUGE_PREFIX: &str = "saas_redis_sentinel";
const EVENT_PREFIX: &str = "saas_redis_sentinel_events";

/// Labels of the Sentinel sourced gauges.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ServerLabels {
    pub sentinel: String,
    pub shard: String,
    pub redis_server: String,
    pub redis_server_alias: String,
    pub role: Role,
}

impl EncodeLabelSet for ServerLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("sentinel", self.sentinel.as_str()).encode(encoder.encode_label())?;
        ("shard", self.shard.as_str()).encode(encoder.encode_label())?;
        ("redis_server", self.redis_server.as_str()).encode(encoder.encode_label())?;
        ("redis_server_alias", self.redis_server_alias.as_str()).encode(encoder.encode_label())?;
        ("role", self.role.to_string().as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels of the event counters. `role` is the kind of instance the event
/// is about.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct EventLabels {
    pub sentinel: String,
    pub shard: String,
    pub redis_server: String,
    pub role: InstanceKind,
}

impl EventLabels {
    pub fn new(sentinel: &str, shard: &str, redis_server: &str, role: InstanceKind) -> Self {
        Self {
            sentinel: sentinel.to_string(),
            shard: shard.to_string(),
            redis_server: redis_server.to_string(),
            role,
        }
    }
}

impl EncodeLabelSet for EventLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("sentinel", self.sentinel.as_str()).encode(encoder.encode_label())?;
        ("shard", self.shard.as_str()).encode(encoder.encode_label())?;
        ("redis_server", self.redis_server.as_str()).encode(encoder.encode_label())?;
        ("role", self.role.to_string().as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

type GaugeFamily = Family<ServerLabels, Gauge>;
type CounterFamily = Family<EventLabels, Counter>;

/// Gauges republished from `SENTINEL MASTERS`/`SLAVES` and counters of
/// Sentinel events.
#[derive(Clone, Debug, Default)]
pub struct SentinelMetrics {
    pub link_pending_commands: GaugeFamily,
    pub last_ok_ping_reply: GaugeFamily,
    pub role_reported_time: GaugeFamily,
    pub num_slaves: GaugeFamily,
    pub num_other_sentinels: GaugeFamily,
    pub master_link_down_time: GaugeFamily,
    pub slave_repl_offset: GaugeFamily,

    pub switch_master: CounterFamily,
    pub failover_abort_no_good_slave: CounterFamily,
    pub sdown: CounterFamily,
    pub sdown_sentinel: CounterFamily,
    pub sdown_cleared: CounterFamily,
    pub sdown_cleared_sentinel: CounterFamily,
}

impl SentinelMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every family. Call once per registry.
    pub fn register(&self, registry: &mut Registry) {
        let gauges: [(&str, &str, &GaugeFamily); 7] = [
            ("link_pending_commands", "Number of pending commands on the sentinel link", &self.link_pending_commands),
            ("last_ok_ping_reply", "Milliseconds since the last valid ping reply", &self.last_ok_ping_reply),
            ("role_reported_time", "Milliseconds since the reported role was last updated", &self.role_reported_time),
            ("num_slaves", "Number of slaves known to the sentinel", &self.num_slaves),
            ("num_other_sentinels", "Number of other sentinels monitoring the master", &self.num_other_sentinels),
            ("master_link_down_time", "Milliseconds the slave link with its master has been down", &self.master_link_down_time),
            ("slave_repl_offset", "Replication offset reported for the slave", &self.slave_repl_offset),
        ];
        for (name, help, family) in gauges {
            registry.register(format!("{}_{}", GAUGE_PREFIX, name), help, family.clone());
        }

        let counters: [(&str, &str, &CounterFamily); 6] = [
            ("switch_master", "Number of +switch-master events", &self.switch_master),
            ("failover_abort_no_good_slave", "Number of -failover-abort-no-good-slave events", &self.failover_abort_no_good_slave),
            ("sdown", "Number of +sdown events on redis servers", &self.sdown),
            ("sdown_sentinel", "Number of +sdown events on sentinels", &self.sdown_sentinel),
            ("sdown_cleared", "Number of -sdown events on redis servers", &self.sdown_cleared),
            ("sdown_cleared_sentinel", "Number of -sdown events on sentinels", &self.sdown_cleared_sentinel),
        ];
        for (name, help, family) in counters {
            registry.register(format!("{}_{}", EVENT_PREFIX, name), help, family.clone());
        }
    }

    fn gauges(&self) -> [&GaugeFamily; 7] {
        [
            &self.link_pending_commands,
            &self.last_ok_ping_reply,
            &self.role_reported_time,
            &self.num_slaves,
            &self.num_other_sentinels,
            &self.master_link_down_time,
            &self.slave_repl_offset,
        ]
    }

    /// Drop a series from every gauge family.
    pub fn remove_server(&self, labels: &ServerLabels) {
        for family in self.gauges() {
            family.remove(labels);
        }
    }
}

/// Set a gauge when Sentinel reported the value.
pub(crate) fn set_gauge(family: &GaugeFamily, labels: &ServerLabels, value: Option<i64>) {
    if let Some(value) = value {
        family.get_or_create(labels).set(value);
    }
}
