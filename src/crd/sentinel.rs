//! Sentinel Custom Resource Definition.
//!
//! A `Sentinel` names the Sentinel processes of one Redis deployment and the
//! shards they must monitor. The operator registers the shards with every
//! Sentinel, watches their failover events, exports their view as metrics,
//! and reports the discovered topology in the status.

use std::collections::BTreeMap;
use std::time::Duration;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::redis::sharded::{DiscoveryOption, DiscoveryOptions, MonitoredShard, SENTINEL_TOPOLOGY_KEY};

/// Sentinel is a custom resource for a group of Redis Sentinels and the
/// shards they monitor.
///
/// Example:
/// ```yaml
/// apiVersion: saasoperator.io/v1alpha1
/// kind: Sentinel
/// metadata:
///   name: redis-sentinel
/// spec:
///   sentinels:
///     redis-sentinel-0: redis://10.0.0.10:26379
///     redis-sentinel-1: redis://10.0.0.11:26379
///     redis-sentinel-2: redis://10.0.0.12:26379
///   monitoredShards:
///     shard01:
///       redis-shard01-0: redis://10.0.1.1:6379
///       redis-shard01-1: redis://10.0.1.2:6379
///   discoveryOptions: [SaveConfig, ReplicationInfo]
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "saasoperator.io",
    version = "v1alpha1",
    kind = "Sentinel",
    plural = "sentinels",
    shortname = "sent",
    status = "SentinelStatus",
    namespaced,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SentinelSpec {
    /// Sentinel endpoints, alias (pod name) to `redis://host:port`.
    pub sentinels: BTreeMap<String, String>,

    /// Shards to monitor: shard name to alias to `redis://host:port`.
    #[serde(default)]
    pub monitored_shards: BTreeMap<String, BTreeMap<String, String>>,

    /// Sentinels that must agree before a failover. Defaults to a majority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quorum: Option<u32>,

    /// Seconds between two polls of the Sentinel metrics (default 30).
    #[serde(default = "default_metrics_refresh_interval_seconds")]
    pub metrics_refresh_interval_seconds: u64,

    /// Count Sentinel events in Prometheus counters (default true).
    #[serde(default = "default_export_event_metrics")]
    pub export_event_metrics: bool,

    /// Extra facts to discover on every Redis server.
    #[serde(default)]
    pub discovery_options: Vec<DiscoveryOption>,
}

fn default_metrics_refresh_interval_seconds() -> u64 {
    30
}

fn default_export_event_metrics() -> bool {
    true
}

impl Default for SentinelSpec {
    fn default() -> Self {
        Self {
            sentinels: BTreeMap::new(),
            monitored_shards: BTreeMap::new(),
            quorum: None,
            metrics_refresh_interval_seconds: default_metrics_refresh_interval_seconds(),
            export_event_metrics: default_export_event_metrics(),
            discovery_options: Vec::new(),
        }
    }
}

impl SentinelSpec {
    /// Configured quorum, or a majority of the Sentinels.
    pub fn effective_quorum(&self) -> u32 {
        self.quorum
            .unwrap_or_else(|| u32::try_from(self.sentinels.len() / 2 + 1).unwrap_or(u32::MAX))
    }

    /// Topology map with the Sentinels under [`SENTINEL_TOPOLOGY_KEY`].
    pub fn topology(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        let mut topology = self.monitored_shards.clone();
        topology.insert(SENTINEL_TOPOLOGY_KEY.to_string(), self.sentinels.clone());
        topology
    }

    pub fn discovery(&self) -> DiscoveryOptions {
        self.discovery_options.iter().copied().collect()
    }

    pub fn metrics_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_refresh_interval_seconds)
    }
}

/// Status of a Sentinel.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SentinelStatus {
    /// Shards as last discovered through Sentinel, sorted by name.
    #[serde(default)]
    pub monitored_shards: Vec<MonitoredShard>,

    /// `host:port` of every Sentinel of the group, sorted.
    #[serde(default)]
    pub sentinels: Vec<String>,

    /// The generation most recently observed by the controller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Conditions describing the current state.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl SentinelStatus {
    /// Whether `other` carries the same observable state, ignoring
    /// condition transition times.
    pub fn is_equivalent(&self, other: &SentinelStatus) -> bool {
        self.monitored_shards == other.monitored_shards
            && self.sentinels == other.sentinels
            && self.observed_generation == other.observed_generation
            && self.conditions.len() == other.conditions.len()
            && self
                .conditions
                .iter()
                .zip(&other.conditions)
                .all(|(a, b)| a.is_equivalent(b))
    }
}

/// Condition describes the state of a resource at a certain point.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition ("True", "False", "Unknown").
    pub status: String,
    /// Machine-readable reason for the condition's last transition.
    pub reason: String,
    /// Human-readable message indicating details about last transition.
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: String,
    /// The generation of the resource this condition was observed for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new condition.
    pub fn new(
        condition_type: &str,
        status: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status: if status {
                "True".to_string()
            } else {
                "False".to_string()
            },
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: jiff::Timestamp::now().to_string(),
            observed_generation: generation,
        }
    }

    /// Create a "Ready" condition.
    pub fn ready(ready: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self::new(ConditionType::Ready.as_str(), ready, reason, message, generation)
    }

    /// Create a "Degraded" condition.
    pub fn degraded(degraded: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self::new(ConditionType::Degraded.as_str(), degraded, reason, message, generation)
    }

    /// Same type, status, reason, message and generation.
    pub fn is_equivalent(&self, other: &Condition) -> bool {
        self.r#type == other.r#type
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
            && self.observed_generation == other.observed_generation
    }
}

/// Types of conditions for Sentinel.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
pub enum ConditionType {
    /// Every shard is monitored and the topology was discovered.
    Ready,
    /// Discovery reported non-fatal errors.
    Degraded,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::Ready => "Ready",
            ConditionType::Degraded => "Degraded",
        }
    }
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
