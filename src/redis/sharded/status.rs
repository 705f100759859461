//! Deterministic status projection of a discovered topology.
//!
//! Maps are `BTreeMap`s and shard lists are sorted by name, so two projections
//! of the same topology compare equal no matter in which order servers and
//! shards were discovered.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::redis::types::Role;

/// Snapshot of one Redis server.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RedisServerDetails {
    pub role: Role,
    /// `host:port`.
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub info: BTreeMap<String, String>,
}

/// Snapshot of one shard, servers keyed by `host:port`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MonitoredShard {
    pub name: String,
    #[serde(default)]
    pub servers: BTreeMap<String, RedisServerDetails>,
}

impl MonitoredShard {
    /// Address of the server currently holding the master role.
    pub fn master(&self) -> Option<&str> {
        self.servers
            .values()
            .find(|s| s.role == Role::Master)
            .map(|s| s.address.as_str())
    }
}

/// Sort shards by name. Every producer of a shard list goes through this.
pub fn normalize(mut shards: Vec<MonitoredShard>) -> Vec<MonitoredShard> {
    shards.sort_by(|a, b| a.name.cmp(&b.name));
    shards
}
