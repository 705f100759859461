//! Typed Redis and Sentinel replies.
//!
//! These types represent the parsed output of `ROLE`, `SENTINEL MASTERS`,
//! `SENTINEL SLAVES` and the Sentinel pub/sub event payloads.

use std::collections::HashMap;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::parsing::{ParseError, join_host_port, optional_int, parse_flat_pairs, required};

/// Role of a Redis server as last discovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Server accepts writes and is replicated from.
    Master,
    /// Server replicates from a master.
    Slave,
    /// No successful discovery yet, or the last one failed.
    #[default]
    Unknown,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Slave => write!(f, "slave"),
            Role::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for Role {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "master" => Ok(Role::Master),
            "slave" | "replica" => Ok(Role::Slave),
            "unknown" => Ok(Role::Unknown),
            other => Err(ParseError::InvalidValue {
                field: "role".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Parsed `ROLE` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleReply {
    Master,
    Slave {
        master_host: String,
        master_port: u16,
        /// Replication state (`connect`, `connecting`, `sync`, `connected`).
        state: String,
    },
    Sentinel,
}

impl RoleReply {
    /// Parse the top-level fields of a `ROLE` reply.
    ///
    /// Nested arrays (the master's replica list, the sentinel's master list)
    /// are not needed and are expected to be flattened away by the caller.
    pub fn from_fields(fields: &[String]) -> Result<Self, ParseError> {
        let kind = fields
            .first()
            .ok_or_else(|| ParseError::MissingField("role".to_string()))?;
        match kind.as_str() {
            "master" => Ok(RoleReply::Master),
            "sentinel" => Ok(RoleReply::Sentinel),
            "slave" => {
                let master_host = fields
                    .get(1)
                    .cloned()
                    .ok_or_else(|| ParseError::MissingField("master_host".to_string()))?;
                let port = fields
                    .get(2)
                    .ok_or_else(|| ParseError::MissingField("master_port".to_string()))?;
                let master_port = port.parse().map_err(|_| ParseError::InvalidValue {
                    field: "master_port".to_string(),
                    value: port.clone(),
                })?;
                let state = fields.get(3).cloned().unwrap_or_default();
                Ok(RoleReply::Slave {
                    master_host,
                    master_port,
                    state,
                })
            }
            other => Err(ParseError::InvalidValue {
                field: "role".to_string(),
                value: other.to_string(),
            }),
        }
    }

    /// The server role this reply maps to.
    pub fn role(&self) -> Role {
        match self {
            RoleReply::Master => Role::Master,
            RoleReply::Slave { .. } => Role::Slave,
            RoleReply::Sentinel => Role::Unknown,
        }
    }
}

/// One entry of `SENTINEL MASTERS` / `SENTINEL MASTER <name>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SentinelMasterInfo {
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub flags: Vec<String>,
    pub link_pending_commands: Option<i64>,
    pub last_ok_ping_reply: Option<i64>,
    pub role_reported: Option<String>,
    pub role_reported_time: Option<i64>,
    pub num_slaves: Option<i64>,
    pub num_other_sentinels: Option<i64>,
    pub quorum: Option<i64>,
}

impl SentinelMasterInfo {
    /// Decode the flat `[field, value, ...]` array Sentinel replies with.
    pub fn from_fields(fields: &[String]) -> Result<Self, ParseError> {
        Self::from_map(&parse_flat_pairs(fields))
    }

    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, ParseError> {
        Ok(Self {
            name: required(map, "name")?,
            ip: required(map, "ip")?,
            port: parse_port(map)?,
            flags: parse_flags(map),
            link_pending_commands: optional_int(map, "link-pending-commands")?,
            last_ok_ping_reply: optional_int(map, "last-ok-ping-reply")?,
            role_reported: map.get("role-reported").cloned(),
            role_reported_time: optional_int(map, "role-reported-time")?,
            num_slaves: optional_int(map, "num-slaves")?,
            num_other_sentinels: optional_int(map, "num-other-sentinels")?,
            quorum: optional_int(map, "quorum")?,
        })
    }

    /// `host:port` of the master as Sentinel sees it.
    pub fn address(&self) -> String {
        join_host_port(&self.ip, self.port)
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    pub fn failover_in_progress(&self) -> bool {
        self.has_flag("failover_in_progress") || self.has_flag("promoted")
    }
}

/// One entry of `SENTINEL SLAVES <name>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SentinelSlaveInfo {
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub flags: Vec<String>,
    pub link_pending_commands: Option<i64>,
    pub last_ok_ping_reply: Option<i64>,
    pub role_reported_time: Option<i64>,
    pub master_link_down_time: Option<i64>,
    pub master_link_status: Option<String>,
    pub master_host: Option<String>,
    pub master_port: Option<i64>,
    pub slave_priority: Option<i64>,
    pub slave_repl_offset: Option<i64>,
}

impl SentinelSlaveInfo {
    pub fn from_fields(fields: &[String]) -> Result<Self, ParseError> {
        Self::from_map(&parse_flat_pairs(fields))
    }

    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, ParseError> {
        Ok(Self {
            name: map.get("name").cloned().unwrap_or_default(),
            ip: required(map, "ip")?,
            port: parse_port(map)?,
            flags: parse_flags(map),
            link_pending_commands: optional_int(map, "link-pending-commands")?,
            last_ok_ping_reply: optional_int(map, "last-ok-ping-reply")?,
            role_reported_time: optional_int(map, "role-reported-time")?,
            master_link_down_time: optional_int(map, "master-link-down-time")?,
            master_link_status: map.get("master-link-status").cloned(),
            master_host: map.get("master-host").cloned(),
            master_port: optional_int(map, "master-port")?,
            slave_priority: optional_int(map, "slave-priority")?,
            slave_repl_offset: optional_int(map, "slave-repl-offset")?,
        })
    }

    pub fn address(&self) -> String {
        join_host_port(&self.ip, self.port)
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    /// Sentinel considers this replica down or unreachable.
    pub fn is_down(&self) -> bool {
        self.has_flag("s_down") || self.has_flag("o_down") || self.has_flag("disconnected")
    }
}

fn positional<'a>(
    fields: &[&'a str],
    idx: usize,
    channel: &str,
    payload: &str,
) -> Result<&'a str, ParseError> {
    fields.get(idx).copied().ok_or_else(|| {
        ParseError::Parse(format!("{} payload too short: '{}'", channel, payload))
    })
}

fn parse_port(map: &HashMap<String, String>) -> Result<u16, ParseError> {
    let port = required(map, "port")?;
    port.parse().map_err(|_| ParseError::InvalidValue {
        field: "port".to_string(),
        value: port,
    })
}

fn parse_flags(map: &HashMap<String, String>) -> Vec<String> {
    map.get("flags")
        .map(|f| {
            f.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Sentinel pub/sub channels watched for topology changes.
pub const SWITCH_MASTER: &str = "+switch-master";
pub const FAILOVER_ABORT_NO_GOOD_SLAVE: &str = "-failover-abort-no-good-slave";
pub const SDOWN: &str = "+sdown";
pub const SDOWN_CLEARED: &str = "-sdown";

/// Patterns the event watcher subscribes to.
pub const WATCHED_EVENT_PATTERNS: [&str; 3] =
    [SWITCH_MASTER, FAILOVER_ABORT_NO_GOOD_SLAVE, "[+-]sdown"];

/// Kind of instance an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceKind {
    Master,
    Slave,
    Sentinel,
}

impl FromStr for InstanceKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "master" => Ok(InstanceKind::Master),
            "slave" => Ok(InstanceKind::Slave),
            "sentinel" => Ok(InstanceKind::Sentinel),
            other => Err(ParseError::InvalidValue {
                field: "instance-type".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceKind::Master => write!(f, "master"),
            InstanceKind::Slave => write!(f, "slave"),
            InstanceKind::Sentinel => write!(f, "sentinel"),
        }
    }
}

/// A decoded Sentinel event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentinelEvent {
    /// `<master-name> <old-ip> <old-port> <new-ip> <new-port>`
    SwitchMaster {
        shard: String,
        old_master: String,
        new_master: String,
    },
    /// `master <master-name> <ip> <port>`
    FailoverAbortNoGoodSlave { shard: String, master: String },
    /// `<instance-type> <name> <ip> <port> [@ <master-name> <master-ip> <master-port>]`
    SDown {
        kind: InstanceKind,
        shard: String,
        server: String,
    },
    SDownCleared {
        kind: InstanceKind,
        shard: String,
        server: String,
    },
}

impl SentinelEvent {
    /// Decode an event from its channel and payload.
    ///
    /// The payload format is positional and depends on the channel.
    pub fn parse(channel: &str, payload: &str) -> Result<Self, ParseError> {
        let fields: Vec<&str> = payload.split_whitespace().collect();
        let field = |idx: usize| positional(&fields, idx, channel, payload);

        match channel {
            SWITCH_MASTER => Ok(SentinelEvent::SwitchMaster {
                shard: field(0)?.to_string(),
                old_master: join_host_port(field(1)?, field(2)?),
                new_master: join_host_port(field(3)?, field(4)?),
            }),
            FAILOVER_ABORT_NO_GOOD_SLAVE => Ok(SentinelEvent::FailoverAbortNoGoodSlave {
                shard: field(1)?.to_string(),
                master: join_host_port(field(2)?, field(3)?),
            }),
            SDOWN | SDOWN_CLEARED => {
                let kind: InstanceKind = field(0)?.parse()?;
                let server = join_host_port(field(2)?, field(3)?);
                // Non-master instances name their master after the '@' marker.
                let shard = match kind {
                    InstanceKind::Master => field(1)?.to_string(),
                    InstanceKind::Slave | InstanceKind::Sentinel => {
                        if field(4)? != "@" {
                            return Err(ParseError::Parse(format!(
                                "{} payload missing master reference: '{}'",
                                channel, payload
                            )));
                        }
                        field(5)?.to_string()
                    }
                };
                if channel == SDOWN {
                    Ok(SentinelEvent::SDown {
                        kind,
                        shard,
                        server,
                    })
                } else {
                    Ok(SentinelEvent::SDownCleared {
                        kind,
                        shard,
                        server,
                    })
                }
            }
            other => Err(ParseError::Parse(format!("unsupported channel: {}", other))),
        }
    }

    /// Name of the shard the event refers to.
    pub fn shard(&self) -> &str {
        match self {
            SentinelEvent::SwitchMaster { shard, .. }
            | SentinelEvent::FailoverAbortNoGoodSlave { shard, .. }
            | SentinelEvent::SDown { shard, .. }
            | SentinelEvent::SDownCleared { shard, .. } => shard,
        }
    }
}
