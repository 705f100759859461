//! A Redis process plus the facts discovered about it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::discovery::{DiscoveryOption, DiscoveryOptions};
use super::status::RedisServerDetails;
use crate::redis::client::{Connection, RedisError};
use crate::redis::parsing::{join_host_port, select_info_fields};
use crate::redis::server::Server;
use crate::redis::types::{Role, RoleReply};

/// Master host a freshly started replica points at until Sentinel
/// reconfigures it.
pub const UNCONFIGURED_MASTER_HOST: &str = "127.0.0.1";

/// `INFO replication` keys kept when [`DiscoveryOption::ReplicationInfo`] is enabled.
pub const REPLICATION_INFO_KEYS: [&str; 4] = [
    "master_link_status",
    "master_sync_in_progress",
    "master_last_io_seconds_ago",
    "slave_repl_offset",
];

/// A pool-backed Redis server with its discovered role, config and info.
#[derive(Debug, Clone)]
pub struct RedisServer {
    server: Arc<Server>,
    role: Role,
    /// Replication target reported by `ROLE` when the server is a slave.
    master_address: Option<(String, u16)>,
    config: BTreeMap<String, String>,
    info: BTreeMap<String, String>,
}

impl RedisServer {
    pub fn new(server: Arc<Server>) -> Self {
        Self {
            server,
            role: Role::Unknown,
            master_address: None,
            config: BTreeMap::new(),
            info: BTreeMap::new(),
        }
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn id(&self) -> String {
        self.server.id()
    }

    pub fn host(&self) -> &str {
        self.server.host()
    }

    pub fn port(&self) -> u16 {
        self.server.port()
    }

    pub fn alias(&self) -> Option<String> {
        self.server.alias()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &BTreeMap<String, String> {
        &self.config
    }

    pub fn info(&self) -> &BTreeMap<String, String> {
        &self.info
    }

    /// `host:port` this server replicates from, when it is a slave.
    pub fn master_address(&self) -> Option<String> {
        self.master_address
            .as_ref()
            .map(|(host, port)| join_host_port(host, *port))
    }

    /// The server is a slave still pointing at the unconfigured placeholder
    /// master, i.e. Sentinel has not reconfigured it yet.
    pub fn awaiting_reconfiguration(&self) -> bool {
        self.role == Role::Slave
            && self
                .master_address
                .as_ref()
                .is_some_and(|(host, _)| host == UNCONFIGURED_MASTER_HOST)
    }

    async fn connection(&self) -> Result<Arc<dyn Connection>, RedisError> {
        self.server.connection().await
    }

    /// Refresh role, and the facts selected by `options`.
    ///
    /// On failure the role is reset to [`Role::Unknown`] and the previously
    /// discovered config and info are dropped.
    pub async fn discover(&mut self, options: &DiscoveryOptions) -> Result<(), RedisError> {
        let result = match self.connection().await {
            Ok(conn) => {
                let result = self.discover_inner(conn.as_ref(), options).await;
                self.server.checked(&conn, result).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            debug!(server = %self.server.display_name(), error = %e, "Discovery failed");
            self.role = Role::Unknown;
            self.master_address = None;
            self.config.clear();
            self.info.clear();
        }
        result
    }

    async fn discover_inner(
        &mut self,
        conn: &dyn Connection,
        options: &DiscoveryOptions,
    ) -> Result<(), RedisError> {
        let reply = conn.role().await?;
        let role = reply.role();
        if role == Role::Unknown {
            return Err(RedisError::UnexpectedReply {
                command: "ROLE".to_string(),
                reply: "sentinel".to_string(),
            });
        }
        self.role = role;
        self.master_address = match reply {
            RoleReply::Slave {
                master_host,
                master_port,
                ..
            } => Some((master_host, master_port)),
            RoleReply::Master | RoleReply::Sentinel => None,
        };

        let mut config = BTreeMap::new();
        if options.has(DiscoveryOption::SlaveReadOnly) && role == Role::Slave {
            read_config(conn, "slave-read-only", &mut config).await?;
        }
        if options.has(DiscoveryOption::SaveConfig) {
            read_config(conn, "save", &mut config).await?;
        }
        if options.has(DiscoveryOption::SlavePriority) {
            read_config(conn, "slave-priority", &mut config).await?;
        }

        let mut info = BTreeMap::new();
        if options.has(DiscoveryOption::ReplicationInfo) && role == Role::Slave {
            let raw = conn.info(Some("replication")).await?;
            info = select_info_fields(&raw, &REPLICATION_INFO_KEYS);
        }

        self.config = config;
        self.info = info;
        Ok(())
    }

    /// Whether RDB snapshots are enabled, according to the discovered `save`
    /// config. `None` when the key was not discovered.
    pub fn persistence_enabled(&self) -> Option<bool> {
        self.config.get("save").map(|v| !v.trim().is_empty())
    }

    /// Status projection of this server.
    pub fn details(&self) -> RedisServerDetails {
        RedisServerDetails {
            role: self.role,
            address: self.id(),
            alias: self.alias(),
            config: self.config.clone(),
            info: self.info.clone(),
        }
    }

    pub async fn ping(&self) -> Result<(), RedisError> {
        let conn = self.connection().await?;
        self.server.checked(&conn, conn.ping().await).await
    }

    pub async fn config_get(&self, key: &str) -> Result<Option<String>, RedisError> {
        let conn = self.connection().await?;
        self.server.checked(&conn, conn.config_get(key).await).await
    }

    pub async fn config_set(&self, key: &str, value: &str) -> Result<(), RedisError> {
        let conn = self.connection().await?;
        self.server.checked(&conn, conn.config_set(key, value).await).await
    }

    pub async fn info_section(&self, section: &str) -> Result<String, RedisError> {
        let conn = self.connection().await?;
        self.server.checked(&conn, conn.info(Some(section)).await).await
    }

    pub async fn bgsave(&self) -> Result<(), RedisError> {
        let conn = self.connection().await?;
        self.server.checked(&conn, conn.bgsave().await).await
    }

    pub async fn last_save(&self) -> Result<i64, RedisError> {
        let conn = self.connection().await?;
        self.server.checked(&conn, conn.last_save().await).await
    }

    /// Point this server at a new master.
    pub async fn slave_of(&self, host: &str, port: u16) -> Result<(), RedisError> {
        let conn = self.connection().await?;
        self.server.checked(&conn, conn.slave_of(Some((host, port))).await).await
    }

    /// Promote this server (`SLAVEOF NO ONE`).
    pub async fn promote(&self) -> Result<(), RedisError> {
        let conn = self.connection().await?;
        self.server.checked(&conn, conn.slave_of(None).await).await
    }

    pub async fn debug_sleep(&self, duration: Duration) -> Result<(), RedisError> {
        let conn = self.connection().await?;
        self.server.checked(&conn, conn.debug_sleep(duration).await).await
    }
}

async fn read_config(
    conn: &dyn Connection,
    key: &str,
    into: &mut BTreeMap<String, String>,
) -> Result<(), RedisError> {
    if let Some(value) = conn.config_get(key).await? {
        into.insert(key.to_string(), value);
    }
    Ok(())
}
