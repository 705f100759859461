//! A Sentinel process and the admin commands issued against it.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, instrument, warn};

use super::discovery::{DiscoveryOption, DiscoveryOptions};
use super::shard::Shard;
use crate::redis::client::{Connection, RedisError, Subscription};
use crate::redis::parsing::join_host_port;
use crate::redis::server::{Server, ServerPool};
use crate::redis::types::{SentinelMasterInfo, SentinelSlaveInfo};

/// Milliseconds without a valid reply before Sentinel flags an instance down.
pub const DOWN_AFTER_MILLISECONDS: &str = "5000";
/// Failover timeout set on every newly monitored shard, in milliseconds.
pub const FAILOVER_TIMEOUT: &str = "10000";

/// Handle to one Sentinel process.
#[derive(Clone, Debug)]
pub struct SentinelServer {
    server: Arc<Server>,
}

impl SentinelServer {
    pub fn new(server: Arc<Server>) -> Self {
        Self { server }
    }

    /// Look up the Sentinel behind a connection string in the pool.
    pub fn from_connection_string(
        pool: &ServerPool,
        connection_string: &str,
        alias: Option<&str>,
    ) -> Result<Self, RedisError> {
        Ok(Self::new(pool.get_server(connection_string, alias)?))
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn id(&self) -> String {
        self.server.id()
    }

    pub fn alias(&self) -> Option<String> {
        self.server.alias()
    }

    pub fn display_name(&self) -> String {
        self.server.display_name()
    }

    async fn connection(&self) -> Result<Arc<dyn Connection>, RedisError> {
        self.server.connection().await
    }

    pub async fn ping(&self) -> Result<(), RedisError> {
        let conn = self.connection().await?;
        self.server.checked(&conn, conn.ping().await).await
    }

    /// Every shard this Sentinel monitors.
    pub async fn masters(&self) -> Result<Vec<SentinelMasterInfo>, RedisError> {
        let conn = self.connection().await?;
        self.server.checked(&conn, conn.sentinel_masters().await).await
    }

    /// Sentinel's view of one shard's master.
    pub async fn master(&self, shard: &str) -> Result<SentinelMasterInfo, RedisError> {
        let conn = self.connection().await?;
        self.server.checked(&conn, conn.sentinel_master(shard).await).await
    }

    pub async fn get_master_addr_by_name(
        &self,
        shard: &str,
    ) -> Result<Option<(String, u16)>, RedisError> {
        let conn = self.connection().await?;
        self.server.checked(&conn, conn.sentinel_get_master_addr_by_name(shard).await).await
    }

    pub async fn slaves(&self, shard: &str) -> Result<Vec<SentinelSlaveInfo>, RedisError> {
        let conn = self.connection().await?;
        self.server.checked(&conn, conn.sentinel_slaves(shard).await).await
    }

    pub async fn monitor_shard(
        &self,
        shard: &str,
        host: &str,
        port: u16,
        quorum: u32,
    ) -> Result<(), RedisError> {
        let conn = self.connection().await?;
        self.server.checked(&conn, conn.sentinel_monitor(shard, host, port, quorum).await).await
    }

    pub async fn set(&self, shard: &str, parameter: &str, value: &str) -> Result<(), RedisError> {
        let conn = self.connection().await?;
        self.server.checked(&conn, conn.sentinel_set(shard, parameter, value).await).await
    }

    /// Open a dedicated pattern subscription.
    pub async fn psubscribe(&self, patterns: &[String]) -> Result<Box<dyn Subscription>, RedisError> {
        self.server.psubscribe(patterns).await
    }

    /// Whether every named shard is monitored. A Sentinel that monitors
    /// nothing is never considered to monitor the shards.
    pub async fn is_monitoring_shards(&self, shards: &[String]) -> Result<bool, RedisError> {
        let monitored: HashSet<String> = self.masters().await?.into_iter().map(|m| m.name).collect();
        if monitored.is_empty() {
            return Ok(false);
        }
        Ok(shards.iter().all(|s| monitored.contains(s)))
    }

    /// Make sure this Sentinel monitors and tunes every shard.
    ///
    /// Unmonitored shards are discovered directly to find their master, then
    /// registered with `quorum`. Every shard, new or known, gets its
    /// `down-after-milliseconds` and `failover-timeout` applied, so a tuning
    /// step that failed earlier is retried on the next pass. Returns the
    /// names of the shards newly monitored.
    #[instrument(skip_all, fields(sentinel = %self.display_name()))]
    pub async fn monitor(&self, shards: &mut [Shard], quorum: u32) -> Result<Vec<String>, RedisError> {
        let mut changed = Vec::new();

        for shard in shards.iter_mut() {
            let known = match self.master(shard.name()).await {
                Ok(_) => true,
                Err(RedisError::UnknownShard(_)) => false,
                Err(e) => return Err(e),
            };

            if !known {
                let options = DiscoveryOptions::new().with(DiscoveryOption::SlaveReadOnly);
                if let Err(errors) = shard.discover(None, &options).await {
                    warn!(shard = %shard.name(), errors = %errors, "Discovery before monitor reported errors");
                }
                let (host, port) = shard
                    .get_master()
                    .map(|m| (m.host().to_string(), m.port()))
                    .ok_or_else(|| RedisError::NoMaster(shard.name().to_string()))?;

                self.monitor_shard(shard.name(), &host, port, quorum).await?;
                info!(shard = %shard.name(), master = %join_host_port(&host, port), quorum, "Shard monitored");
                changed.push(shard.name().to_string());
            }

            self.set(shard.name(), "down-after-milliseconds", DOWN_AFTER_MILLISECONDS)
                .await?;
            self.set(shard.name(), "failover-timeout", FAILOVER_TIMEOUT)
                .await?;
        }

        Ok(changed)
    }
}
