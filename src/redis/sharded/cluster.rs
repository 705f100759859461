//! All shards and Sentinels of one monitored group.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::future::join_all;
use futures::stream::FuturesUnordered;
use tracing::{debug, instrument, warn};

use super::discovery::{DiscoveryError, DiscoveryErrors, DiscoveryOptions};
use super::redis_server::RedisServer;
use super::sentinel_server::SentinelServer;
use super::shard::Shard;
use super::status::{MonitoredShard, normalize};
use crate::redis::client::RedisError;
use crate::redis::server::ServerPool;

/// Topology key holding the alias to URI map of the Sentinels.
pub const SENTINEL_TOPOLOGY_KEY: &str = "sentinel";

/// Bound on the race for a healthy Sentinel.
pub const SENTINEL_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Shards and Sentinels of one group, each list kept sorted.
#[derive(Clone)]
pub struct Cluster {
    name: String,
    shards: Vec<Shard>,
    sentinels: Vec<SentinelServer>,
    pool: Arc<ServerPool>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("name", &self.name)
            .field("shards", &self.shards)
            .field("sentinels", &self.sentinel_ids())
            .finish()
    }
}

impl Cluster {
    /// Build from a topology map: shard name to alias to URI, plus the
    /// [`SENTINEL_TOPOLOGY_KEY`] entry mapping Sentinel aliases to URIs.
    pub fn from_topology(
        name: impl Into<String>,
        topology: &BTreeMap<String, BTreeMap<String, String>>,
        pool: Arc<ServerPool>,
    ) -> Result<Self, RedisError> {
        let mut shards = Vec::new();
        let mut sentinels = Vec::new();

        for (key, members) in topology {
            if key == SENTINEL_TOPOLOGY_KEY {
                for (alias, uri) in members {
                    sentinels.push(SentinelServer::from_connection_string(&pool, uri, Some(alias))?);
                }
            } else {
                shards.push(Shard::from_aliases(key.as_str(), members, pool.clone())?);
            }
        }

        let mut cluster = Self {
            name: name.into(),
            shards,
            sentinels,
            pool,
        };
        cluster.sort();
        Ok(cluster)
    }

    /// Build from the live topology one Sentinel reports: every monitored
    /// master and its slaves.
    #[instrument(skip(pool))]
    pub async fn from_sentinel(
        name: &str,
        sentinel_uri: &str,
        pool: Arc<ServerPool>,
    ) -> Result<Self, RedisError> {
        let sentinel = SentinelServer::from_connection_string(&pool, sentinel_uri, None)?;
        let mut shards = Vec::new();

        for master in sentinel.masters().await? {
            let mut shard = Shard::new(master.name.as_str(), pool.clone());
            shard.get_or_add_server(&master.ip, master.port, None);
            for slave in sentinel.slaves(&master.name).await? {
                shard.get_or_add_server(&slave.ip, slave.port, None);
            }
            shards.push(shard);
        }

        let mut cluster = Self {
            name: name.to_string(),
            shards,
            sentinels: vec![sentinel],
            pool,
        };
        cluster.sort();
        Ok(cluster)
    }

    fn sort(&mut self) {
        self.shards.sort_by(|a, b| a.name().cmp(b.name()));
        self.sentinels.sort_by_key(SentinelServer::id);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &Arc<ServerPool> {
        &self.pool
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    pub fn shards_mut(&mut self) -> &mut [Shard] {
        &mut self.shards
    }

    pub fn sentinels(&self) -> &[SentinelServer] {
        &self.sentinels
    }

    pub fn get_shard_by_name(&self, name: &str) -> Option<&Shard> {
        self.shards.iter().find(|s| s.name() == name)
    }

    pub fn shard_names(&self) -> Vec<String> {
        self.shards.iter().map(|s| s.name().to_string()).collect()
    }

    /// Find a server by `host:port` across every shard.
    pub fn lookup_server_by_id(&self, id: &str) -> Option<&RedisServer> {
        self.shards.iter().find_map(|s| s.get_server_by_id(id))
    }

    pub fn sentinel_ids(&self) -> Vec<String> {
        self.sentinels.iter().map(SentinelServer::id).collect()
    }

    /// Discover every shard from its known endpoints, concurrently.
    ///
    /// Every shard is discovered even when others fail; the aggregate keeps
    /// each shard scoped error.
    #[instrument(skip_all, fields(cluster = %self.name))]
    pub async fn discover(&mut self, options: &DiscoveryOptions) -> Result<(), DiscoveryErrors> {
        let results = join_all(
            self.shards
                .iter_mut()
                .map(|shard| shard.discover(None, options)),
        )
        .await;

        let mut errors = DiscoveryErrors::new();
        for result in results {
            if let Err(shard_errors) = result {
                errors.extend(shard_errors);
            }
        }
        errors.into_result()
    }

    /// Discover the topology as a healthy Sentinel sees it.
    ///
    /// Shards Sentinel monitors that are not tracked yet are added. Failing
    /// to reach any Sentinel, or Sentinel failing to list its masters, is
    /// fatal and returned alone.
    #[instrument(skip_all, fields(cluster = %self.name))]
    pub async fn sentinel_discover(&mut self, options: &DiscoveryOptions) -> Result<(), DiscoveryErrors> {
        let sentinel = self.get_sentinel().await.ok_or_else(|| {
            DiscoveryError::SentinelFailure {
                shard: None,
                source: RedisError::Timeout {
                    operation: "waiting for a healthy sentinel".to_string(),
                    duration: SENTINEL_PING_TIMEOUT,
                },
            }
        })?;

        let masters = sentinel
            .masters()
            .await
            .map_err(|source| DiscoveryError::SentinelFailure { shard: None, source })?;

        let monitored: BTreeSet<String> = masters.into_iter().map(|m| m.name).collect();
        for name in &monitored {
            if self.get_shard_by_name(name).is_none() {
                debug!(shard = %name, "Tracking shard reported by sentinel");
                self.shards.push(Shard::new(name.as_str(), self.pool.clone()));
            }
        }
        self.sort();

        let results = join_all(
            self.shards
                .iter_mut()
                .filter(|shard| monitored.contains(shard.name()))
                .map(|shard| shard.discover(Some(&sentinel), options)),
        )
        .await;

        let mut errors = DiscoveryErrors::new();
        for result in results {
            if let Err(shard_errors) = result {
                errors.extend(shard_errors);
            }
        }
        errors.into_result()
    }

    /// First Sentinel to answer a ping within [`SENTINEL_PING_TIMEOUT`].
    ///
    /// All Sentinels are pinged concurrently. Pings still in flight when a
    /// winner is found, or when the timeout expires, are dropped.
    pub async fn get_sentinel(&self) -> Option<SentinelServer> {
        let mut pings: FuturesUnordered<_> = self
            .sentinels
            .iter()
            .map(|sentinel| async move { sentinel.ping().await.map(|()| sentinel) })
            .collect();

        let race = async {
            while let Some(result) = pings.next().await {
                match result {
                    Ok(sentinel) => return Some(sentinel.clone()),
                    Err(e) => debug!(error = %e, "Sentinel ping failed"),
                }
            }
            None
        };

        match tokio::time::timeout(SENTINEL_PING_TIMEOUT, race).await {
            Ok(winner) => winner,
            Err(_) => {
                warn!(cluster = %self.name, "No sentinel answered in time");
                None
            }
        }
    }

    /// Status projection, shards sorted by name.
    pub fn to_status(&self) -> Vec<MonitoredShard> {
        normalize(self.shards.iter().map(Shard::to_status).collect())
    }
}
