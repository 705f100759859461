//! A named group of Redis servers: one master and its replicas.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, instrument};

use super::discovery::{DiscoveryError, DiscoveryErrors, DiscoveryOptions};
use super::redis_server::RedisServer;
use super::sentinel_server::SentinelServer;
use super::status::MonitoredShard;
use crate::redis::client::RedisError;
use crate::redis::parsing::join_host_port;
use crate::redis::server::ServerPool;
use crate::redis::types::Role;

/// One shard of a cluster.
#[derive(Clone)]
pub struct Shard {
    name: String,
    servers: Vec<RedisServer>,
    pool: Arc<ServerPool>,
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("name", &self.name)
            .field("servers", &self.servers)
            .finish()
    }
}

impl Shard {
    /// An empty shard. Members are added by Sentinel driven discovery.
    pub fn new(name: impl Into<String>, pool: Arc<ServerPool>) -> Self {
        Self {
            name: name.into(),
            servers: Vec::new(),
            pool,
        }
    }

    /// A shard from a list of `redis://host:port` connection strings, in order.
    pub fn from_connection_strings(
        name: impl Into<String>,
        connection_strings: &[String],
        pool: Arc<ServerPool>,
    ) -> Result<Self, RedisError> {
        let servers = connection_strings
            .iter()
            .map(|uri| pool.get_server(uri, None).map(RedisServer::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            name: name.into(),
            servers,
            pool,
        })
    }

    /// A shard from an alias to connection string map. Members are ordered
    /// by alias, so pod ordinals map to indexes.
    pub fn from_aliases(
        name: impl Into<String>,
        members: &BTreeMap<String, String>,
        pool: Arc<ServerPool>,
    ) -> Result<Self, RedisError> {
        let servers = members
            .iter()
            .map(|(alias, uri)| pool.get_server(uri, Some(alias)).map(RedisServer::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            name: name.into(),
            servers,
            pool,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn servers(&self) -> &[RedisServer] {
        &self.servers
    }

    /// The current master, if exactly one member holds the role.
    pub fn get_master(&self) -> Option<&RedisServer> {
        let mut masters = self.servers.iter().filter(|s| s.role() == Role::Master);
        match (masters.next(), masters.next()) {
            (Some(master), None) => Some(master),
            _ => None,
        }
    }

    pub fn get_slaves(&self) -> Vec<&RedisServer> {
        self.servers
            .iter()
            .filter(|s| s.role() == Role::Slave)
            .collect()
    }

    pub fn get_server_by_id(&self, id: &str) -> Option<&RedisServer> {
        self.servers.iter().find(|s| s.id() == id)
    }

    pub fn get_server_by_alias(&self, alias: &str) -> Option<&RedisServer> {
        self.servers
            .iter()
            .find(|s| s.alias().as_deref() == Some(alias))
    }

    /// Member at a positional index (a pod ordinal).
    pub fn get_server_by_index(&self, index: usize) -> Option<&RedisServer> {
        self.servers.get(index)
    }

    /// Member for `host:port`, registered in the pool and appended to the
    /// shard when unknown.
    pub fn get_or_add_server(&mut self, host: &str, port: u16, alias: Option<&str>) -> &mut RedisServer {
        let id = join_host_port(host, port);
        let position = match self.servers.iter().position(|s| s.id() == id) {
            Some(position) => position,
            None => {
                let server = self.pool.get_server_by_address(host, port, alias);
                debug!(shard = %self.name, server = %id, "Server added to shard");
                self.servers.push(RedisServer::new(server));
                self.servers.len() - 1
            }
        };
        &mut self.servers[position]
    }

    /// Refresh every member.
    ///
    /// Without a Sentinel the known members are queried directly. With one,
    /// Sentinel is the source of truth for which server is master and which
    /// are slaves, and members Sentinel reports that are not known yet are
    /// added to the shard.
    #[instrument(skip_all, fields(shard = %self.name))]
    pub async fn discover(
        &mut self,
        sentinel: Option<&SentinelServer>,
        options: &DiscoveryOptions,
    ) -> Result<(), DiscoveryErrors> {
        match sentinel {
            None => self.direct_discover(options).await,
            Some(sentinel) => self.sentinel_discover(sentinel, options).await,
        }
    }

    async fn discover_members(
        &mut self,
        options: &DiscoveryOptions,
    ) -> BTreeMap<String, Result<(), RedisError>> {
        let results = join_all(self.servers.iter_mut().map(|server| async move {
            let result = server.discover(options).await;
            (server.id(), result)
        }))
        .await;
        results.into_iter().collect()
    }

    async fn direct_discover(&mut self, options: &DiscoveryOptions) -> Result<(), DiscoveryErrors> {
        let mut results = self.discover_members(options).await;
        let mut errors = DiscoveryErrors::new();

        for server in &self.servers {
            let id = server.id();
            match results.remove(&id) {
                Some(Err(source)) => errors.push(DiscoveryError::ServerFailure {
                    shard: self.name.clone(),
                    server: id,
                    source,
                }),
                _ if server.awaiting_reconfiguration() => {
                    errors.push(self.failover_in_progress(server))
                }
                _ => {}
            }
        }

        let masters: Vec<String> = self
            .servers
            .iter()
            .filter(|s| s.role() == Role::Master)
            .map(RedisServer::id)
            .collect();
        if masters.len() > 1 {
            errors.push(DiscoveryError::InconsistentMasters {
                shard: self.name.clone(),
                masters,
            });
        }

        errors.into_result()
    }

    async fn sentinel_discover(
        &mut self,
        sentinel: &SentinelServer,
        options: &DiscoveryOptions,
    ) -> Result<(), DiscoveryErrors> {
        let sentinel_failure = |source| DiscoveryError::SentinelFailure {
            shard: Some(self.name.clone()),
            source,
        };
        let master = sentinel.master(&self.name).await.map_err(sentinel_failure)?;
        let slaves = sentinel.slaves(&self.name).await.map_err(sentinel_failure)?;

        let master_id = self.get_or_add_server(&master.ip, master.port, None).id();
        let slave_ids: BTreeSet<String> = slaves
            .iter()
            .map(|slave| self.get_or_add_server(&slave.ip, slave.port, None).id())
            .collect();

        let mut results = self.discover_members(options).await;
        let mut errors = DiscoveryErrors::new();

        for server in &self.servers {
            let id = server.id();
            let result = results.remove(&id).unwrap_or(Ok(()));

            if id == master_id {
                let failure = match result {
                    Err(source) => Some(source),
                    Ok(()) if server.role() != Role::Master => Some(role_mismatch(Role::Master, server.role())),
                    Ok(()) => None,
                };
                if let Some(source) = failure {
                    errors.push(DiscoveryError::MasterFailure {
                        shard: self.name.clone(),
                        server: id,
                        source,
                    });
                }
            } else if slave_ids.contains(&id) {
                if server.awaiting_reconfiguration() {
                    errors.push(self.failover_in_progress(server));
                    continue;
                }
                let failure = match result {
                    Err(source) => Some(source),
                    Ok(()) if server.role() != Role::Slave => Some(role_mismatch(Role::Slave, server.role())),
                    Ok(()) => None,
                };
                if let Some(source) = failure {
                    errors.push(DiscoveryError::SlaveFailure {
                        shard: self.name.clone(),
                        server: id,
                        source,
                    });
                }
            } else if let Err(source) = result {
                // Known locally but not reported by Sentinel.
                errors.push(DiscoveryError::ServerFailure {
                    shard: self.name.clone(),
                    server: id,
                    source,
                });
            }
        }

        errors.into_result()
    }

    fn failover_in_progress(&self, server: &RedisServer) -> DiscoveryError {
        DiscoveryError::SlaveFailoverInProgress {
            shard: self.name.clone(),
            server: server.id(),
            master: server.master_address().unwrap_or_default(),
        }
    }

    /// Status projection of this shard.
    pub fn to_status(&self) -> MonitoredShard {
        MonitoredShard {
            name: self.name.clone(),
            servers: self.servers.iter().map(|s| (s.id(), s.details())).collect(),
        }
    }
}

fn role_mismatch(expected: Role, actual: Role) -> RedisError {
    RedisError::UnexpectedReply {
        command: "ROLE".to_string(),
        reply: format!("expected {}, server reports {}", expected, actual),
    }
}
