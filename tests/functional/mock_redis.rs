//! In-memory Redis and Sentinel processes for functional tests.
//!
//! `MockRedis` implements the `Connector` seam of the coordination layer.
//! Each endpoint (`host:port`) is either a Redis server with a role, config
//! and `INFO replication` text, or a Sentinel with its view of the monitored
//! shards. Tests mutate that state to simulate failovers, unreachable
//! endpoints and Sentinel events, then drive the real discovery, monitor,
//! watcher and gatherer code against it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use saas_operator::redis::client::{PubSubMessage, Subscription};
use saas_operator::redis::types::{RoleReply, SentinelMasterInfo, SentinelSlaveInfo};
use saas_operator::redis::{Connection, Connector, RedisError};

/// State of one simulated endpoint.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Redis {
        role: RoleReply,
        config: HashMap<String, String>,
        replication_info: String,
    },
    Sentinel {
        masters: BTreeMap<String, SentinelMasterInfo>,
        slaves: BTreeMap<String, Vec<SentinelSlaveInfo>>,
    },
}

/// A `SENTINEL MONITOR` call recorded by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorCall {
    pub sentinel: String,
    pub shard: String,
    pub master: String,
    pub quorum: u32,
}

#[derive(Default)]
struct State {
    endpoints: HashMap<String, Endpoint>,
    /// Endpoints refusing connections and failing every command.
    unreachable: HashSet<String>,
    /// Endpoints whose commands never return.
    hanging: HashSet<String>,
    /// Bumped on every restart; connections opened before it fail.
    generations: HashMap<String, u64>,
    /// Endpoints whose next `SENTINEL SET` fails.
    failing_sets: HashSet<String>,
    connects: HashMap<String, usize>,
    monitor_calls: Vec<MonitorCall>,
    sentinel_sets: Vec<(String, String, String, String)>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<PubSubMessage>>>,
    closed_subscriptions: HashMap<String, usize>,
}

/// Shared handle to the simulated processes.
#[derive(Clone, Default)]
pub struct MockRedis {
    state: Arc<Mutex<State>>,
}

fn split(id: &str) -> (String, u16) {
    let (host, port) = id.rsplit_once(':').expect("id must be host:port");
    (host.to_string(), port.parse().expect("port must be numeric"))
}

impl MockRedis {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    pub fn add_master(&self, id: &str) -> &Self {
        self.lock().endpoints.insert(
            id.to_string(),
            Endpoint::Redis {
                role: RoleReply::Master,
                config: default_config(),
                replication_info: "# Replication\r\nrole:master\r\nconnected_slaves:0\r\n".to_string(),
            },
        );
        self
    }

    pub fn add_slave(&self, id: &str, master: &str) -> &Self {
        let (master_host, master_port) = split(master);
        self.lock().endpoints.insert(
            id.to_string(),
            Endpoint::Redis {
                role: RoleReply::Slave {
                    master_host: master_host.clone(),
                    master_port,
                    state: "connected".to_string(),
                },
                config: default_config(),
                replication_info: format!(
                    "# Replication\r\nrole:slave\r\nmaster_host:{}\r\nmaster_port:{}\r\nmaster_link_status:up\r\nmaster_last_io_seconds_ago:1\r\nmaster_sync_in_progress:0\r\nslave_repl_offset:1234\r\n",
                    master_host, master_port
                ),
            },
        );
        self
    }

    pub fn add_sentinel(&self, id: &str) -> &Self {
        self.lock().endpoints.insert(
            id.to_string(),
            Endpoint::Sentinel {
                masters: BTreeMap::new(),
                slaves: BTreeMap::new(),
            },
        );
        self
    }

    /// Make `sentinel` monitor `shard` with the given master and slaves.
    pub fn sentinel_view(&self, sentinel: &str, shard: &str, master: &str, slaves: &[&str]) -> &Self {
        let mut state = self.lock();
        let Some(Endpoint::Sentinel {
            masters,
            slaves: slave_map,
        }) = state.endpoints.get_mut(sentinel)
        else {
            panic!("{} is not a sentinel", sentinel);
        };
        masters.insert(shard.to_string(), master_info(shard, master, slaves.len()));
        slave_map.insert(
            shard.to_string(),
            slaves.iter().map(|s| slave_info(s, master)).collect(),
        );
        self
    }

    /// Promote `new_master` and point every other listed server at it, on
    /// the servers and in every Sentinel view of `shard`.
    pub fn failover(&self, shard: &str, new_master: &str, slaves: &[&str]) {
        self.add_master(new_master);
        for slave in slaves {
            self.add_slave(slave, new_master);
        }
        let sentinels: Vec<String> = {
            let state = self.lock();
            state
                .endpoints
                .iter()
                .filter_map(|(id, e)| match e {
                    Endpoint::Sentinel { masters, .. } if masters.contains_key(shard) => {
                        Some(id.clone())
                    }
                    _ => None,
                })
                .collect()
        };
        for sentinel in sentinels {
            self.sentinel_view(&sentinel, shard, new_master, slaves);
        }
    }

    pub fn set_config(&self, id: &str, key: &str, value: &str) {
        if let Some(Endpoint::Redis { config, .. }) = self.lock().endpoints.get_mut(id) {
            config.insert(key.to_string(), value.to_string());
        }
    }

    pub fn set_unreachable(&self, id: &str, unreachable: bool) {
        let mut state = self.lock();
        if unreachable {
            state.unreachable.insert(id.to_string());
        } else {
            state.unreachable.remove(id);
        }
    }

    pub fn set_hanging(&self, id: &str) {
        self.lock().hanging.insert(id.to_string());
    }

    /// Restart an endpoint: every open connection and subscription to it
    /// breaks, new ones succeed.
    pub fn restart(&self, id: &str) {
        let mut state = self.lock();
        *state.generations.entry(id.to_string()).or_default() += 1;
        state.subscribers.remove(id);
    }

    /// Fail the next `SENTINEL SET` sent to `sentinel`.
    pub fn fail_next_set(&self, sentinel: &str) {
        self.lock().failing_sets.insert(sentinel.to_string());
    }

    pub fn connect_count(&self, id: &str) -> usize {
        self.lock().connects.get(id).copied().unwrap_or(0)
    }

    pub fn monitor_calls(&self) -> Vec<MonitorCall> {
        self.lock().monitor_calls.clone()
    }

    /// `SENTINEL SET` calls as `(sentinel, shard, parameter, value)`.
    pub fn sentinel_sets(&self) -> Vec<(String, String, String, String)> {
        self.lock().sentinel_sets.clone()
    }

    pub fn monitored_shards(&self, sentinel: &str) -> Vec<String> {
        match self.lock().endpoints.get(sentinel) {
            Some(Endpoint::Sentinel { masters, .. }) => masters.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Live subscriptions on an endpoint.
    pub fn subscriber_count(&self, id: &str) -> usize {
        let mut state = self.lock();
        let senders = state.subscribers.entry(id.to_string()).or_default();
        senders.retain(|tx| !tx.is_closed());
        senders.len()
    }

    pub fn closed_subscriptions(&self, id: &str) -> usize {
        self.lock().closed_subscriptions.get(id).copied().unwrap_or(0)
    }

    /// Deliver a pub/sub message to every live subscription of an endpoint.
    pub fn publish(&self, id: &str, channel: &str, payload: &str) -> usize {
        let mut state = self.lock();
        let senders = state.subscribers.entry(id.to_string()).or_default();
        senders.retain(|tx| {
            tx.send(PubSubMessage {
                channel: channel.to_string(),
                payload: payload.to_string(),
            })
            .is_ok()
        });
        senders.len()
    }

    /// End every subscription of an endpoint, as a dropped connection would.
    pub fn drop_subscriptions(&self, id: &str) {
        self.lock().subscribers.remove(id);
    }

    fn check(&self, id: &str) -> Result<bool, RedisError> {
        let state = self.lock();
        if state.unreachable.contains(id) {
            return Err(RedisError::Connection(format!("{} unreachable", id)));
        }
        Ok(state.hanging.contains(id))
    }

    fn generation(&self, id: &str) -> u64 {
        self.lock().generations.get(id).copied().unwrap_or(0)
    }

    fn with_redis<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut RoleReply, &mut HashMap<String, String>, &mut String) -> T,
    ) -> Result<T, RedisError> {
        match self.lock().endpoints.get_mut(id) {
            Some(Endpoint::Redis {
                role,
                config,
                replication_info,
            }) => Ok(f(role, config, replication_info)),
            _ => Err(RedisError::Connection(format!("{} is not a redis server", id))),
        }
    }

    fn with_sentinel<T>(
        &self,
        id: &str,
        f: impl FnOnce(
            &mut BTreeMap<String, SentinelMasterInfo>,
            &mut BTreeMap<String, Vec<SentinelSlaveInfo>>,
        ) -> Result<T, RedisError>,
    ) -> Result<T, RedisError> {
        match self.lock().endpoints.get_mut(id) {
            Some(Endpoint::Sentinel { masters, slaves }) => f(masters, slaves),
            _ => Err(RedisError::Connection(format!("{} is not a sentinel", id))),
        }
    }
}

fn default_config() -> HashMap<String, String> {
    [
        ("save", "900 1 300 10"),
        ("slave-read-only", "yes"),
        ("slave-priority", "100"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

pub fn master_info(shard: &str, master: &str, slaves: usize) -> SentinelMasterInfo {
    let (ip, port) = split(master);
    SentinelMasterInfo {
        name: shard.to_string(),
        ip,
        port,
        flags: vec!["master".to_string()],
        link_pending_commands: Some(0),
        last_ok_ping_reply: Some(250),
        role_reported: Some("master".to_string()),
        role_reported_time: Some(100_000),
        num_slaves: Some(i64::try_from(slaves).unwrap()),
        num_other_sentinels: Some(2),
        quorum: Some(2),
    }
}

pub fn slave_info(slave: &str, master: &str) -> SentinelSlaveInfo {
    let (ip, port) = split(slave);
    let (master_host, master_port) = split(master);
    SentinelSlaveInfo {
        name: slave.to_string(),
        ip,
        port,
        flags: vec!["slave".to_string()],
        link_pending_commands: Some(0),
        last_ok_ping_reply: Some(300),
        role_reported_time: Some(90_000),
        master_link_down_time: Some(0),
        master_link_status: Some("ok".to_string()),
        master_host: Some(master_host),
        master_port: Some(i64::from(master_port)),
        slave_priority: Some(100),
        slave_repl_offset: Some(4242),
    }
}

#[async_trait]
impl Connector for MockRedis {
    async fn connect(&self, host: &str, port: u16) -> Result<Arc<dyn Connection>, RedisError> {
        let id = format!("{}:{}", host, port);
        self.check(&id)?;
        *self.lock().connects.entry(id.clone()).or_default() += 1;
        Ok(Arc::new(MockConnection {
            generation: self.generation(&id),
            id,
            mock: self.clone(),
        }))
    }

    async fn subscribe(
        &self,
        host: &str,
        port: u16,
        _patterns: &[String],
    ) -> Result<Box<dyn Subscription>, RedisError> {
        let id = format!("{}:{}", host, port);
        self.check(&id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.entry(id.clone()).or_default().push(tx);
        Ok(Box::new(MockSubscription {
            id,
            rx,
            mock: self.clone(),
        }))
    }
}

struct MockConnection {
    id: String,
    generation: u64,
    mock: MockRedis,
}

impl MockConnection {
    /// Fail when unreachable or opened before a restart, never return when
    /// hanging.
    async fn guard(&self) -> Result<(), RedisError> {
        if self.mock.generation(&self.id) != self.generation {
            return Err(RedisError::Connection(format!(
                "{} connection reset by peer",
                self.id
            )));
        }
        if self.mock.check(&self.id)? {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn ping(&self) -> Result<(), RedisError> {
        self.guard().await
    }

    async fn role(&self) -> Result<RoleReply, RedisError> {
        self.guard().await?;
        match self.mock.lock().endpoints.get(&self.id) {
            Some(Endpoint::Redis { role, .. }) => Ok(role.clone()),
            Some(Endpoint::Sentinel { .. }) => Ok(RoleReply::Sentinel),
            None => Err(RedisError::Connection(format!("{} unknown", self.id))),
        }
    }

    async fn config_get(&self, key: &str) -> Result<Option<String>, RedisError> {
        self.guard().await?;
        self.mock.with_redis(&self.id, |_, config, _| config.get(key).cloned())
    }

    async fn config_set(&self, key: &str, value: &str) -> Result<(), RedisError> {
        self.guard().await?;
        self.mock.with_redis(&self.id, |_, config, _| {
            config.insert(key.to_string(), value.to_string());
        })
    }

    async fn info(&self, section: Option<&str>) -> Result<String, RedisError> {
        self.guard().await?;
        assert_eq!(section, Some("replication"), "only INFO replication is simulated");
        self.mock.with_redis(&self.id, |_, _, info| info.clone())
    }

    async fn bgsave(&self) -> Result<(), RedisError> {
        self.guard().await
    }

    async fn last_save(&self) -> Result<i64, RedisError> {
        self.guard().await?;
        Ok(1_700_000_000)
    }

    async fn slave_of(&self, master: Option<(&str, u16)>) -> Result<(), RedisError> {
        self.guard().await?;
        self.mock.with_redis(&self.id, |role, _, _| {
            *role = match master {
                Some((host, port)) => RoleReply::Slave {
                    master_host: host.to_string(),
                    master_port: port,
                    state: "connect".to_string(),
                },
                None => RoleReply::Master,
            };
        })
    }

    async fn debug_sleep(&self, _duration: Duration) -> Result<(), RedisError> {
        self.guard().await
    }

    async fn sentinel_masters(&self) -> Result<Vec<SentinelMasterInfo>, RedisError> {
        self.guard().await?;
        self.mock
            .with_sentinel(&self.id, |masters, _| Ok(masters.values().cloned().collect()))
    }

    async fn sentinel_master(&self, shard: &str) -> Result<SentinelMasterInfo, RedisError> {
        self.guard().await?;
        self.mock.with_sentinel(&self.id, |masters, _| {
            masters
                .get(shard)
                .cloned()
                .ok_or_else(|| RedisError::UnknownShard(shard.to_string()))
        })
    }

    async fn sentinel_get_master_addr_by_name(
        &self,
        shard: &str,
    ) -> Result<Option<(String, u16)>, RedisError> {
        self.guard().await?;
        self.mock.with_sentinel(&self.id, |masters, _| {
            Ok(masters.get(shard).map(|m| (m.ip.clone(), m.port)))
        })
    }

    async fn sentinel_slaves(&self, shard: &str) -> Result<Vec<SentinelSlaveInfo>, RedisError> {
        self.guard().await?;
        self.mock.with_sentinel(&self.id, |masters, slaves| {
            if !masters.contains_key(shard) {
                return Err(RedisError::UnknownShard(shard.to_string()));
            }
            Ok(slaves.get(shard).cloned().unwrap_or_default())
        })
    }

    async fn sentinel_monitor(
        &self,
        shard: &str,
        host: &str,
        port: u16,
        quorum: u32,
    ) -> Result<(), RedisError> {
        self.guard().await?;
        let master = format!("{}:{}", host, port);
        self.mock.with_sentinel(&self.id, |masters, slaves| {
            masters.insert(shard.to_string(), master_info(shard, &master, 0));
            slaves.entry(shard.to_string()).or_default();
            Ok(())
        })?;
        self.mock.lock().monitor_calls.push(MonitorCall {
            sentinel: self.id.clone(),
            shard: shard.to_string(),
            master,
            quorum,
        });
        Ok(())
    }

    async fn sentinel_set(&self, shard: &str, parameter: &str, value: &str) -> Result<(), RedisError> {
        self.guard().await?;
        let mut state = self.mock.lock();
        if state.failing_sets.remove(&self.id) {
            return Err(RedisError::UnexpectedReply {
                command: "SENTINEL SET".to_string(),
                reply: "ERR simulated failure".to_string(),
            });
        }
        state.sentinel_sets.push((
            self.id.clone(),
            shard.to_string(),
            parameter.to_string(),
            value.to_string(),
        ));
        Ok(())
    }

    async fn close(&self) {}
}

struct MockSubscription {
    id: String,
    rx: mpsc::UnboundedReceiver<PubSubMessage>,
    mock: MockRedis,
}

#[async_trait]
impl Subscription for MockSubscription {
    async fn next_message(&mut self) -> Option<PubSubMessage> {
        self.rx.recv().await
    }

    async fn close(self: Box<Self>) {
        *self
            .mock
            .lock()
            .closed_subscriptions
            .entry(self.id.clone())
            .or_default() += 1;
    }
}

/// How long [`eventually`] polls. Longer than any retry delay of the
/// background tasks, so paused-time tests can wait out a backoff.
pub const EVENTUALLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll `condition` until it holds, panicking after [`EVENTUALLY_TIMEOUT`].
pub async fn eventually<F>(what: &str, condition: F)
where
    F: FnMut() -> bool,
{
    eventually_within(what, EVENTUALLY_TIMEOUT, condition).await;
}

/// Poll `condition` every 10ms until it holds, panicking after `timeout`.
pub async fn eventually_within<F>(what: &str, timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let step = Duration::from_millis(10);
    let mut waited = Duration::ZERO;
    while waited < timeout {
        if condition() {
            return;
        }
        tokio::time::sleep(step).await;
        waited += step;
    }
    if condition() {
        return;
    }
    panic!("timed out waiting for {} after {:?}", what, timeout);
}
