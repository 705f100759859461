//! Redis/Sentinel client seam and its `fred` implementation.
//!
//! Every command the coordination layer issues goes through the
//! [`Connection`] trait so that the server model, discovery and the
//! background watchers can run against any [`Connector`]. Production code uses
//! [`FredConnector`], which opens one centralized `fred` client per endpoint
//! and a dedicated client per pub/sub subscription.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fred::cmd;
use fred::interfaces::{EventInterface, PubsubInterface};
use fred::prelude::*;
use fred::types::config::ReconnectPolicy;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, instrument, warn};

use super::parsing::ParseError;
use super::types::{RoleReply, SentinelMasterInfo, SentinelSlaveInfo};

/// Errors that can occur during Redis operations.
#[derive(Error, Debug)]
pub enum RedisError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Redis error: {0}")]
    Redis(#[from] fred::error::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Invalid connection string '{uri}': {reason}")]
    InvalidConnectionString { uri: String, reason: String },

    #[error("Unexpected reply to {command}: {reply}")]
    UnexpectedReply { command: String, reply: String },

    #[error("Timeout after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    #[error("No master found for shard {0}")]
    NoMaster(String),

    #[error("Sentinel does not monitor shard {0}")]
    UnknownShard(String),
}

impl RedisError {
    /// The connection the command ran on is unusable and should be reopened.
    pub fn is_connection_error(&self) -> bool {
        match self {
            RedisError::Connection(_) | RedisError::Timeout { .. } => true,
            RedisError::Redis(e) => matches!(
                e.kind(),
                fred::error::ErrorKind::IO
                    | fred::error::ErrorKind::Timeout
                    | fred::error::ErrorKind::Canceled
            ),
            _ => false,
        }
    }
}

/// A message received on a pattern subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: String,
}

/// Commands issued against one Redis or Sentinel process.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn ping(&self) -> Result<(), RedisError>;
    async fn role(&self) -> Result<RoleReply, RedisError>;
    /// `CONFIG GET <key>`; `None` when the server does not know the key.
    async fn config_get(&self, key: &str) -> Result<Option<String>, RedisError>;
    async fn config_set(&self, key: &str, value: &str) -> Result<(), RedisError>;
    /// `INFO [section]`, raw text.
    async fn info(&self, section: Option<&str>) -> Result<String, RedisError>;
    async fn bgsave(&self) -> Result<(), RedisError>;
    /// Unix timestamp of the last successful save.
    async fn last_save(&self) -> Result<i64, RedisError>;
    /// `SLAVEOF host port`, or `SLAVEOF NO ONE` when `master` is `None`.
    async fn slave_of(&self, master: Option<(&str, u16)>) -> Result<(), RedisError>;
    async fn debug_sleep(&self, duration: Duration) -> Result<(), RedisError>;

    async fn sentinel_masters(&self) -> Result<Vec<SentinelMasterInfo>, RedisError>;
    async fn sentinel_master(&self, shard: &str) -> Result<SentinelMasterInfo, RedisError>;
    async fn sentinel_get_master_addr_by_name(
        &self,
        shard: &str,
    ) -> Result<Option<(String, u16)>, RedisError>;
    async fn sentinel_slaves(&self, shard: &str) -> Result<Vec<SentinelSlaveInfo>, RedisError>;
    async fn sentinel_monitor(
        &self,
        shard: &str,
        host: &str,
        port: u16,
        quorum: u32,
    ) -> Result<(), RedisError>;
    async fn sentinel_set(&self, shard: &str, parameter: &str, value: &str)
    -> Result<(), RedisError>;

    async fn close(&self);
}

/// A live pattern subscription owning its own connection.
#[async_trait]
pub trait Subscription: Send {
    /// Next message, or `None` once the subscription is closed.
    async fn next_message(&mut self) -> Option<PubSubMessage>;
    /// Unsubscribe and close the underlying connection.
    async fn close(self: Box<Self>);
}

/// Opens connections to endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> Result<Arc<dyn Connection>, RedisError>;
    async fn subscribe(
        &self,
        host: &str,
        port: u16,
        patterns: &[String],
    ) -> Result<Box<dyn Subscription>, RedisError>;
}

/// Backoff bounds, in milliseconds, of the command client reconnect policy.
const RECONNECT_MIN_DELAY_MS: u32 = 100;
const RECONNECT_MAX_DELAY_MS: u32 = 30_000;

/// Connection settings shared by every endpoint.
#[derive(Clone, Debug)]
pub struct ConnectorConfig {
    /// Connection timeout.
    pub connection_timeout: Duration,
    /// Command timeout.
    pub command_timeout: Duration,
    /// Password for authentication.
    pub password: Option<String>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(30),
            password: None,
        }
    }
}

impl ConnectorConfig {
    /// Set password.
    pub fn with_password(mut self, password: String) -> Self {
        self.password = Some(password);
        self
    }

    /// Set connection timeout.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set command timeout.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }
}

/// [`Connector`] backed by `fred`.
#[derive(Clone, Debug, Default)]
pub struct FredConnector {
    config: ConnectorConfig,
}

impl FredConnector {
    pub fn new(config: ConnectorConfig) -> Self {
        Self { config }
    }

    /// Build a client for one endpoint. Command clients reconnect on their
    /// own; subscription clients do not, so a dropped connection ends the
    /// subscription and the watcher opens a fresh one.
    fn build_client(&self, host: &str, port: u16, reconnect: bool) -> Result<Client, RedisError> {
        let redis_config = Config {
            server: ServerConfig::Centralized {
                server: Server::new(host, port),
            },
            password: self.config.password.clone(),
            ..Default::default()
        };

        let command_timeout = self.config.command_timeout;
        let connection_timeout = self.config.connection_timeout;

        let mut builder = Builder::from_config(redis_config);
        builder
            .with_performance_config(|perf| {
                perf.default_command_timeout = command_timeout;
            })
            .with_connection_config(|conn| {
                conn.connection_timeout = connection_timeout;
            });
        if reconnect {
            builder.set_policy(ReconnectPolicy::new_exponential(
                0,
                RECONNECT_MIN_DELAY_MS,
                RECONNECT_MAX_DELAY_MS,
                2,
            ));
        }
        Ok(builder.build()?)
    }
}

#[async_trait]
impl Connector for FredConnector {
    #[instrument(skip(self))]
    async fn connect(&self, host: &str, port: u16) -> Result<Arc<dyn Connection>, RedisError> {
        let client = self.build_client(host, port, true)?;
        client.init().await?;
        debug!("Connected");
        Ok(Arc::new(FredConnection { client }))
    }

    #[instrument(skip(self))]
    async fn subscribe(
        &self,
        host: &str,
        port: u16,
        patterns: &[String],
    ) -> Result<Box<dyn Subscription>, RedisError> {
        let client = self.build_client(host, port, false)?;
        client.init().await?;
        // Take the receiver before subscribing so no message is missed.
        let rx = client.message_rx();
        client.psubscribe(patterns.to_vec()).await?;
        debug!("Subscribed");
        Ok(Box::new(FredSubscription {
            client,
            rx,
            patterns: patterns.to_vec(),
        }))
    }
}

/// Flatten a reply into its top-level scalar fields, skipping nested arrays.
fn value_to_fields(value: Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter(|v| !matches!(v, Value::Array(_)))
            .filter_map(|v| v.as_string())
            .collect(),
        Value::Null => Vec::new(),
        other => other.as_string().into_iter().collect(),
    }
}

/// Split an array-of-arrays reply into per-entry field lists.
fn value_to_entries(value: Value) -> Vec<Vec<String>> {
    match value {
        Value::Array(items) => items.into_iter().map(value_to_fields).collect(),
        _ => Vec::new(),
    }
}

fn is_unknown_master(err: &fred::error::Error) -> bool {
    err.details().contains("No such master")
}

/// [`Connection`] backed by a centralized `fred` client.
pub struct FredConnection {
    client: Client,
}

impl FredConnection {
    async fn call(&self, command: &'static str, args: Vec<String>) -> Result<Value, RedisError> {
        let value: Value = self.client.custom(cmd!(command), args).await?;
        Ok(value)
    }

    async fn call_ok(&self, command: &'static str, args: Vec<String>) -> Result<(), RedisError> {
        let value = self.call(command, args).await?;
        match value.as_str().as_deref() {
            Some("OK") | None => Ok(()),
            Some(_) if command == "BGSAVE" => Ok(()),
            Some(other) => Err(RedisError::UnexpectedReply {
                command: command.to_string(),
                reply: other.to_string(),
            }),
        }
    }
}

#[async_trait]
impl Connection for FredConnection {
    #[instrument(skip(self))]
    async fn ping(&self) -> Result<(), RedisError> {
        let _: String = self.client.ping(None).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn role(&self) -> Result<RoleReply, RedisError> {
        let fields = value_to_fields(self.call("ROLE", vec![]).await?);
        Ok(RoleReply::from_fields(&fields)?)
    }

    #[instrument(skip(self))]
    async fn config_get(&self, key: &str) -> Result<Option<String>, RedisError> {
        let fields = value_to_fields(
            self.call("CONFIG", vec!["GET".to_string(), key.to_string()])
                .await?,
        );
        Ok(fields.get(1).cloned())
    }

    #[instrument(skip(self))]
    async fn config_set(&self, key: &str, value: &str) -> Result<(), RedisError> {
        self.call_ok(
            "CONFIG",
            vec!["SET".to_string(), key.to_string(), value.to_string()],
        )
        .await
    }

    #[instrument(skip(self))]
    async fn info(&self, section: Option<&str>) -> Result<String, RedisError> {
        let args = section.map(|s| vec![s.to_string()]).unwrap_or_default();
        let value = self.call("INFO", args).await?;
        value.as_string().ok_or_else(|| RedisError::UnexpectedReply {
            command: "INFO".to_string(),
            reply: format!("{:?}", value),
        })
    }

    #[instrument(skip(self))]
    async fn bgsave(&self) -> Result<(), RedisError> {
        self.call_ok("BGSAVE", vec![]).await
    }

    #[instrument(skip(self))]
    async fn last_save(&self) -> Result<i64, RedisError> {
        let value = self.call("LASTSAVE", vec![]).await?;
        value.as_i64().ok_or_else(|| RedisError::UnexpectedReply {
            command: "LASTSAVE".to_string(),
            reply: format!("{:?}", value),
        })
    }

    #[instrument(skip(self))]
    async fn slave_of(&self, master: Option<(&str, u16)>) -> Result<(), RedisError> {
        let args = match master {
            Some((host, port)) => vec![host.to_string(), port.to_string()],
            None => vec!["NO".to_string(), "ONE".to_string()],
        };
        self.call_ok("SLAVEOF", args).await
    }

    #[instrument(skip(self))]
    async fn debug_sleep(&self, duration: Duration) -> Result<(), RedisError> {
        self.call_ok(
            "DEBUG",
            vec!["SLEEP".to_string(), duration.as_secs_f64().to_string()],
        )
        .await
    }

    #[instrument(skip(self))]
    async fn sentinel_masters(&self) -> Result<Vec<SentinelMasterInfo>, RedisError> {
        let entries = value_to_entries(self.call("SENTINEL", vec!["MASTERS".to_string()]).await?);
        entries
            .iter()
            .map(|fields| SentinelMasterInfo::from_fields(fields).map_err(RedisError::from))
            .collect()
    }

    #[instrument(skip(self))]
    async fn sentinel_master(&self, shard: &str) -> Result<SentinelMasterInfo, RedisError> {
        match self
            .call("SENTINEL", vec!["MASTER".to_string(), shard.to_string()])
            .await
        {
            Ok(value) => Ok(SentinelMasterInfo::from_fields(&value_to_fields(value))?),
            Err(RedisError::Redis(e)) if is_unknown_master(&e) => {
                Err(RedisError::UnknownShard(shard.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn sentinel_get_master_addr_by_name(
        &self,
        shard: &str,
    ) -> Result<Option<(String, u16)>, RedisError> {
        let fields = value_to_fields(
            self.call(
                "SENTINEL",
                vec!["GET-MASTER-ADDR-BY-NAME".to_string(), shard.to_string()],
            )
            .await?,
        );
        match fields.as_slice() {
            [] => Ok(None),
            [host, port] => {
                let port = port.parse().map_err(|_| ParseError::InvalidValue {
                    field: "port".to_string(),
                    value: port.clone(),
                })?;
                Ok(Some((host.clone(), port)))
            }
            other => Err(RedisError::UnexpectedReply {
                command: "SENTINEL GET-MASTER-ADDR-BY-NAME".to_string(),
                reply: other.join(" "),
            }),
        }
    }

    #[instrument(skip(self))]
    async fn sentinel_slaves(&self, shard: &str) -> Result<Vec<SentinelSlaveInfo>, RedisError> {
        let value = match self
            .call("SENTINEL", vec!["SLAVES".to_string(), shard.to_string()])
            .await
        {
            Ok(value) => value,
            Err(RedisError::Redis(e)) if is_unknown_master(&e) => {
                return Err(RedisError::UnknownShard(shard.to_string()));
            }
            Err(e) => return Err(e),
        };
        value_to_entries(value)
            .iter()
            .map(|fields| SentinelSlaveInfo::from_fields(fields).map_err(RedisError::from))
            .collect()
    }

    #[instrument(skip(self))]
    async fn sentinel_monitor(
        &self,
        shard: &str,
        host: &str,
        port: u16,
        quorum: u32,
    ) -> Result<(), RedisError> {
        self.call_ok(
            "SENTINEL",
            vec![
                "MONITOR".to_string(),
                shard.to_string(),
                host.to_string(),
                port.to_string(),
                quorum.to_string(),
            ],
        )
        .await
    }

    #[instrument(skip(self))]
    async fn sentinel_set(
        &self,
        shard: &str,
        parameter: &str,
        value: &str,
    ) -> Result<(), RedisError> {
        self.call_ok(
            "SENTINEL",
            vec![
                "SET".to_string(),
                shard.to_string(),
                parameter.to_string(),
                value.to_string(),
            ],
        )
        .await
    }

    async fn close(&self) {
        if let Err(e) = self.client.quit().await {
            debug!(error = %e, "Error closing connection");
        }
    }
}

/// Pattern subscription on its own `fred` client.
pub struct FredSubscription {
    client: Client,
    rx: tokio::sync::broadcast::Receiver<fred::types::Message>,
    patterns: Vec<String>,
}

#[async_trait]
impl Subscription for FredSubscription {
    async fn next_message(&mut self) -> Option<PubSubMessage> {
        loop {
            match self.rx.recv().await {
                Ok(message) => {
                    let Some(payload) = message.value.as_string() else {
                        warn!(channel = %message.channel, "Dropping non-string pub/sub payload");
                        continue;
                    };
                    return Some(PubSubMessage {
                        channel: message.channel.to_string(),
                        payload,
                    });
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Pub/sub receiver lagged, messages dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    async fn close(self: Box<Self>) {
        if let Err(e) = self.client.punsubscribe(self.patterns.clone()).await {
            debug!(error = %e, "Error unsubscribing");
        }
        if let Err(e) = self.client.quit().await {
            debug!(error = %e, "Error closing subscription connection");
        }
    }
}
