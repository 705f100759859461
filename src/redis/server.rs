//! Pool-backed handles to Redis and Sentinel processes.
//!
//! A [`Server`] is identified by `host:port`. The [`ServerPool`] guarantees a
//! single `Server` per endpoint for the lifetime of the process, so every
//! cluster built during a reconcile shares the same lazily opened connection.
//! A connection that fails with a connection-class error is dropped and the
//! next command reopens it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use super::client::{Connection, Connector, RedisError, Subscription};
use super::parsing::join_host_port;

/// Default Redis port used when a connection string omits it.
pub const DEFAULT_REDIS_PORT: u16 = 6379;

/// Parse a `redis://host[:port]` connection string into `(host, port)`.
pub fn parse_connection_string(uri: &str) -> Result<(String, u16), RedisError> {
    let invalid = |reason: &str| RedisError::InvalidConnectionString {
        uri: uri.to_string(),
        reason: reason.to_string(),
    };

    let url = url::Url::parse(uri).map_err(|e| invalid(&e.to_string()))?;
    if url.scheme() != "redis" {
        return Err(invalid(&format!("unsupported scheme '{}'", url.scheme())));
    }
    let host = match url.host() {
        Some(url::Host::Domain(domain)) => domain.to_string(),
        Some(url::Host::Ipv4(v4)) => v4.to_string(),
        Some(url::Host::Ipv6(v6)) => v6.to_string(),
        None => return Err(invalid("missing host")),
    };
    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    let port = url.port().unwrap_or(DEFAULT_REDIS_PORT);
    Ok((host, port))
}

/// One Redis or Sentinel process.
pub struct Server {
    host: String,
    port: u16,
    alias: RwLock<Option<String>>,
    connector: Arc<dyn Connector>,
    connection: AsyncMutex<Option<Arc<dyn Connection>>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.id())
            .field("alias", &self.alias())
            .field(
                "connected",
                &self.connection.try_lock().map(|c| c.is_some()).unwrap_or(true),
            )
            .finish()
    }
}

impl Server {
    fn new(host: String, port: u16, alias: Option<String>, connector: Arc<dyn Connector>) -> Self {
        Self {
            host,
            port,
            alias: RwLock::new(alias),
            connector,
            connection: AsyncMutex::new(None),
        }
    }

    /// `host:port`, with IPv6 hosts bracketed.
    pub fn id(&self) -> String {
        join_host_port(&self.host, self.port)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Human readable alias (usually the pod name), if known.
    pub fn alias(&self) -> Option<String> {
        self.alias.read().ok().and_then(|a| a.clone())
    }

    /// Set the alias unless one is already known. Returns whether it changed.
    pub fn set_alias_if_unset(&self, alias: &str) -> bool {
        match self.alias.write() {
            Ok(mut current) if current.is_none() => {
                *current = Some(alias.to_string());
                true
            }
            _ => false,
        }
    }

    /// Alias if known, otherwise the ID.
    pub fn display_name(&self) -> String {
        self.alias().unwrap_or_else(|| self.id())
    }

    /// The shared connection, opened on first use or after a reset.
    pub async fn connection(&self) -> Result<Arc<dyn Connection>, RedisError> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.connector.connect(&self.host, self.port).await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Pass `result` through, resetting `conn` when it failed with a
    /// connection-class error.
    pub async fn checked<T>(
        &self,
        conn: &Arc<dyn Connection>,
        result: Result<T, RedisError>,
    ) -> Result<T, RedisError> {
        if let Err(e) = &result
            && e.is_connection_error()
        {
            warn!(server = %self.display_name(), error = %e, "Dropping broken connection");
            self.reset_connection(conn).await;
        }
        result
    }

    /// Drop `stale` if it is still the cached connection and close it in the
    /// background. A connection already replaced by another caller is left
    /// alone.
    pub async fn reset_connection(&self, stale: &Arc<dyn Connection>) {
        let removed = {
            let mut slot = self.connection.lock().await;
            match slot.as_ref() {
                Some(current) if std::ptr::addr_eq(Arc::as_ptr(current), Arc::as_ptr(stale)) => {
                    slot.take()
                }
                _ => None,
            }
        };
        if let Some(conn) = removed {
            tokio::spawn(async move { conn.close().await });
        }
    }

    /// Open a dedicated pattern subscription to this server.
    pub async fn psubscribe(&self, patterns: &[String]) -> Result<Box<dyn Subscription>, RedisError> {
        self.connector
            .subscribe(&self.host, self.port, patterns)
            .await
    }
}

/// Process-wide registry of servers, one per `host:port`.
pub struct ServerPool {
    servers: Mutex<HashMap<String, Arc<Server>>>,
    connector: Arc<dyn Connector>,
}

impl ServerPool {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            servers: Mutex::new(HashMap::new()),
            connector,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Server>>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.servers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Look up (or register) the server behind a connection string.
    ///
    /// When `alias` is given and the existing entry has none, the alias is
    /// recorded on the shared entry.
    pub fn get_server(
        &self,
        connection_string: &str,
        alias: Option<&str>,
    ) -> Result<Arc<Server>, RedisError> {
        let (host, port) = parse_connection_string(connection_string)?;
        Ok(self.get_server_by_address(&host, port, alias))
    }

    /// Same as [`ServerPool::get_server`] for an already split address.
    pub fn get_server_by_address(&self, host: &str, port: u16, alias: Option<&str>) -> Arc<Server> {
        let id = join_host_port(host, port);
        let mut servers = self.lock();

        if let Some(existing) = servers.get(&id) {
            if let Some(alias) = alias
                && existing.set_alias_if_unset(alias)
            {
                debug!(server = %id, alias = %alias, "Alias recorded for known server");
            }
            return existing.clone();
        }

        let server = Arc::new(Server::new(
            host.to_string(),
            port,
            alias.map(String::from),
            self.connector.clone(),
        ));
        servers.insert(id.clone(), server.clone());
        debug!(server = %id, "Server added to pool");
        server
    }

    /// Look up a known server by ID without registering it.
    pub fn lookup(&self, id: &str) -> Option<Arc<Server>> {
        self.lock().get(id).cloned()
    }

    /// Look up a known server by alias.
    pub fn lookup_by_alias(&self, alias: &str) -> Option<Arc<Server>> {
        self.lock()
            .values()
            .find(|s| s.alias().as_deref() == Some(alias))
            .cloned()
    }

    /// Map of alias to server for every server with a known alias.
    pub fn index_by_alias(&self) -> HashMap<String, Arc<Server>> {
        self.lock()
            .values()
            .filter_map(|s| s.alias().map(|a| (a, s.clone())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
