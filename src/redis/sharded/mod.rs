//! In-memory model of a Sentinel monitored sharded topology.
//!
//! A [`Cluster`] owns [`Shard`]s of [`RedisServer`]s and the
//! [`SentinelServer`]s watching them. Every handle is backed by the shared
//! [`ServerPool`](crate::redis::server::ServerPool).

pub mod cluster;
pub mod discovery;
pub mod redis_server;
pub mod sentinel_server;
pub mod shard;
pub mod status;

pub use cluster::{Cluster, SENTINEL_PING_TIMEOUT, SENTINEL_TOPOLOGY_KEY};
pub use discovery::{DiscoveryError, DiscoveryErrors, DiscoveryOption, DiscoveryOptions};
pub use redis_server::RedisServer;
pub use sentinel_server::SentinelServer;
pub use shard::Shard;
pub use status::{MonitoredShard, RedisServerDetails};
