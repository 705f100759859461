//! Redis Sentinel coordination layer.
//!
//! Layers, leaf first:
//! - [`client`]: the `Connection`/`Connector` seam and its `fred` implementation
//! - [`server`]: the process-wide [`ServerPool`]
//! - [`sharded`]: servers, shards, Sentinels, clusters and discovery
//! - [`events`] and [`gatherer`]: background tasks per Sentinel endpoint
//! - [`metrics`]: the Prometheus families those tasks feed

pub mod client;
pub mod events;
pub mod gatherer;
pub mod metrics;
pub mod parsing;
pub mod server;
pub mod sharded;
pub mod types;

pub use client::{Connection, Connector, ConnectorConfig, FredConnector, RedisError};
pub use events::SentinelEventWatcher;
pub use gatherer::SentinelMetricsGatherer;
pub use metrics::SentinelMetrics;
pub use server::{Server, ServerPool};
pub use types::Role;
