//! Sentinel metrics gatherers: gauges, role flips, stale series and cleanup.

use std::sync::Arc;
use std::time::Duration;

use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;

use saas_operator::redis::sharded::SentinelServer;
use saas_operator::redis::{SentinelMetrics, SentinelMetricsGatherer, ServerPool};
use saas_operator::threads::{RunnableThread, ThreadError};

use crate::{MockRedis, eventually};

const SENTINEL: &str = "10.0.0.10:26379";
const MASTER: &str = "10.0.1.1:6379";
const SLAVE: &str = "10.0.1.2:6379";
const INTERVAL: Duration = Duration::from_millis(20);

struct Harness {
    mock: MockRedis,
    registry: Registry,
    gatherer: SentinelMetricsGatherer,
}

impl Harness {
    fn new(interval: Duration) -> Self {
        let mock = MockRedis::new();
        mock.add_master(MASTER).add_slave(SLAVE, MASTER).add_sentinel(SENTINEL);
        mock.sentinel_view(SENTINEL, "shard01", MASTER, &[SLAVE]);

        let pool = Arc::new(ServerPool::new(mock.connector()));
        pool.get_server(&format!("redis://{}", MASTER), Some("redis-shard01-0"))
            .unwrap();
        let uri = format!("redis://{}", SENTINEL);
        let sentinel = SentinelServer::from_connection_string(&pool, &uri, None).unwrap();

        let metrics = Arc::new(SentinelMetrics::new());
        let mut registry = Registry::default();
        metrics.register(&mut registry);
        let gatherer = SentinelMetricsGatherer::new(uri, sentinel, pool, metrics, interval);

        Self {
            mock,
            registry,
            gatherer,
        }
    }

    fn start(&mut self) -> Result<(), ThreadError> {
        RunnableThread::<()>::start(&mut self.gatherer)
    }

    async fn stop(&mut self) {
        RunnableThread::<()>::stop(&mut self.gatherer).await;
    }

    fn encoded(&self) -> String {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry).unwrap();
        buffer
    }
}

fn series(server: &str, alias: &str, role: &str) -> String {
    format!(
        "{{sentinel=\"{}\",shard=\"shard01\",redis_server=\"{}\",redis_server_alias=\"{}\",role=\"{}\"}}",
        SENTINEL, server, alias, role
    )
}

#[tokio::test]
async fn test_gauges_are_published() {
    let mut h = Harness::new(INTERVAL);
    h.start().unwrap();

    let master = series(MASTER, "redis-shard01-0", "master");
    let slave = series(SLAVE, "", "slave");
    eventually("gauges", || {
        let text = h.encoded();
        text.contains(&format!("saas_redis_sentinel_num_slaves{} 1", master))
            && text.contains(&format!("saas_redis_sentinel_slave_repl_offset{} 4242", slave))
    })
    .await;

    let text = h.encoded();
    assert!(text.contains(&format!("saas_redis_sentinel_num_other_sentinels{} 2", master)));
    assert!(text.contains(&format!("saas_redis_sentinel_last_ok_ping_reply{} 300", slave)));
    // Master-only and slave-only gauges stay on their own role.
    assert!(!text.contains(&format!("saas_redis_sentinel_slave_repl_offset{}", master)));
    assert!(!text.contains(&format!("saas_redis_sentinel_num_slaves{}", slave)));

    h.stop().await;
}

#[tokio::test]
async fn test_role_flip_removes_old_series() {
    let mut h = Harness::new(INTERVAL);
    h.start().unwrap();
    let old_master = series(MASTER, "redis-shard01-0", "master");
    eventually("initial gauges", || h.encoded().contains(&old_master)).await;

    h.mock.failover("shard01", SLAVE, &[MASTER]);

    let new_master = series(SLAVE, "", "master");
    let demoted = series(MASTER, "redis-shard01-0", "slave");
    eventually("flipped gauges", || {
        let text = h.encoded();
        text.contains(&new_master) && text.contains(&demoted)
    })
    .await;

    let old_slave = series(SLAVE, "", "slave");
    eventually("old series removed", || {
        let text = h.encoded();
        !text.contains(&old_master) && !text.contains(&old_slave)
    })
    .await;

    h.stop().await;
}

#[tokio::test]
async fn test_forgotten_replica_series_is_removed() {
    let mut h = Harness::new(INTERVAL);
    h.start().unwrap();
    let master = series(MASTER, "redis-shard01-0", "master");
    let slave = series(SLAVE, "", "slave");
    eventually("initial gauges", || {
        let text = h.encoded();
        text.contains(&master) && text.contains(&slave)
    })
    .await;

    // Sentinel stops reporting the replica.
    h.mock.sentinel_view(SENTINEL, "shard01", MASTER, &[]);

    eventually("replica series removed", || !h.encoded().contains(&slave)).await;
    let text = h.encoded();
    assert!(text.contains(&format!("saas_redis_sentinel_num_slaves{} 0", master)));

    h.stop().await;
}

#[tokio::test]
async fn test_stop_removes_every_series() {
    let mut h = Harness::new(INTERVAL);
    h.start().unwrap();
    assert!(RunnableThread::<()>::is_started(&h.gatherer));
    eventually("gauges", || h.encoded().contains("sentinel=\"")).await;

    h.stop().await;

    assert!(!RunnableThread::<()>::is_started(&h.gatherer));
    assert!(!h.encoded().contains("sentinel=\""));
}

#[tokio::test]
async fn test_unreachable_sentinel_keeps_polling() {
    let mut h = Harness::new(INTERVAL);
    h.mock.set_unreachable(SENTINEL, true);
    h.start().unwrap();

    tokio::time::sleep(INTERVAL * 5).await;
    assert!(RunnableThread::<()>::is_started(&h.gatherer));
    assert!(!h.encoded().contains("sentinel=\""));

    h.mock.set_unreachable(SENTINEL, false);
    eventually("gauges after recovery", || h.encoded().contains("sentinel=\"")).await;

    h.stop().await;
}

#[tokio::test]
async fn test_zero_interval_fails_to_start() {
    let mut h = Harness::new(Duration::ZERO);

    let err = h.start().unwrap_err();

    assert!(matches!(err, ThreadError::Start { .. }));
    assert!(!RunnableThread::<()>::is_started(&h.gatherer));
}
