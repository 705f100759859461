//! Background task lifecycle with real watchers and gatherers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use saas_operator::redis::sharded::SentinelServer;
use saas_operator::redis::{SentinelEventWatcher, SentinelMetrics, SentinelMetricsGatherer, ServerPool};
use saas_operator::threads::{Manager, RunnableThread};

use crate::{MockRedis, eventually};

const OWNER: &str = "default/redis-sentinel";
const X: &str = "10.0.0.10:26379";
const Y: &str = "10.0.0.11:26379";
const Z: &str = "10.0.0.12:26379";

struct Fixture {
    mock: MockRedis,
    pool: Arc<ServerPool>,
    metrics: Arc<SentinelMetrics>,
}

impl Fixture {
    fn new() -> Self {
        let mock = MockRedis::new();
        mock.add_sentinel(X).add_sentinel(Y).add_sentinel(Z);
        let pool = Arc::new(ServerPool::new(mock.connector()));
        Self {
            mock,
            pool,
            metrics: Arc::new(SentinelMetrics::new()),
        }
    }

    fn sentinel(&self, id: &str) -> (String, SentinelServer) {
        let uri = format!("redis://{}", id);
        let sentinel = SentinelServer::from_connection_string(&self.pool, &uri, None).unwrap();
        (uri, sentinel)
    }

    fn watchers(&self, ids: &[&str]) -> Vec<Box<dyn RunnableThread<String>>> {
        ids.iter()
            .map(|id| {
                let (uri, sentinel) = self.sentinel(id);
                Box::new(SentinelEventWatcher::new(
                    uri,
                    sentinel,
                    OWNER.to_string(),
                    self.metrics.clone(),
                    true,
                )) as Box<dyn RunnableThread<String>>
            })
            .collect()
    }

    fn gatherers(&self, ids: &[&str]) -> Vec<Box<dyn RunnableThread<String>>> {
        ids.iter()
            .map(|id| {
                let (uri, sentinel) = self.sentinel(id);
                Box::new(SentinelMetricsGatherer::new(
                    uri,
                    sentinel,
                    self.pool.clone(),
                    self.metrics.clone(),
                    Duration::from_millis(20),
                )) as Box<dyn RunnableThread<String>>
            })
            .collect()
    }
}

fn uris(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|id| format!("redis://{}", id)).collect()
}

#[tokio::test]
async fn test_reconcile_replaces_only_changed_watchers() {
    let f = Fixture::new();
    let (tx, _rx) = mpsc::channel(8);
    let manager = Manager::new(tx);

    manager.reconcile_threads(OWNER, f.watchers(&[X, Y])).await.unwrap();
    eventually("initial subscriptions", || {
        f.mock.subscriber_count(X) == 1 && f.mock.subscriber_count(Y) == 1
    })
    .await;

    manager.reconcile_threads(OWNER, f.watchers(&[Y, Z])).await.unwrap();
    eventually("new subscription", || f.mock.subscriber_count(Z) == 1).await;

    assert_eq!(f.mock.closed_subscriptions(X), 1);
    assert_eq!(f.mock.subscriber_count(X), 0);
    // The surviving watcher kept its original subscription.
    assert_eq!(f.mock.closed_subscriptions(Y), 0);
    assert_eq!(f.mock.subscriber_count(Y), 1);
    assert_eq!(manager.thread_ids(OWNER).await, uris(&[Y, Z]));

    manager.cleanup(OWNER).await;
    assert!(manager.thread_ids(OWNER).await.is_empty());
    assert_eq!(f.mock.closed_subscriptions(Y), 1);
    assert_eq!(f.mock.closed_subscriptions(Z), 1);
}

#[tokio::test]
async fn test_events_reach_the_shared_channel() {
    let f = Fixture::new();
    let (tx, mut rx) = mpsc::channel(8);
    let manager = Manager::new(tx);

    manager.reconcile_threads(OWNER, f.watchers(&[X, Y])).await.unwrap();
    eventually("subscriptions", || {
        f.mock.subscriber_count(X) == 1 && f.mock.subscriber_count(Y) == 1
    })
    .await;

    f.mock.publish(Y, "+sdown", "master shard01 10.0.1.1 6379");

    let trigger = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(trigger, OWNER);

    manager.cleanup(OWNER).await;
}

#[tokio::test]
async fn test_watchers_and_gatherers_share_ids_across_managers() {
    let f = Fixture::new();
    f.mock.sentinel_view(X, "shard01", "10.0.1.1:6379", &[]);
    let (tx, _rx) = mpsc::channel(8);
    let watchers = Manager::new(tx.clone());
    let gatherers = Manager::new(tx);

    watchers.reconcile_threads(OWNER, f.watchers(&[X])).await.unwrap();
    gatherers.reconcile_threads(OWNER, f.gatherers(&[X])).await.unwrap();

    let id = format!("redis://{}", X);
    assert!(watchers.is_running(OWNER, &id).await);
    assert!(gatherers.is_running(OWNER, &id).await);

    gatherers.cleanup(OWNER).await;
    assert!(!gatherers.is_running(OWNER, &id).await);
    assert!(watchers.is_running(OWNER, &id).await);

    watchers.cleanup(OWNER).await;
    assert_eq!(f.mock.closed_subscriptions(X), 1);
}

#[tokio::test]
async fn test_empty_desired_set_stops_everything() {
    let f = Fixture::new();
    let (tx, _rx) = mpsc::channel(8);
    let manager = Manager::new(tx);

    manager.reconcile_threads(OWNER, f.watchers(&[X, Y, Z])).await.unwrap();
    eventually("subscriptions", || f.mock.subscriber_count(Z) == 1).await;

    manager.reconcile_threads(OWNER, Vec::new()).await.unwrap();

    assert!(manager.thread_ids(OWNER).await.is_empty());
    for id in [X, Y, Z] {
        assert_eq!(f.mock.subscriber_count(id), 0);
    }
}
