//! Server pool identity and connection sharing.

use std::sync::Arc;

use saas_operator::redis::sharded::{RedisServer, SentinelServer};
use saas_operator::redis::{RedisError, ServerPool};

use crate::MockRedis;

fn pool(mock: &MockRedis) -> Arc<ServerPool> {
    Arc::new(ServerPool::new(mock.connector()))
}

#[test]
fn test_same_endpoint_same_server() {
    let mock = MockRedis::new();
    let pool = pool(&mock);

    let a = pool.get_server("redis://10.0.1.1:6379", None).unwrap();
    let b = pool.get_server("redis://10.0.1.1:6379", Some("redis-shard01-0")).unwrap();
    let c = pool.get_server_by_address("10.0.1.1", 6379, None);

    assert!(Arc::ptr_eq(&a, &b));
    assert!(Arc::ptr_eq(&a, &c));
    assert_eq!(pool.len(), 1);
    // The alias given later is recorded on the shared entry.
    assert_eq!(a.alias().as_deref(), Some("redis-shard01-0"));
}

#[test]
fn test_alias_is_never_overwritten() {
    let mock = MockRedis::new();
    let pool = pool(&mock);

    let server = pool.get_server("redis://10.0.1.1:6379", Some("first")).unwrap();
    pool.get_server("redis://10.0.1.1:6379", Some("second")).unwrap();

    assert_eq!(server.alias().as_deref(), Some("first"));
    assert!(pool.lookup_by_alias("second").is_none());
    assert!(Arc::ptr_eq(&pool.lookup_by_alias("first").unwrap(), &server));
}

#[test]
fn test_default_port_and_invalid_uri() {
    let mock = MockRedis::new();
    let pool = pool(&mock);

    let server = pool.get_server("redis://redis-0.redis.default.svc", None).unwrap();
    assert_eq!(server.id(), "redis-0.redis.default.svc:6379");

    assert!(pool.get_server("http://10.0.1.1:6379", None).is_err());
    assert!(pool.get_server("not a uri", None).is_err());
    assert_eq!(pool.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_lookups_share_one_server() {
    let mock = MockRedis::new();
    mock.add_master("10.0.1.1:6379");
    let pool = pool(&mock);

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move {
                let server = pool.get_server("redis://10.0.1.1:6379", None).unwrap();
                server.connection().await.unwrap();
                server
            })
        })
        .collect();

    let mut servers = Vec::new();
    for handle in handles {
        servers.push(handle.await.unwrap());
    }

    assert_eq!(pool.len(), 1);
    assert!(servers.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    // The connection is opened once and shared.
    assert_eq!(mock.connect_count("10.0.1.1:6379"), 1);
}

#[tokio::test]
async fn test_failed_connect_is_retried() {
    let mock = MockRedis::new();
    mock.add_master("10.0.1.1:6379");
    mock.set_unreachable("10.0.1.1:6379", true);
    let pool = pool(&mock);
    let server = pool.get_server("redis://10.0.1.1:6379", None).unwrap();

    assert!(server.connection().await.is_err());

    mock.set_unreachable("10.0.1.1:6379", false);
    assert!(server.connection().await.is_ok());
    assert_eq!(mock.connect_count("10.0.1.1:6379"), 1);
}

#[tokio::test]
async fn test_broken_connection_is_reopened() {
    let mock = MockRedis::new();
    mock.add_master("10.0.1.1:6379");
    let pool = pool(&mock);
    let server = pool.get_server("redis://10.0.1.1:6379", None).unwrap();
    let redis = RedisServer::new(server.clone());

    redis.ping().await.unwrap();
    assert_eq!(mock.connect_count("10.0.1.1:6379"), 1);

    mock.restart("10.0.1.1:6379");

    // The command on the stale connection fails and drops it.
    assert!(redis.ping().await.unwrap_err().is_connection_error());
    redis.ping().await.unwrap();
    assert_eq!(mock.connect_count("10.0.1.1:6379"), 2);

    // The healthy connection stays cached.
    redis.ping().await.unwrap();
    assert_eq!(mock.connect_count("10.0.1.1:6379"), 2);
}

#[tokio::test]
async fn test_command_errors_keep_the_connection() {
    let mock = MockRedis::new();
    mock.add_sentinel("10.0.0.10:26379");
    let pool = pool(&mock);
    let sentinel =
        SentinelServer::from_connection_string(&pool, "redis://10.0.0.10:26379", None).unwrap();

    assert!(matches!(
        sentinel.master("shard09").await,
        Err(RedisError::UnknownShard(_))
    ));
    sentinel.ping().await.unwrap();
    assert_eq!(mock.connect_count("10.0.0.10:26379"), 1);
}

#[tokio::test]
async fn test_reset_ignores_replaced_connection() {
    let mock = MockRedis::new();
    mock.add_master("10.0.1.1:6379");
    let pool = pool(&mock);
    let server = pool.get_server("redis://10.0.1.1:6379", None).unwrap();

    let stale = server.connection().await.unwrap();
    server.reset_connection(&stale).await;
    let fresh = server.connection().await.unwrap();
    assert_eq!(mock.connect_count("10.0.1.1:6379"), 2);

    // A late reset for the old connection leaves the new one cached.
    server.reset_connection(&stale).await;
    let cached = server.connection().await.unwrap();
    assert!(Arc::ptr_eq(&fresh, &cached));
    assert_eq!(mock.connect_count("10.0.1.1:6379"), 2);
}
