//! saas-operator library crate
//!
//! This module exports the Sentinel controller, the CRD definitions and the
//! Redis Sentinel coordination layer the controller is built on.

pub mod controller;
pub mod crd;
pub mod health;
pub mod redis;
pub mod threads;

pub use health::HealthState;

use std::sync::Arc;

use futures::{Stream, StreamExt};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{Controller, WatchStreamExt, predicates, reflector, watcher};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use controller::context::{Context, Trigger};
use controller::sentinel_reconciler::{error_policy, reconcile};
use crd::Sentinel;
use redis::{ConnectorConfig, FredConnector, ServerPool};

/// Capacity of the channel background tasks use to request reconciles.
/// Triggers sent while it is full are dropped.
pub const TRIGGER_CHANNEL_CAPACITY: usize = 64;

/// Create namespaced or cluster-wide API based on scope
pub fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Create the default watcher configuration for all controllers.
///
/// This ensures consistent behavior across all controllers:
/// - `any_semantic()`: More reliable resource discovery in test environments
fn default_watcher_config() -> WatcherConfig {
    WatcherConfig::default().any_semantic()
}

/// Create a filtered stream for a resource type with standard optimizations.
///
/// This creates a reflector-backed stream that:
/// - Maintains an in-memory cache via reflector
/// - Uses automatic retry with exponential backoff on errors
/// - Converts watch events to objects (Added/Modified only)
/// - Filters out status-only updates via generation predicate
///
/// Returns the reflector store (for cache lookups) and the filtered stream.
fn create_filtered_stream<K>(
    api: Api<K>,
    watcher_config: WatcherConfig,
) -> (
    reflector::Store<K>,
    impl Stream<Item = Result<K, watcher::Error>>,
)
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, watcher_config))
        .default_backoff()
        .applied_objects()
        .predicate_filter(predicates::generation);
    (reader, stream)
}

/// Build the process-wide Redis server pool.
///
/// `REDIS_PASSWORD`, when set, authenticates every Redis and Sentinel
/// connection.
pub fn default_server_pool() -> Arc<ServerPool> {
    let mut config = ConnectorConfig::default();
    if let Ok(password) = std::env::var("REDIS_PASSWORD")
        && !password.is_empty()
    {
        config = config.with_password(password);
    }
    Arc::new(ServerPool::new(Arc::new(FredConnector::new(config))))
}

/// Run the operator controller (cluster-wide).
///
/// This is the main controller loop that watches Sentinel resources
/// and reconciles them. It can be called from main.rs or spawned as a
/// background task during integration tests.
///
/// If health_state is provided, metrics will be recorded for reconciliations.
pub async fn run_controller(client: Client, health_state: Option<Arc<HealthState>>) {
    run_controller_scoped(client, health_state, None).await
}

/// Run the operator controller with optional namespace scoping.
///
/// When `namespace` is `Some(ns)`, only watches resources in that namespace.
/// When `namespace` is `None`, watches resources cluster-wide.
pub async fn run_controller_scoped(
    client: Client,
    health_state: Option<Arc<HealthState>>,
    namespace: Option<&str>,
) {
    let scope_msg = namespace.unwrap_or("cluster-wide");
    info!(
        "Starting controller for Sentinel resources (scope: {})",
        scope_msg
    );

    // Mark as ready once we start the controller
    if let Some(ref state) = health_state {
        state.set_ready(true).await;
    }

    let (tx, rx) = mpsc::channel::<Trigger>(TRIGGER_CHANNEL_CAPACITY);
    let ctx = Arc::new(Context::new(
        client.clone(),
        health_state,
        default_server_pool(),
        tx,
    ));

    let sentinels: Api<Sentinel> = scoped_api(client, namespace);

    // Create filtered stream with standard optimizations (reflector, backoff, generation predicate)
    let (reader, resource_stream) = create_filtered_stream(sentinels, default_watcher_config());

    // Sentinel events and metrics gatherers request reconciles through the channel
    let triggers = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|trigger| (trigger, rx))
    });

    Controller::for_stream(resource_stream, reader)
        .reconcile_on(triggers)
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    debug!("Reconciled: {}", obj.name);
                }
                Err(e) => {
                    // ObjectNotFound/NotFound errors are expected after deletion when
                    // a queued trigger fires for a deleted object.
                    let is_not_found = match &e {
                        kube::runtime::controller::Error::ObjectNotFound(_) => true,
                        kube::runtime::controller::Error::ReconcilerFailed(err, _) => {
                            err.is_not_found()
                        }
                        _ => false,
                    };
                    if is_not_found {
                        debug!("Object no longer exists (likely deleted): {:?}", e);
                    } else {
                        error!("Reconciliation error: {:?}", e);
                    }
                }
            }
        })
        .await;

    // This should never complete in normal operation
    error!("Controller stream ended unexpectedly");
}
