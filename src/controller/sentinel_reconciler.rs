//! Reconciliation loop for Sentinel.
//!
//! A reconcile registers every shard with every Sentinel, keeps one event
//! watcher and one metrics gatherer running per Sentinel endpoint, and
//! projects the topology Sentinel reports into the resource status.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::{
    Api, ResourceExt,
    api::{Patch, PatchParams},
    runtime::{controller::Action, reflector::ObjectRef},
};
use tracing::{debug, error, info, warn};

use crate::{
    controller::{
        common::{add_finalizer, owner_key, remove_finalizer},
        context::{Context, FIELD_MANAGER, Trigger},
        error::{Error, Result},
        status::build_status,
    },
    crd::{Sentinel, SentinelSpec},
    redis::{
        SentinelEventWatcher, SentinelMetricsGatherer,
        server::parse_connection_string,
        sharded::{Cluster, SENTINEL_TOPOLOGY_KEY, SentinelServer},
    },
    threads::RunnableThread,
};

/// Finalizer name for graceful deletion
pub const FINALIZER: &str = "saasoperator.io/sentinel-finalizer";

/// Interval between two reconciles of a healthy resource.
pub const REQUEUE_INTERVAL: Duration = Duration::from_secs(30);

/// Reconcile a Sentinel
pub async fn reconcile(obj: Arc<Sentinel>, ctx: Arc<Context>) -> Result<Action> {
    let start_time = Instant::now();
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    debug!(name = %name, namespace = %namespace, "Reconciling Sentinel");

    let api: Api<Sentinel> = Api::namespaced(ctx.client.clone(), &namespace);

    // Handle deletion
    if obj.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&obj, &ctx, &api, &namespace).await;
    }

    // Ensure finalizer is present
    if !obj.finalizers().iter().any(|f| f == FINALIZER) {
        info!(name = %name, "Adding finalizer");
        add_finalizer(&api, &name, FINALIZER).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    if let Err(e) = validate_spec(&obj.spec) {
        error!(name = %name, error = %e, "Validation failed");
        ctx.publish_warning_event(&obj, "ValidationFailed", "Validating", Some(e.to_string()))
            .await;
        return Err(e);
    }

    let options = obj.spec.discovery();
    let mut cluster = Cluster::from_topology(name.as_str(), &obj.spec.topology(), ctx.pool.clone())?;

    let monitored = monitor_shards(&mut cluster, obj.spec.effective_quorum()).await?;
    if !monitored.is_empty() {
        info!(name = %name, shards = ?monitored, "Shards registered with Sentinel");
        ctx.publish_normal_event(
            &obj,
            "ShardsMonitored",
            "Monitoring",
            Some(format!("Sentinel now monitors {}", monitored.join(", "))),
        )
        .await;
    }

    reconcile_background_tasks(&obj, &ctx, &owner_key(&namespace, &name)).await?;

    let errors = match cluster.sentinel_discover(&options).await {
        Ok(()) => None,
        Err(errors) if errors.has_fatal() => return Err(errors.into()),
        Err(errors) => {
            for e in errors.iter() {
                warn!(
                    name = %name,
                    shard = e.shard().unwrap_or("-"),
                    kind = e.kind(),
                    error = %e,
                    "Discovery error"
                );
            }
            Some(errors)
        }
    };

    let status = build_status(
        &cluster,
        errors.as_ref(),
        obj.metadata.generation,
        obj.status.as_ref(),
    );
    if obj
        .status
        .as_ref()
        .is_some_and(|current| current.is_equivalent(&status))
    {
        debug!(name = %name, "Status unchanged");
    } else {
        update_status(&api, &name, &status).await?;
    }

    if let Some(ref health_state) = ctx.health_state {
        let metrics = &health_state.metrics;
        metrics.record_reconcile(&namespace, &name, start_time.elapsed().as_secs_f64());
        metrics.set_topology(&namespace, &name, &shard_sizes(&cluster));
        if let Some(errors) = errors.as_ref() {
            metrics.record_discovery_errors(
                &namespace,
                &name,
                u64::try_from(errors.len()).unwrap_or(u64::MAX),
            );
        }
    }

    Ok(Action::requeue(REQUEUE_INTERVAL))
}

/// Error policy for the controller
pub fn error_policy(obj: Arc<Sentinel>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    // Record error metric
    if let Some(ref health_state) = ctx.health_state {
        health_state.metrics.record_error(&namespace, &name);
    }

    if error.is_not_found() {
        debug!(name = %name, "Resource not found (likely deleted)");
        return Action::await_change();
    }

    if error.is_retryable() {
        warn!(name = %name, error = %error, "Retryable error, will retry");
    } else {
        error!(name = %name, error = %error, "Non-retryable error");
    }
    Action::requeue(error.requeue_after())
}

/// Validate the resource spec
pub fn validate_spec(spec: &SentinelSpec) -> Result<()> {
    if spec.sentinels.is_empty() {
        return Err(Error::Validation(
            "at least one sentinel is required".to_string(),
        ));
    }

    for (alias, uri) in &spec.sentinels {
        parse_connection_string(uri).map_err(|e| {
            Error::Validation(format!("sentinel {}: {}", alias, e))
        })?;
    }

    for (shard, members) in &spec.monitored_shards {
        if shard == SENTINEL_TOPOLOGY_KEY {
            return Err(Error::Validation(format!(
                "shard name '{}' is reserved",
                SENTINEL_TOPOLOGY_KEY
            )));
        }
        if members.is_empty() {
            return Err(Error::Validation(format!(
                "shard {} has no servers",
                shard
            )));
        }
        for (alias, uri) in members {
            parse_connection_string(uri).map_err(|e| {
                Error::Validation(format!("shard {} server {}: {}", shard, alias, e))
            })?;
        }
    }

    let sentinels = u32::try_from(spec.sentinels.len()).unwrap_or(u32::MAX);
    let quorum = spec.effective_quorum();
    if quorum == 0 || quorum > sentinels {
        return Err(Error::Validation(format!(
            "quorum must be between 1 and {}, got {}",
            sentinels, quorum
        )));
    }

    if spec.metrics_refresh_interval_seconds == 0 {
        return Err(Error::Validation(
            "metricsRefreshIntervalSeconds must be at least 1".to_string(),
        ));
    }

    Ok(())
}

/// Register the shards with every Sentinel. Unreachable Sentinels are
/// skipped as long as one of them accepted the shards.
async fn monitor_shards(cluster: &mut Cluster, quorum: u32) -> Result<Vec<String>> {
    let sentinels = cluster.sentinels().to_vec();
    let mut monitored = Vec::new();
    let mut last_error = None;
    let mut succeeded = 0usize;

    for sentinel in &sentinels {
        match sentinel.monitor(cluster.shards_mut(), quorum).await {
            Ok(shards) => {
                succeeded += 1;
                for shard in shards {
                    if !monitored.contains(&shard) {
                        monitored.push(shard);
                    }
                }
            }
            Err(e) => {
                warn!(
                    sentinel = %sentinel.display_name(),
                    error = %e,
                    "Sentinel could not be configured"
                );
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(e) if succeeded == 0 => Err(e.into()),
        _ => Ok(monitored),
    }
}

/// Keep one event watcher and one metrics gatherer per Sentinel endpoint.
async fn reconcile_background_tasks(obj: &Sentinel, ctx: &Context, owner: &str) -> Result<()> {
    let trigger: Trigger = ObjectRef::from_obj(obj);
    let mut watchers: Vec<Box<dyn RunnableThread<Trigger>>> = Vec::new();
    let mut gatherers: Vec<Box<dyn RunnableThread<Trigger>>> = Vec::new();

    for (alias, uri) in &obj.spec.sentinels {
        let sentinel = SentinelServer::from_connection_string(&ctx.pool, uri, Some(alias))?;
        watchers.push(Box::new(SentinelEventWatcher::new(
            uri.as_str(),
            sentinel.clone(),
            trigger.clone(),
            ctx.sentinel_metrics.clone(),
            obj.spec.export_event_metrics,
        )));
        gatherers.push(Box::new(SentinelMetricsGatherer::new(
            uri.as_str(),
            sentinel,
            ctx.pool.clone(),
            ctx.sentinel_metrics.clone(),
            obj.spec.metrics_refresh_interval(),
        )));
    }

    ctx.watchers.reconcile_threads(owner, watchers).await?;
    ctx.gatherers.reconcile_threads(owner, gatherers).await?;
    Ok(())
}

/// Handle deletion of a Sentinel
async fn handle_deletion(
    obj: &Sentinel,
    ctx: &Context,
    api: &Api<Sentinel>,
    namespace: &str,
) -> Result<Action> {
    let name = obj.name_any();
    info!(name = %name, "Handling deletion");

    let owner = owner_key(namespace, &name);
    ctx.watchers.cleanup(&owner).await;
    ctx.gatherers.cleanup(&owner).await;

    if let Some(ref health_state) = ctx.health_state {
        health_state.metrics.remove_resource(namespace, &name);
    }

    remove_finalizer(api, &name, FINALIZER).await?;
    Ok(Action::await_change())
}

/// Patch the status subresource
async fn update_status(
    api: &Api<Sentinel>,
    name: &str,
    status: &crate::crd::SentinelStatus,
) -> Result<()> {
    let patch = serde_json::json!({
        "status": status
    });
    api.patch_status(
        name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    debug!(name = %name, "Status updated");
    Ok(())
}

fn shard_sizes(cluster: &Cluster) -> Vec<(String, i64)> {
    cluster
        .shards()
        .iter()
        .map(|shard| {
            (
                shard.name().to_string(),
                i64::try_from(shard.servers().len()).unwrap_or(i64::MAX),
            )
        })
        .collect()
}
