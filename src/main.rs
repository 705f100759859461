//! saas-operator - A Kubernetes operator coordinating Redis Sentinel
//! monitored sharded clusters.
//!
//! Startup order: structured logging, Kubernetes client, health server,
//! leader election, then the Sentinel controller. Only the leader runs the
//! controller, so a single process owns the Sentinel watchers and gatherers.

use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tracing::{error, info, warn};

use saas_operator::health::{HealthState, run_health_server};
use saas_operator::run_controller_scoped;

/// Lease configuration
const LEASE_NAME: &str = "saas-operator-leader";
const LEASE_TTL: Duration = Duration::from_secs(15);
const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Grace period for in-flight reconciliations to complete during shutdown
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Who this process is and where its lease lives.
struct Identity {
    holder_id: String,
    lease_namespace: String,
    /// Namespace the controller is restricted to, cluster-wide when unset.
    watch_namespace: Option<String>,
}

impl Identity {
    fn from_env() -> Self {
        let holder_id = std::env::var("POD_NAME").unwrap_or_else(|_| {
            warn!("POD_NAME not set, using hostname");
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        });
        let lease_namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| {
            warn!("POD_NAMESPACE not set, using 'default'");
            "default".to_string()
        });
        let watch_namespace = std::env::var("WATCH_NAMESPACE")
            .ok()
            .filter(|ns| !ns.is_empty());
        Self {
            holder_id,
            lease_namespace,
            watch_namespace,
        }
    }

    fn lease_lock(&self, client: Client) -> LeaseLock {
        LeaseLock::new(
            client,
            &self.lease_namespace,
            LeaseLockParams {
                holder_id: self.holder_id.clone(),
                lease_name: LEASE_NAME.to_string(),
                lease_ttl: LEASE_TTL,
            },
        )
    }
}

fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("saas_operator=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("fred=warn".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .json()
        .init();
    Ok(())
}

/// Block until this process holds the lease.
async fn acquire_leadership(lease_lock: &LeaseLock) {
    info!("Waiting to acquire leadership...");
    loop {
        match lease_lock.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {
                info!("Acquired leadership");
                return;
            }
            Ok(_) => info!("Another instance is leader, waiting..."),
            Err(e) => warn!("Failed to acquire lease: {}, retrying...", e),
        }
        tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
    }
}

/// Renew the lease forever. Losing it exits the process so Kubernetes
/// restarts it into a new election.
#[allow(clippy::exit)]
async fn renew_leadership(lease_lock: LeaseLock) {
    loop {
        tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
        match lease_lock.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {}
            Ok(_) => {
                error!("Lost leadership! Shutting down...");
                std::process::exit(1);
            }
            Err(e) => {
                error!("Failed to renew lease: {}. Shutting down...", e);
                std::process::exit(1);
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing()?;
    info!("Starting saas-operator");

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let identity = Identity::from_env();
    info!(
        holder_id = %identity.holder_id,
        namespace = %identity.lease_namespace,
        watch_namespace = identity.watch_namespace.as_deref().unwrap_or("cluster-wide"),
        lease_name = LEASE_NAME,
        "Initializing leader election"
    );

    let health_state = Arc::new(HealthState::new());

    // Probes and metrics are served even as non-leader
    let health_handle = {
        let health_state = health_state.clone();
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state).await {
                error!("Health server error: {}", e);
            }
        })
    };

    acquire_leadership(&identity.lease_lock(client.clone())).await;
    let lease_renewal_handle = tokio::spawn(renew_leadership(identity.lease_lock(client.clone())));

    let controller_handle = {
        let health_state = health_state.clone();
        let watch_namespace = identity.watch_namespace.clone();
        tokio::spawn(async move {
            run_controller_scoped(client, Some(health_state), watch_namespace.as_deref()).await;
        })
    };

    tokio::select! {
        result = controller_handle => {
            if let Err(e) = result {
                error!("Controller task panicked: {}", e);
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            }
        }
        // Only reached on panic; losing the lease exits the process
        Err(e) = lease_renewal_handle => {
            error!("Lease renewal task panicked: {}", e);
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");
            health_state.set_ready(false).await;
            info!(
                grace_period_secs = SHUTDOWN_GRACE_PERIOD.as_secs(),
                "Waiting for in-flight reconciliations to complete"
            );
            tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;
        }
    }

    info!("Operator stopped");
    Ok(())
}

/// Wait for SIGTERM or SIGINT.
///
/// Signal handler setup failures are fatal.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
