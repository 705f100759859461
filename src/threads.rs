//! Lifecycle of long-running background tasks owned by custom resources.
//!
//! Each owning resource has a set of named tasks (one event watcher and one
//! metrics gatherer per Sentinel endpoint). [`Manager::reconcile_threads`]
//! brings the running set in line with the desired one and
//! [`Manager::cleanup`] tears everything down when the resource is deleted.
//! Tasks signal the reconcile loop through a shared channel, so the manager
//! never needs to know what a change means for a given task type.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, warn};

/// Errors starting a background task.
#[derive(Error, Debug)]
pub enum ThreadError {
    #[error("thread {id} has no event channel")]
    NoChannel { id: String },

    #[error("thread {id} failed to start: {reason}")]
    Start { id: String, reason: String },
}

/// A named background task.
#[async_trait]
pub trait RunnableThread<E>: Send + Sync {
    /// Stable ID, unique per owner.
    fn id(&self) -> &str;

    /// Channel used to request a reconcile of the owner.
    fn set_channel(&mut self, tx: mpsc::Sender<E>);

    /// Spawn the task. Starting a started task is a no-op.
    fn start(&mut self) -> Result<(), ThreadError>;

    /// Stop the task and wait for it to finish.
    async fn stop(&mut self);

    fn is_started(&self) -> bool;

    /// Whether the registry may drop the handle.
    fn can_be_deleted(&self) -> bool {
        !self.is_started()
    }
}

/// A spawned task and the token that stops it.
#[derive(Debug)]
pub struct TaskHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    /// Spawn `task` in `span`, handing it the cancellation token it must
    /// watch.
    pub fn spawn<F, Fut>(span: Span, task: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let handle = tokio::spawn(task(token.clone()).instrument(span));
        Self { token, handle }
    }

    /// The task has not returned (or panicked) yet.
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Cancel and wait for the task to return.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await
            && e.is_panic()
        {
            warn!(error = %e, "Background task panicked");
        }
    }
}

type Registry<E> =HashMap<String, HashMap<String, Box<dyn RunnableThread<E>>>>;

/// Registry of running tasks, keyed by owner then task ID.
pub struct Manager<E> {
    threads: Mutex<Registry<E>>,
    tx: mpsc::Sender<E>,
}

impl<E: Send + 'static> Manager<E> {
    pub fn new(tx: mpsc::Sender<E>) -> Self {
        Self {
            threads: Mutex::new(HashMap::new()),
            tx,
        }
    }

    /// Start desired tasks that are not running, stop running tasks that are
    /// no longer desired, and leave the rest untouched.
    ///
    /// A desired task whose ID is already running is dropped unused.
    pub async fn reconcile_threads(
        &self,
        owner: &str,
        desired: Vec<Box<dyn RunnableThread<E>>>,
    ) -> Result<(), ThreadError> {
        let mut registry = self.threads.lock().await;
        let running = registry.entry(owner.to_string()).or_default();

        let desired_ids: BTreeSet<String> = desired.iter().map(|t| t.id().to_string()).collect();

        let undesired: Vec<String> = running
            .keys()
            .filter(|id| !desired_ids.contains(*id))
            .cloned()
            .collect();
        for id in undesired {
            if let Some(thread) = running.get_mut(&id) {
                thread.stop().await;
                if thread.can_be_deleted() {
                    running.remove(&id);
                    info!(owner = %owner, thread = %id, "Thread stopped and removed");
                } else {
                    warn!(owner = %owner, thread = %id, "Thread could not be deleted yet");
                }
            }
        }

        let mut first_error = None;
        for mut thread in desired {
            let id = thread.id().to_string();
            if running.get(&id).is_some_and(|t| t.is_started()) {
                continue;
            }
            thread.set_channel(self.tx.clone());
            match thread.start() {
                Ok(()) => {
                    info!(owner = %owner, thread = %id, "Thread started");
                    running.insert(id, thread);
                }
                Err(e) => {
                    warn!(owner = %owner, thread = %id, error = %e, "Thread failed to start");
                    first_error.get_or_insert(e);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Stop and remove every task of an owner.
    pub async fn cleanup(&self, owner: &str) {
        let mut registry = self.threads.lock().await;
        if let Some(mut threads) = registry.remove(owner) {
            for (id, thread) in threads.iter_mut() {
                thread.stop().await;
                debug!(owner = %owner, thread = %id, "Thread stopped");
            }
            info!(owner = %owner, count = threads.len(), "Threads cleaned up");
        }
    }

    /// IDs of an owner's registered tasks, sorted.
    pub async fn thread_ids(&self, owner: &str) -> Vec<String> {
        let registry = self.threads.lock().await;
        let mut ids: Vec<String> = registry
            .get(owner)
            .map(|threads| threads.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub async fn is_running(&self, owner: &str, id: &str) -> bool {
        self.threads
            .lock()
            .await
            .get(owner)
            .and_then(|threads| threads.get(id))
            .is_some_and(|t| t.is_started())
    }
}
