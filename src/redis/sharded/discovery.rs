//! Discovery options and the typed discovery error aggregate.
//!
//! A discovery round touches many independent servers. Each failure is kept
//! as a [`DiscoveryError`] carrying its class and scope (shard, server), and a
//! round's failures are collected into [`DiscoveryErrors`]. Callers branch on
//! the classes present instead of on error strings.

use std::collections::BTreeSet;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::redis::client::RedisError;

/// Extra facts to read from each server during discovery.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum DiscoveryOption {
    /// `slave-read-only` config key (slaves only).
    SlaveReadOnly,
    /// `save` config key, to detect whether RDB persistence is enabled.
    SaveConfig,
    /// `slave-priority` config key.
    SlavePriority,
    /// Link status and sync progress from `INFO replication` (slaves only).
    ReplicationInfo,
}

/// Set of enabled discovery options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryOptions(BTreeSet<DiscoveryOption>);

impl DiscoveryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every option enabled.
    pub fn all() -> Self {
        [
            DiscoveryOption::SlaveReadOnly,
            DiscoveryOption::SaveConfig,
            DiscoveryOption::SlavePriority,
            DiscoveryOption::ReplicationInfo,
        ]
        .into_iter()
        .collect()
    }

    pub fn with(mut self, option: DiscoveryOption) -> Self {
        self.0.insert(option);
        self
    }

    pub fn has(&self, option: DiscoveryOption) -> bool {
        self.0.contains(&option)
    }
}

impl FromIterator<DiscoveryOption> for DiscoveryOptions {
    fn from_iter<T: IntoIterator<Item = DiscoveryOption>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// One failure observed during a discovery round.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// Sentinel could not be queried at all. Fatal to the round.
    #[error("sentinel failure{}: {source}", scope(shard.as_deref()))]
    SentinelFailure {
        shard: Option<String>,
        #[source]
        source: RedisError,
    },

    /// The shard's master could not be discovered or disagrees with Sentinel.
    #[error("shard {shard}: master {server} failure: {source}")]
    MasterFailure {
        shard: String,
        server: String,
        #[source]
        source: RedisError,
    },

    /// A slave could not be discovered or disagrees with Sentinel.
    #[error("shard {shard}: slave {server} failure: {source}")]
    SlaveFailure {
        shard: String,
        server: String,
        #[source]
        source: RedisError,
    },

    /// A slave is still pointing at a placeholder master while Sentinel
    /// reconfigures the shard.
    #[error("shard {shard}: slave {server} failover in progress (replicating from {master})")]
    SlaveFailoverInProgress {
        shard: String,
        server: String,
        master: String,
    },

    /// A server whose role is not known yet could not be discovered.
    #[error("shard {shard}: server {server} failure: {source}")]
    ServerFailure {
        shard: String,
        server: String,
        #[source]
        source: RedisError,
    },

    /// More than one member reported itself as master.
    #[error("shard {shard}: more than one master ({})", masters.join(", "))]
    InconsistentMasters { shard: String, masters: Vec<String> },
}

fn scope(shard: Option<&str>) -> String {
    shard.map(|s| format!(" (shard {})", s)).unwrap_or_default()
}

impl DiscoveryError {
    /// Fatal errors abort the discovery round; everything else is expected to
    /// self-correct on the next Sentinel driven reconcile.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DiscoveryError::SentinelFailure { .. })
    }

    /// Shard the error is scoped to, if any.
    pub fn shard(&self) -> Option<&str> {
        match self {
            DiscoveryError::SentinelFailure { shard, .. } => shard.as_deref(),
            DiscoveryError::MasterFailure { shard, .. }
            | DiscoveryError::SlaveFailure { shard, .. }
            | DiscoveryError::SlaveFailoverInProgress { shard, .. }
            | DiscoveryError::ServerFailure { shard, .. }
            | DiscoveryError::InconsistentMasters { shard, .. } => Some(shard),
        }
    }

    /// Server the error is scoped to, if any.
    pub fn server(&self) -> Option<&str> {
        match self {
            DiscoveryError::MasterFailure { server, .. }
            | DiscoveryError::SlaveFailure { server, .. }
            | DiscoveryError::SlaveFailoverInProgress { server, .. }
            | DiscoveryError::ServerFailure { server, .. } => Some(server),
            DiscoveryError::SentinelFailure { .. } | DiscoveryError::InconsistentMasters { .. } => {
                None
            }
        }
    }

    /// Stable, low-cardinality name of the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            DiscoveryError::SentinelFailure { .. } => "sentinel_failure",
            DiscoveryError::MasterFailure { .. } => "master_failure",
            DiscoveryError::SlaveFailure { .. } => "slave_failure",
            DiscoveryError::SlaveFailoverInProgress { .. } => "slave_failover_in_progress",
            DiscoveryError::ServerFailure { .. } => "server_failure",
            DiscoveryError::InconsistentMasters { .. } => "inconsistent_masters",
        }
    }
}

/// All failures of one discovery round. Empty means full success.
#[derive(Debug, Default)]
pub struct DiscoveryErrors(Vec<DiscoveryError>);

impl DiscoveryErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: DiscoveryError) {
        self.0.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DiscoveryError> {
        self.0.iter()
    }

    /// Whether any constituent aborts the round.
    pub fn has_fatal(&self) -> bool {
        self.0.iter().any(DiscoveryError::is_fatal)
    }

    /// Whether any constituent matches the predicate.
    pub fn contains(&self, predicate: impl Fn(&DiscoveryError) -> bool) -> bool {
        self.0.iter().any(predicate)
    }

    /// Errors scoped to one shard.
    pub fn for_shard<'a>(&'a self, shard: &'a str) -> impl Iterator<Item = &'a DiscoveryError> {
        self.0.iter().filter(move |e| e.shard() == Some(shard))
    }

    /// `Ok(())` when empty, the aggregate otherwise.
    pub fn into_result(self) -> Result<(), DiscoveryErrors> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }

    pub fn into_inner(self) -> Vec<DiscoveryError> {
        self.0
    }
}

impl std::fmt::Display for DiscoveryErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.as_slice() {
            [] => write!(f, "no discovery errors"),
            [single] => write!(f, "{}", single),
            errors => {
                write!(f, "{} discovery errors: ", errors.len())?;
                for (i, e) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for DiscoveryErrors {}

impl From<DiscoveryError> for DiscoveryErrors {
    fn from(error: DiscoveryError) -> Self {
        Self(vec![error])
    }
}

impl Extend<DiscoveryError> for DiscoveryErrors {
    fn extend<T: IntoIterator<Item = DiscoveryError>>(&mut self, iter: T) {
        self.0.extend(iter);
    }
}

impl IntoIterator for DiscoveryErrors {
    type Item = DiscoveryError;
    type IntoIter = std::vec::IntoIter<DiscoveryError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a DiscoveryErrors {
    type Item = &'a DiscoveryError;
    type IntoIter = std::slice::Iter<'a, DiscoveryError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
