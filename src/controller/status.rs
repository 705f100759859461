//! Status management utilities.
//!
//! Provides helpers for building resource status conditions and the
//! Sentinel status projection.

use crate::crd::{Condition, ConditionType, SentinelStatus};
use crate::redis::sharded::{Cluster, DiscoveryErrors};

/// Builder for managing conditions list
pub struct ConditionBuilder {
    previous: Vec<Condition>,
    conditions: Vec<Condition>,
}

impl ConditionBuilder {
    /// Create a new condition builder
    pub fn new() -> Self {
        Self {
            previous: Vec::new(),
            conditions: Vec::new(),
        }
    }

    /// Builder that keeps the transition time of conditions whose status
    /// did not change.
    pub fn from_existing(previous: &[Condition]) -> Self {
        Self {
            previous: previous.to_vec(),
            conditions: Vec::new(),
        }
    }

    /// Add or update a condition
    pub fn set(&mut self, mut condition: Condition) -> &mut Self {
        if let Some(old) = self
            .previous
            .iter()
            .find(|c| c.r#type == condition.r#type)
            && old.status == condition.status
        {
            condition.last_transition_time = old.last_transition_time.clone();
        }

        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            *existing = condition;
        } else {
            self.conditions.push(condition);
        }
        self
    }

    /// Set Ready condition
    pub fn ready(
        &mut self,
        ready: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> &mut Self {
        self.set(Condition::ready(ready, reason, message, generation))
    }

    /// Set Degraded condition
    pub fn degraded(
        &mut self,
        degraded: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> &mut Self {
        self.set(Condition::degraded(degraded, reason, message, generation))
    }

    /// Build the conditions list
    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

impl Default for ConditionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Check if a condition type is true
pub fn is_condition_true(conditions: &[Condition], condition_type: ConditionType) -> bool {
    conditions
        .iter()
        .find(|c| c.r#type == condition_type.as_str())
        .is_some_and(|c| c.status == "True")
}

/// Get the reason for a condition
pub fn get_condition_reason(
    conditions: &[Condition],
    condition_type: ConditionType,
) -> Option<&str> {
    conditions
        .iter()
        .find(|c| c.r#type == condition_type.as_str())
        .map(|c| c.reason.as_str())
}

/// Status of a Sentinel after a discovery round.
///
/// Non-fatal discovery errors mark the resource degraded but keep it ready:
/// they are expected to clear on the next Sentinel driven reconcile.
pub fn build_status(
    cluster: &Cluster,
    errors: Option<&DiscoveryErrors>,
    generation: Option<i64>,
    previous: Option<&SentinelStatus>,
) -> SentinelStatus {
    let mut conditions =
        ConditionBuilder::from_existing(previous.map(|s| s.conditions.as_slice()).unwrap_or(&[]));

    conditions.ready(
        true,
        "TopologyDiscovered",
        &format!("{} shards monitored", cluster.shards().len()),
        generation,
    );
    match errors {
        Some(errors) if !errors.is_empty() => {
            conditions.degraded(true, "DiscoveryErrors", &errors.to_string(), generation)
        }
        _ => conditions.degraded(false, "DiscoverySucceeded", "All servers discovered", generation),
    };

    SentinelStatus {
        monitored_shards: cluster.to_status(),
        sentinels: cluster.sentinel_ids(),
        observed_generation: generation,
        conditions: conditions.build(),
    }
}
