//! Custom Resource Definitions (CRDs) for saas-operator.
//!
//! - `Sentinel`: Redis Sentinels and the shards they monitor

mod sentinel;

pub use sentinel::*;
