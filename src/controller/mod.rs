//! Controller module for saas-operator.
//!
//! Contains the Sentinel reconciliation loop, error handling and status
//! management.

pub mod common;
pub mod context;
pub mod error;
pub mod sentinel_reconciler;
pub mod status;
