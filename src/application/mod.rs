//! Application layer orchestrating the payment lifecycle.
//!
//! Each service is built per run from explicit ports and a [`context::RunContext`];
//! none of them keep state between invocations beyond what the stores hold.
//! Batch loops tally per-item failures and always return a summary.

pub mod attempts;
pub mod context;
pub mod dispatch;
pub mod ingest;
pub mod instalments;
pub mod payability;
pub mod reconcile;
pub mod registry;
pub mod webhook_log;
