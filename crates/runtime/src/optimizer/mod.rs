//! Logical optimizer rules for remote scans.
pub mod limit_pushdown;

pub use limit_pushdown::RemoteLimitPushdown;
