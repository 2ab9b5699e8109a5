//! Capability interface over the tool that actually runs pool operations.
//!
//! The core never assumes an executor call rolled back: after any call the
//! pool manager re-reads [`PoolExecutor::pool_status`] for the affected pool.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{PoolRecord, Zpool};

/// Result type alias for executor calls.
pub type ExecResult<T> = Result<T, ExecutorError>;

/// Failures reported by an executor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    #[error("failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("`{command}` exited with status {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("unparseable output from `{command}`: {reason}")]
    Parse { command: String, reason: String },

    /// The executor refused the operation.
    #[error("{0}")]
    Rejected(String),
}

/// Live capacity metrics for one pool.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolUsage {
    pub allocated: u64,
    pub free: u64,
    pub size: u64,
    pub dedup_ratio: f64,
}

#[async_trait]
pub trait PoolExecutor: Send + Sync {
    /// Creates a pool from an already-validated spec.
    async fn create_pool(&self, spec: &Zpool) -> ExecResult<()>;

    async fn destroy_pool(&self, name: &str, force: bool) -> ExecResult<()>;

    async fn import_pool(&self, name: &str, force: bool) -> ExecResult<()>;

    async fn export_pool(&self, name: &str) -> ExecResult<()>;

    async fn set_properties(&self, name: &str, properties: &HashMap<String, String>)
        -> ExecResult<()>;

    async fn add_spares(&self, name: &str, devices: &[String]) -> ExecResult<()>;

    async fn remove_vdev(&self, name: &str, vdev: &str) -> ExecResult<()>;

    /// Attaches `new` in place of `old` and starts the resilver. Returns once
    /// the resilver has been initiated, not when it completes.
    async fn replace_device(&self, name: &str, old: &str, new: &str) -> ExecResult<()>;

    /// Authoritative state of one pool; `None` when the pool does not exist.
    async fn pool_status(&self, name: &str) -> ExecResult<Option<PoolRecord>>;

    /// Authoritative state of every imported pool.
    async fn list_pools(&self) -> ExecResult<Vec<PoolRecord>>;

    async fn query_stats(&self, name: &str) -> ExecResult<PoolUsage>;
}
