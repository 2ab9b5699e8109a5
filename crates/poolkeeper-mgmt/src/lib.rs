//! poolkeeper: authenticated administration core for host storage pools.
//! Admin API, CLI, topology validation, device replacement, usage stats, audit trail.

pub mod api;
pub mod audit_trail;
pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod mock_executor;
pub mod notes;
pub mod pool_lock;
pub mod pool_manager;
pub mod replace;
pub mod security;
pub mod stats;
pub mod token_store;
pub mod topology;
pub mod types;
pub mod zpool_cli;

pub use api::AdminApi;
pub use audit_trail::{AuditLogger, AuditRecord, FileAuditStore, MemoryAuditStore};
pub use auth::{AuthContext, AuthGate};
pub use config::{AdminConfig, ExecutorKind};
pub use error::{AdminError, AdminResult};
pub use executor::{ExecutorError, PoolExecutor};
pub use mock_executor::MockExecutor;
pub use pool_manager::PoolManager;
pub use replace::DeviceReplacer;
pub use stats::StatsCollector;
pub use token_store::IssuedTokenStore;
pub use zpool_cli::ZpoolCliExecutor;
