use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audit_trail::DEFAULT_MEMORY_CAPACITY;
use crate::stats::StatsConfig;

/// Which executor backs pool operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    #[default]
    Zpool,
    Mock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub bind_addr: SocketAddr,
    /// HS256 secret shared with the login service.
    pub token_secret: String,
    /// Tokens registered with the token store at startup.
    pub issued_tokens: Vec<String>,
    pub executor: ExecutorKind,
    pub zpool_bin: PathBuf,
    pub stats_interval_secs: u64,
    pub stats_retention_points: usize,
    pub stats_max_age_secs: Option<u64>,
    /// A pool's stats query is abandoned after this long.
    pub stats_query_timeout_secs: u64,
    /// JSON-lines audit file; in-memory audit when unset.
    pub audit_log_path: Option<PathBuf>,
    pub audit_memory_capacity: usize,
    pub log_json: bool,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8420)),
            token_secret: String::new(),
            issued_tokens: Vec::new(),
            executor: ExecutorKind::Zpool,
            zpool_bin: PathBuf::from("/sbin/zpool"),
            stats_interval_secs: 60,
            stats_retention_points: 1440,
            stats_max_age_secs: None,
            stats_query_timeout_secs: 10,
            audit_log_path: None,
            audit_memory_capacity: DEFAULT_MEMORY_CAPACITY,
            log_json: false,
        }
    }
}

impl AdminConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: AdminConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Loads `path`, or defaults when it does not exist.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.stats_interval_secs == 0 {
            anyhow::bail!("stats_interval_secs must be greater than zero");
        }
        if self.stats_retention_points == 0 {
            anyhow::bail!("stats_retention_points must be greater than zero");
        }
        if self.stats_query_timeout_secs == 0 {
            anyhow::bail!("stats_query_timeout_secs must be greater than zero");
        }
        if self.audit_memory_capacity == 0 {
            anyhow::bail!("audit_memory_capacity must be greater than zero");
        }
        Ok(())
    }

    pub fn stats_config(&self) -> StatsConfig {
        StatsConfig {
            interval: Duration::from_secs(self.stats_interval_secs),
            capacity: self.stats_retention_points,
            max_age_secs: self.stats_max_age_secs,
            query_timeout: Duration::from_secs(self.stats_query_timeout_secs),
        }
    }
}
