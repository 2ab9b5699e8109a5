//! In-memory executor used by tests and by `executor = "mock"` deployments.
//!
//! Keeps a table of imported and exported pools, records every call, and can
//! be told to fail specific operations.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::executor::{ExecResult, ExecutorError, PoolExecutor, PoolUsage};
use crate::types::{PoolHealth, PoolRecord, Vdev, Zpool};

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Create,
    Destroy,
    Import,
    Export,
    SetProperties,
    AddSpares,
    RemoveVdev,
    Replace,
    Status,
    List,
    Stats,
}

#[derive(Default)]
struct MockState {
    imported: BTreeMap<String, PoolRecord>,
    exported: BTreeMap<String, PoolRecord>,
    usage: HashMap<String, PoolUsage>,
    failing: HashMap<MockOp, String>,
    failing_stats: HashMap<String, String>,
    calls: Vec<String>,
    partial_replace: bool,
}

pub struct MockExecutor {
    state: Mutex<MockState>,
    delay: Mutex<Option<Duration>>,
    stats_delay: Mutex<Option<Duration>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            delay: Mutex::new(None),
            stats_delay: Mutex::new(None),
        }
    }

    /// Seeds an imported pool.
    pub fn with_pool(self, record: PoolRecord) -> Self {
        self.state
            .lock()
            .imported
            .insert(record.name.clone(), record);
        self
    }

    /// Seeds a pool that is exported and can be imported.
    pub fn with_exported_pool(self, record: PoolRecord) -> Self {
        self.state
            .lock()
            .exported
            .insert(record.name.clone(), record);
        self
    }

    /// Makes every subsequent `op` fail with `reason` until [`clear_failure`](Self::clear_failure).
    pub fn fail(&self, op: MockOp, reason: &str) {
        self.state.lock().failing.insert(op, reason.to_string());
    }

    pub fn clear_failure(&self, op: MockOp) {
        self.state.lock().failing.remove(&op);
    }

    /// Makes stats queries for one pool fail while other pools still answer.
    pub fn fail_stats_for(&self, name: &str, reason: &str) {
        self.state
            .lock()
            .failing_stats
            .insert(name.to_string(), reason.to_string());
    }

    /// When set, a failing replace still attaches the new device next to the
    /// old one, leaving the vdev half-replaced.
    pub fn set_partial_replace(&self, partial: bool) {
        self.state.lock().partial_replace = partial;
    }

    /// Delays every mutating call, to widen race windows in tests.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Delays every stats query, standing in for a hung `zpool get`.
    pub fn set_stats_delay(&self, delay: Duration) {
        *self.stats_delay.lock() = Some(delay);
    }

    pub fn set_usage(&self, name: &str, usage: PoolUsage) {
        self.state.lock().usage.insert(name.to_string(), usage);
    }

    /// Names of the calls made so far, in order (`create:tank`, ...).
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn pool(&self, name: &str) -> Option<PoolRecord> {
        self.state.lock().imported.get(name).cloned()
    }

    fn begin(&self, op: MockOp, call: String) -> ExecResult<()> {
        debug!(call = %call, "mock executor call");
        let mut state = self.state.lock();
        state.calls.push(call);
        match state.failing.get(&op) {
            Some(reason) => Err(ExecutorError::Rejected(reason.clone())),
            None => Ok(()),
        }
    }

    async fn pause(&self) {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn missing(name: &str) -> ExecutorError {
        ExecutorError::Rejected(format!("cannot open '{}': no such pool", name))
    }

    fn in_use(state: &MockState, devices: &[&str]) -> Option<String> {
        let claimed: HashSet<&str> = state.imported.values().flat_map(|p| p.devices()).collect();
        devices
            .iter()
            .find(|d| claimed.contains(*d))
            .map(|d| d.to_string())
    }
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PoolExecutor for MockExecutor {
    async fn create_pool(&self, spec: &Zpool) -> ExecResult<()> {
        self.begin(MockOp::Create, format!("create:{}", spec.name))?;
        self.pause().await;
        let mut state = self.state.lock();
        if state.imported.contains_key(&spec.name) {
            return Err(ExecutorError::Rejected(format!(
                "cannot create '{}': pool already exists",
                spec.name
            )));
        }
        let devices: Vec<&str> = spec
            .vdevs
            .iter()
            .flat_map(|v| v.devices.iter().map(String::as_str))
            .chain(spec.spares.iter().map(String::as_str))
            .collect();
        if let Some(device) = Self::in_use(&state, &devices) {
            return Err(ExecutorError::Rejected(format!("{} is part of active pool", device)));
        }
        let mut record = PoolRecord::from_spec(spec);
        for (idx, vdev) in record.vdevs.iter_mut().enumerate() {
            if let Some(kw) = spec.raid_type.zpool_keyword() {
                vdev.name = format!("{}-{}", kw, idx);
            } else if vdev.name.is_empty() {
                vdev.name = vdev.devices.first().cloned().unwrap_or_default();
            }
        }
        state.imported.insert(spec.name.clone(), record);
        Ok(())
    }

    async fn destroy_pool(&self, name: &str, force: bool) -> ExecResult<()> {
        self.begin(MockOp::Destroy, format!("destroy:{}:{}", name, force))?;
        self.pause().await;
        let mut state = self.state.lock();
        state
            .imported
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Self::missing(name))
    }

    async fn import_pool(&self, name: &str, force: bool) -> ExecResult<()> {
        self.begin(MockOp::Import, format!("import:{}:{}", name, force))?;
        self.pause().await;
        let mut state = self.state.lock();
        let record = state
            .exported
            .remove(name)
            .ok_or_else(|| ExecutorError::Rejected(format!("cannot import '{}': no such pool available", name)))?;
        state.imported.insert(name.to_string(), record);
        Ok(())
    }

    async fn export_pool(&self, name: &str) -> ExecResult<()> {
        self.begin(MockOp::Export, format!("export:{}", name))?;
        self.pause().await;
        let mut state = self.state.lock();
        let record = state.imported.remove(name).ok_or_else(|| Self::missing(name))?;
        state.exported.insert(name.to_string(), record);
        Ok(())
    }

    async fn set_properties(
        &self,
        name: &str,
        properties: &HashMap<String, String>,
    ) -> ExecResult<()> {
        self.begin(MockOp::SetProperties, format!("set:{}", name))?;
        self.pause().await;
        let mut state = self.state.lock();
        let record = state.imported.get_mut(name).ok_or_else(|| Self::missing(name))?;
        for (k, v) in properties {
            record.properties.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    async fn add_spares(&self, name: &str, devices: &[String]) -> ExecResult<()> {
        self.begin(MockOp::AddSpares, format!("add-spares:{}", name))?;
        self.pause().await;
        let mut state = self.state.lock();
        let refs: Vec<&str> = devices.iter().map(String::as_str).collect();
        if let Some(device) = Self::in_use(&state, &refs) {
            return Err(ExecutorError::Rejected(format!("{} is in use", device)));
        }
        let record = state.imported.get_mut(name).ok_or_else(|| Self::missing(name))?;
        record.spares.extend(devices.iter().cloned());
        Ok(())
    }

    async fn remove_vdev(&self, name: &str, vdev: &str) -> ExecResult<()> {
        self.begin(MockOp::RemoveVdev, format!("remove:{}:{}", name, vdev))?;
        self.pause().await;
        let mut state = self.state.lock();
        let record = state.imported.get_mut(name).ok_or_else(|| Self::missing(name))?;
        if record.vdevs.len() <= 1 {
            return Err(ExecutorError::Rejected(format!(
                "cannot remove {}: pool must keep at least one vdev",
                vdev
            )));
        }
        let before = record.vdevs.len();
        record.vdevs.retain(|v| v.name != vdev);
        if record.vdevs.len() == before {
            return Err(ExecutorError::Rejected(format!("cannot remove {}: no such device in pool", vdev)));
        }
        Ok(())
    }

    async fn replace_device(&self, name: &str, old: &str, new: &str) -> ExecResult<()> {
        let started = self.begin(MockOp::Replace, format!("replace:{}:{}:{}", name, old, new));
        self.pause().await;
        let mut state = self.state.lock();
        let partial = state.partial_replace;
        let record = state.imported.get_mut(name).ok_or_else(|| Self::missing(name))?;
        let vdev: &mut Vdev = record
            .vdevs
            .iter_mut()
            .find(|v| v.devices.iter().any(|d| d == old))
            .ok_or_else(|| ExecutorError::Rejected(format!("no such device in pool: {}", old)))?;
        match started {
            Ok(()) => {
                for device in vdev.devices.iter_mut() {
                    if device == old {
                        *device = new.to_string();
                    }
                }
                record.health = PoolHealth::Online;
                Ok(())
            }
            Err(err) => {
                if partial {
                    vdev.devices.push(new.to_string());
                    record.health = PoolHealth::Degraded;
                }
                Err(err)
            }
        }
    }

    async fn pool_status(&self, name: &str) -> ExecResult<Option<PoolRecord>> {
        self.begin(MockOp::Status, format!("status:{}", name))?;
        Ok(self.state.lock().imported.get(name).cloned())
    }

    async fn list_pools(&self) -> ExecResult<Vec<PoolRecord>> {
        self.begin(MockOp::List, "list".to_string())?;
        Ok(self.state.lock().imported.values().cloned().collect())
    }

    async fn query_stats(&self, name: &str) -> ExecResult<PoolUsage> {
        self.begin(MockOp::Stats, format!("stats:{}", name))?;
        let delay = *self.stats_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock();
        if let Some(reason) = state.failing_stats.get(name) {
            return Err(ExecutorError::Rejected(reason.clone()));
        }
        if !state.imported.contains_key(name) {
            return Err(Self::missing(name));
        }
        Ok(state.usage.get(name).copied().unwrap_or(PoolUsage {
            allocated: 0,
            free: 0,
            size: 0,
            dedup_ratio: 1.0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RaidType;

    fn mirror(name: &str, devices: &[&str]) -> Zpool {
        Zpool {
            name: name.to_string(),
            raid_type: RaidType::Mirror,
            vdevs: vec![Vdev::new("", devices)],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_then_status() {
        let exec = MockExecutor::new();
        exec.create_pool(&mirror("tank", &["/dev/da0", "/dev/da1"])).await.unwrap();
        let status = exec.pool_status("tank").await.unwrap().unwrap();
        assert_eq!(status.vdevs[0].name, "mirror-0");
        assert_eq!(status.vdevs[0].devices, vec!["/dev/da0", "/dev/da1"]);
        assert_eq!(exec.calls(), vec!["create:tank", "status:tank"]);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let exec = MockExecutor::new();
        exec.fail(MockOp::Create, "disk on fire");
        let err = exec.create_pool(&mirror("tank", &["a", "b"])).await.unwrap_err();
        assert_eq!(err, ExecutorError::Rejected("disk on fire".into()));
        assert!(exec.pool("tank").is_none());

        exec.clear_failure(MockOp::Create);
        exec.create_pool(&mirror("tank", &["a", "b"])).await.unwrap();
        assert!(exec.pool("tank").is_some());
    }

    #[tokio::test]
    async fn test_export_import_cycle() {
        let exec = MockExecutor::new();
        exec.create_pool(&mirror("tank", &["a", "b"])).await.unwrap();
        exec.export_pool("tank").await.unwrap();
        assert!(exec.pool_status("tank").await.unwrap().is_none());
        exec.import_pool("tank", false).await.unwrap();
        assert!(exec.pool_status("tank").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_partial_replace_leaves_both_devices() {
        let exec = MockExecutor::new();
        exec.create_pool(&mirror("tank", &["a", "b"])).await.unwrap();
        exec.fail(MockOp::Replace, "attach failed");
        exec.set_partial_replace(true);
        assert!(exec.replace_device("tank", "a", "c").await.is_err());
        let status = exec.pool("tank").unwrap();
        assert_eq!(status.vdevs[0].devices, vec!["a", "b", "c"]);
        assert_eq!(status.health, PoolHealth::Degraded);
    }

    #[tokio::test]
    async fn test_replace_swaps_device() {
        let exec = MockExecutor::new();
        exec.create_pool(&mirror("tank", &["a", "b"])).await.unwrap();
        exec.replace_device("tank", "b", "c").await.unwrap();
        assert_eq!(exec.pool("tank").unwrap().vdevs[0].devices, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_stats_failure_scoped_to_one_pool() {
        let exec = MockExecutor::new();
        exec.create_pool(&mirror("tank", &["a", "b"])).await.unwrap();
        exec.create_pool(&mirror("backup", &["c", "d"])).await.unwrap();
        exec.fail_stats_for("backup", "i/o error");
        assert!(exec.query_stats("tank").await.is_ok());
        assert_eq!(
            exec.query_stats("backup").await.unwrap_err(),
            ExecutorError::Rejected("i/o error".into())
        );
    }
}
