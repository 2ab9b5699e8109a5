//! Pool lifecycle orchestration.
//!
//! Every mutating operation follows the same shape:
//!
//! 1. take the pool's exclusive section ([`PoolLocks`]);
//! 2. re-read pools left stale by an earlier failed refresh;
//! 3. check preconditions / run the topology validator, claiming any new
//!    devices ([`DeviceClaims`]);
//! 4. call the executor;
//! 5. re-read the pool from the executor and update the inventory;
//! 6. write exactly one audit record;
//! 7. release the claims and the exclusive section (guard drop, on every path).

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::audit_trail::{AuditAction, AuditLogger, AuditOutcome};
use crate::auth::AuthContext;
use crate::error::{AdminError, AdminResult};
use crate::executor::PoolExecutor;
use crate::pool_lock::{ClaimGuard, DeviceClaims, DeviceConflict, PoolLocks};
use crate::topology::{self, TopologyError};
use crate::types::{device_owner, Inventory, PoolRecord, Zpool};

pub struct PoolManager {
    executor: Arc<dyn PoolExecutor>,
    inventory: RwLock<Inventory>,
    locks: PoolLocks,
    claims: DeviceClaims,
    /// Pools whose last re-read failed; their inventory entry may be wrong.
    stale: Mutex<BTreeSet<String>>,
    audit: AuditLogger,
}

impl PoolManager {
    pub fn new(executor: Arc<dyn PoolExecutor>, audit: AuditLogger) -> Self {
        Self {
            executor,
            inventory: RwLock::new(Inventory::new()),
            locks: PoolLocks::new(),
            claims: DeviceClaims::new(),
            stale: Mutex::new(BTreeSet::new()),
            audit,
        }
    }

    pub fn executor(&self) -> &Arc<dyn PoolExecutor> {
        &self.executor
    }

    pub fn locks(&self) -> &PoolLocks {
        &self.locks
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn claims(&self) -> &DeviceClaims {
        &self.claims
    }

    /// Names of pools waiting for a successful re-read.
    pub fn stale_pools(&self) -> Vec<String> {
        self.stale.lock().iter().cloned().collect()
    }

    /// Replaces the whole inventory with the executor's view.
    pub async fn sync_inventory(&self) -> AdminResult<usize> {
        let pools = self.executor.list_pools().await?;
        let fresh: Inventory = pools.into_iter().map(|p| (p.name.clone(), p)).collect();
        let count = fresh.len();
        *self.inventory.write() = fresh;
        self.stale.lock().clear();
        info!(pools = count, "inventory synchronized");
        Ok(count)
    }

    pub fn list_pools(&self) -> Vec<PoolRecord> {
        self.inventory.read().values().cloned().collect()
    }

    pub fn get_pool(&self, name: &str) -> AdminResult<PoolRecord> {
        self.inventory
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| AdminError::PoolNotFound {
                name: name.to_string(),
            })
    }

    pub fn pool_names(&self) -> Vec<String> {
        self.inventory.read().keys().cloned().collect()
    }

    pub fn inventory_snapshot(&self) -> Inventory {
        self.inventory.read().clone()
    }

    pub async fn create_pool(&self, actor: &AuthContext, spec: Zpool) -> AdminResult<PoolRecord> {
        let _guard = self.locks.lock(&spec.name).await;
        let result = self.create_locked(&spec).await;
        self.finish(actor, AuditAction::PoolCreate, &spec.name, result)
    }

    async fn create_locked(&self, spec: &Zpool) -> AdminResult<PoolRecord> {
        self.reconcile(Some(&spec.name)).await;
        topology::validate(spec, &self.inventory.read())?;
        let devices = spec
            .vdevs
            .iter()
            .flat_map(|v| v.devices.iter())
            .chain(spec.spares.iter())
            .map(String::as_str);
        let _claim = self.claim_devices(&spec.name, devices).map_err(in_use)?;

        if let Err(err) = self.executor.create_pool(spec).await {
            error!(pool = %spec.name, error = %err, "pool create failed");
            return Err(err.into());
        }
        info!(pool = %spec.name, kind = %spec.raid_type, force = spec.create_force, "pool created");

        let record = match self.executor.pool_status(&spec.name).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(pool = %spec.name, "created pool not reported by executor, using requested layout");
                self.stale.lock().insert(spec.name.clone());
                PoolRecord::from_spec(spec)
            }
            Err(err) => {
                warn!(pool = %spec.name, error = %err, "status after create failed, using requested layout");
                self.stale.lock().insert(spec.name.clone());
                PoolRecord::from_spec(spec)
            }
        };
        self.inventory
            .write()
            .insert(spec.name.clone(), record.clone());
        Ok(record)
    }

    pub async fn import_pool(
        &self,
        actor: &AuthContext,
        name: &str,
        force: bool,
    ) -> AdminResult<PoolRecord> {
        let _guard = self.locks.lock(name).await;
        let result: AdminResult<PoolRecord> = async {
            topology::validate_pool_name(name)?;
            self.reconcile(Some(name)).await;
            if self.inventory.read().contains_key(name) {
                return Err(TopologyError::DuplicateName {
                    name: name.to_string(),
                }
                .into());
            }
            let outcome = self.executor.import_pool(name, force).await;
            self.refresh(name).await;
            outcome?;
            info!(pool = %name, force, "pool imported");
            self.get_pool(name)
        }
        .await;
        self.finish(actor, AuditAction::PoolImport, name, result)
    }

    pub async fn export_pool(&self, actor: &AuthContext, name: &str) -> AdminResult<()> {
        let _guard = self.locks.lock(name).await;
        let result: AdminResult<()> = async {
            self.require(name).await?;
            let outcome = self.executor.export_pool(name).await;
            self.refresh(name).await;
            outcome?;
            info!(pool = %name, "pool exported");
            Ok(())
        }
        .await;
        self.finish(actor, AuditAction::PoolExport, name, result)
    }

    pub async fn destroy_pool(&self, actor: &AuthContext, name: &str, force: bool) -> AdminResult<()> {
        let _guard = self.locks.lock(name).await;
        let result: AdminResult<()> = async {
            self.require(name).await?;
            let outcome = self.executor.destroy_pool(name, force).await;
            self.refresh(name).await;
            outcome?;
            info!(pool = %name, force, "pool destroyed");
            Ok(())
        }
        .await;
        self.finish(actor, AuditAction::PoolDestroy, name, result)
    }

    pub async fn set_properties(
        &self,
        actor: &AuthContext,
        name: &str,
        properties: HashMap<String, String>,
    ) -> AdminResult<PoolRecord> {
        let _guard = self.locks.lock(name).await;
        let result: AdminResult<PoolRecord> = async {
            self.require(name).await?;
            if properties.is_empty() {
                return Err(AdminError::InvalidRequest {
                    reason: "no properties given".to_string(),
                });
            }
            if let Some(key) = properties
                .keys()
                .find(|k| k.trim().is_empty() || k.contains('='))
            {
                return Err(TopologyError::InvalidProperty { key: key.clone() }.into());
            }
            let outcome = self.executor.set_properties(name, &properties).await;
            self.refresh(name).await;
            outcome?;
            info!(pool = %name, count = properties.len(), "pool properties set");
            self.get_pool(name)
        }
        .await;
        self.finish(actor, AuditAction::PoolSetProperties, name, result)
    }

    /// Adds hot spares. Each device must be unused anywhere and listed once.
    pub async fn add_spares(
        &self,
        actor: &AuthContext,
        name: &str,
        devices: Vec<String>,
    ) -> AdminResult<PoolRecord> {
        let _guard = self.locks.lock(name).await;
        let result: AdminResult<PoolRecord> = async {
            self.require(name).await?;
            if devices.is_empty() {
                return Err(AdminError::InvalidRequest {
                    reason: "no spare devices given".to_string(),
                });
            }
            let mut seen = HashSet::new();
            for device in &devices {
                topology::validate_device_path("spares", device)?;
                if !seen.insert(device.as_str()) {
                    return Err(TopologyError::DuplicateDevice {
                        device: device.clone(),
                    }
                    .into());
                }
            }
            topology::validate_devices_unused(devices.iter().map(String::as_str), &self.inventory.read())?;
            let _claim = self
                .claim_devices(name, devices.iter().map(String::as_str))
                .map_err(in_use)?;

            let outcome = self.executor.add_spares(name, &devices).await;
            self.refresh(name).await;
            outcome?;
            info!(pool = %name, spares = ?devices, "spares added");
            self.get_pool(name)
        }
        .await;
        self.finish(actor, AuditAction::PoolAddSpares, name, result)
    }

    pub async fn remove_vdev(
        &self,
        actor: &AuthContext,
        name: &str,
        vdev: &str,
    ) -> AdminResult<PoolRecord> {
        let _guard = self.locks.lock(name).await;
        let target = format!("{}/{}", name, vdev);
        let result: AdminResult<PoolRecord> = async {
            let pool = self.require(name).await?;
            let is_member_device = pool.has_member(vdev) || pool.spares.iter().any(|s| s == vdev);
            if pool.vdev(vdev).is_none() && !is_member_device {
                return Err(AdminError::DeviceNotInPool {
                    pool: name.to_string(),
                    device: vdev.to_string(),
                });
            }
            let outcome = self.executor.remove_vdev(name, vdev).await;
            self.refresh(name).await;
            outcome?;
            info!(pool = %name, vdev = %vdev, "vdev removed");
            self.get_pool(name)
        }
        .await;
        self.finish(actor, AuditAction::PoolRemoveVdev, &target, result)
    }

    /// Looks up a pool the caller holds the lock for, re-reading stale
    /// entries first.
    pub(crate) async fn require(&self, name: &str) -> AdminResult<PoolRecord> {
        self.reconcile(Some(name)).await;
        self.get_pool(name)
    }

    /// Reserves devices a running operation is about to hand to the executor.
    /// A device counts as taken when any pool in the inventory holds it or
    /// another operation has claimed it.
    pub(crate) fn claim_devices<'a>(
        &self,
        pool: &str,
        devices: impl IntoIterator<Item = &'a str>,
    ) -> Result<ClaimGuard, DeviceConflict> {
        self.claims.claim(pool, devices, |device| {
            device_owner(&self.inventory.read(), device).map(str::to_string)
        })
    }

    /// Re-reads pools whose last refresh failed and returns how many are now
    /// accurate. `held` names the pool whose lock the caller already owns.
    /// Any other stale pool is skipped while busy; its running operation
    /// refreshes it on completion.
    pub async fn reconcile(&self, held: Option<&str>) -> usize {
        let names = self.stale_pools();
        let mut repaired = 0;
        for name in names {
            let _guard = if held == Some(name.as_str()) {
                None
            } else {
                match self.locks.try_lock(&name) {
                    Some(guard) => Some(guard),
                    None => continue,
                }
            };
            if self.refresh(&name).await {
                repaired += 1;
            }
        }
        if repaired > 0 {
            info!(pools = repaired, "stale inventory entries reconciled");
        }
        repaired
    }

    /// Re-reads one pool from the executor. On failure the current entry is
    /// kept and the pool is marked stale until a later re-read succeeds.
    pub(crate) async fn refresh(&self, name: &str) -> bool {
        match self.executor.pool_status(name).await {
            Ok(Some(record)) => {
                self.inventory.write().insert(name.to_string(), record);
            }
            Ok(None) => {
                self.inventory.write().remove(name);
            }
            Err(err) => {
                warn!(pool = %name, error = %err, "pool refresh failed, inventory may be stale");
                self.stale.lock().insert(name.to_string());
                return false;
            }
        }
        self.stale.lock().remove(name);
        true
    }

    /// Writes the audit record for a finished operation. An audit failure
    /// replaces the operation's own result.
    pub(crate) fn finish<T>(
        &self,
        actor: &AuthContext,
        action: AuditAction,
        target: &str,
        result: AdminResult<T>,
    ) -> AdminResult<T> {
        let outcome = match &result {
            Ok(_) => AuditOutcome::Success,
            Err(err) => AuditOutcome::Failure {
                code: err.code().to_string(),
                reason: err.to_string(),
            },
        };
        match self
            .audit
            .append(&actor.principal, action, target, outcome, Utc::now())
        {
            Ok(_) => result,
            Err(audit_err) => {
                error!(
                    actor = %actor.principal,
                    ?action,
                    resource = %target,
                    operation_ok = result.is_ok(),
                    error = %audit_err,
                    "audit write failed"
                );
                Err(AdminError::AuditWrite(audit_err))
            }
        }
    }
}

fn in_use(conflict: DeviceConflict) -> AdminError {
    TopologyError::DeviceInUse {
        device: conflict.device,
        pool: conflict.pool,
    }
    .into()
}
