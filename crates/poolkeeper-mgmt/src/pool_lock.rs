//! Keyed exclusive sections: at most one mutating operation per pool name,
//! and at most one in-flight claim per device path.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockTable = DashMap<String, Arc<Mutex<()>>>;

/// Map from pool name to its lock. Entries are created on demand and
/// dropped once no guard or waiter references them.
#[derive(Clone, Default)]
pub struct PoolLocks {
    table: Arc<LockTable>,
}

/// Held for the duration of one pool operation. Releases on drop.
pub struct PoolGuard {
    name: String,
    guard: Option<OwnedMutexGuard<()>>,
    table: Arc<LockTable>,
}

impl PoolLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, name: &str) -> Arc<Mutex<()>> {
        self.table
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Waits for the exclusive section of `name`.
    pub async fn lock(&self, name: &str) -> PoolGuard {
        let handle = self.handle(name);
        let guard = handle.lock_owned().await;
        PoolGuard {
            name: name.to_string(),
            guard: Some(guard),
            table: self.table.clone(),
        }
    }

    /// Takes the exclusive section of `name` only if it is free right now.
    pub fn try_lock(&self, name: &str) -> Option<PoolGuard> {
        let guard = self.handle(name).try_lock_owned().ok()?;
        Some(PoolGuard {
            name: name.to_string(),
            guard: Some(guard),
            table: self.table.clone(),
        })
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.table
            .get(name)
            .map(|m| m.value().try_lock().is_err())
            .unwrap_or(false)
    }

    /// Number of pool names currently tracked.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

fn release_idle(table: &LockTable, name: &str) {
    table.remove_if(name, |_, handle| Arc::strong_count(handle) == 1);
}

impl PoolGuard {
    pub fn pool(&self) -> &str {
        &self.name
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        release_idle(&self.table, &self.name);
    }
}

type ClaimTable = parking_lot::Mutex<HashMap<String, String>>;

/// Device paths reserved by in-flight operations, mapped to the claiming
/// pool. Pool locks serialize work on one pool; claims stop two different
/// pools from taking the same free device at once.
#[derive(Clone, Default)]
pub struct DeviceClaims {
    table: Arc<ClaimTable>,
}

/// A device already held by another pool or claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConflict {
    pub device: String,
    pub pool: String,
}

/// Releases its devices on drop.
pub struct ClaimGuard {
    pool: String,
    devices: Vec<String>,
    table: Arc<ClaimTable>,
}

impl DeviceClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves every device in `devices` for `pool`, or none of them.
    ///
    /// `owner` reports the pool that already holds a device. It is consulted
    /// while the claim table is locked, so the check and the reservation
    /// happen as one step.
    pub fn claim<'a, F>(
        &self,
        pool: &str,
        devices: impl IntoIterator<Item = &'a str>,
        owner: F,
    ) -> Result<ClaimGuard, DeviceConflict>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut devices: Vec<String> = devices.into_iter().map(str::to_string).collect();
        devices.sort_unstable();
        devices.dedup();

        let mut table = self.table.lock();
        for device in &devices {
            let holder = table.get(device).cloned().or_else(|| owner(device));
            if let Some(holder) = holder {
                return Err(DeviceConflict {
                    device: device.clone(),
                    pool: holder,
                });
            }
        }
        for device in &devices {
            table.insert(device.clone(), pool.to_string());
        }
        Ok(ClaimGuard {
            pool: pool.to_string(),
            devices,
            table: self.table.clone(),
        })
    }

    pub fn is_claimed(&self, device: &str) -> bool {
        self.table.lock().contains_key(device)
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }
}

impl ClaimGuard {
    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn devices(&self) -> &[String] {
        &self.devices
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        for device in &self.devices {
            if table.get(device) == Some(&self.pool) {
                table.remove(device);
            }
        }
    }
}
