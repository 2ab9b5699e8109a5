//! Replace-in-place workflow for a single device of an existing pool.
//!
//! Validate -> Attach -> Resilver (initiated, not awaited) -> Complete.
//! Nothing reaches the executor until validation passes, and the new device
//! stays claimed until the pool has been re-read. After an attach
//! failure the pool is re-read from the executor, because the old and new
//! devices can be left half-swapped.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info};

use crate::audit_trail::AuditAction;
use crate::auth::AuthContext;
use crate::error::{AdminError, AdminResult};
use crate::pool_manager::PoolManager;
use crate::topology;
use crate::types::{device_owner, ReplaceDevice, MAX_REPLACE_PATH_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceState {
    Validate,
    Attach,
    Resilver,
    Complete,
}

/// Summary of a replacement that reached the resilver stage.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceReport {
    pub pool: String,
    pub old: String,
    pub new: String,
    pub states: Vec<ReplaceState>,
    pub resilver_started_at: i64,
}

pub struct DeviceReplacer {
    manager: Arc<PoolManager>,
}

impl DeviceReplacer {
    pub fn new(manager: Arc<PoolManager>) -> Self {
        Self { manager }
    }

    pub async fn replace_device(
        &self,
        actor: &AuthContext,
        pool: &str,
        request: ReplaceDevice,
    ) -> AdminResult<ReplaceReport> {
        let _guard = self.manager.locks().lock(pool).await;
        let target = format!("{}:{}->{}", pool, request.old, request.new);
        let result = self.run(pool, &request).await;
        self.manager
            .finish(actor, AuditAction::DeviceReplace, &target, result)
    }

    async fn run(&self, pool: &str, request: &ReplaceDevice) -> AdminResult<ReplaceReport> {
        let mut states = vec![ReplaceState::Validate];
        self.manager.reconcile(Some(pool)).await;
        self.validate(pool, request)?;
        let _claim = self
            .manager
            .claim_devices(pool, [request.new.as_str()])
            .map_err(|conflict| AdminError::DeviceAlreadyInUse {
                device: conflict.device,
                pool: conflict.pool,
            })?;

        states.push(ReplaceState::Attach);
        info!(pool = %pool, old = %request.old, new = %request.new, "attaching replacement device");
        if let Err(cause) = self
            .manager
            .executor()
            .replace_device(pool, &request.old, &request.new)
            .await
        {
            error!(pool = %pool, old = %request.old, new = %request.new, error = %cause, "device replace failed");
            self.manager.refresh(pool).await;
            return Err(AdminError::ReplaceFailed {
                pool: pool.to_string(),
                cause,
            });
        }

        states.push(ReplaceState::Resilver);
        let resilver_started_at = Utc::now().timestamp();
        info!(pool = %pool, new = %request.new, "resilver initiated");
        self.manager.refresh(pool).await;

        states.push(ReplaceState::Complete);
        Ok(ReplaceReport {
            pool: pool.to_string(),
            old: request.old.clone(),
            new: request.new.clone(),
            states,
            resilver_started_at,
        })
    }

    fn validate(&self, pool: &str, request: &ReplaceDevice) -> AdminResult<()> {
        for (field, value) in [("old", &request.old), ("new", &request.new)] {
            if value.trim().is_empty() || value.len() > MAX_REPLACE_PATH_LEN {
                return Err(AdminError::InvalidRequest {
                    reason: format!("{} must be 1..={} characters", field, MAX_REPLACE_PATH_LEN),
                });
            }
            topology::validate_device_path(field, value)?;
        }

        let inventory = self.manager.inventory_snapshot();
        let record = inventory.get(pool).ok_or_else(|| AdminError::PoolNotFound {
            name: pool.to_string(),
        })?;
        if !record.has_member(&request.old) {
            return Err(AdminError::DeviceNotInPool {
                pool: pool.to_string(),
                device: request.old.clone(),
            });
        }
        if let Some(owner) = device_owner(&inventory, &request.new) {
            return Err(AdminError::DeviceAlreadyInUse {
                device: request.new.clone(),
                pool: owner.to_string(),
            });
        }
        Ok(())
    }
}
