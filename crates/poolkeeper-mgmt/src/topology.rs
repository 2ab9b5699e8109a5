//! Structural validation of pool creation requests.
//!
//! [`validate`] is pure: it inspects a [`Zpool`] spec and a borrowed view of
//! the current [`Inventory`] and never touches an executor. The first
//! violation found is returned. Name collisions are reported before any
//! other problem; the remaining checks cover name format, vdev layout,
//! spares, devices claimed by other pools and property keys, in that order.

use std::collections::HashSet;

use serde::Serialize;
use thiserror::Error;

use crate::types::{device_owner, Inventory, RaidType, Zpool, MAX_POOL_NAME_LEN};

/// A structural invariant violated by a pool spec.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TopologyError {
    #[error("invalid pool name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("pool {name} already exists")]
    DuplicateName { name: String },

    #[error("pool spec contains no vdevs")]
    EmptyVdevList,

    #[error("vdev {vdev:?} has no devices")]
    EmptyVdev { vdev: String },

    #[error("vdev {vdev:?} contains an empty device path")]
    EmptyDevicePath { vdev: String },

    #[error("invalid device path {device:?}")]
    InvalidDevicePath { device: String },

    #[error("device {device} appears more than once")]
    DuplicateDevice { device: String },

    #[error("device {device} already belongs to pool {pool}")]
    DeviceInUse { device: String, pool: String },

    #[error("vdev {vdev:?} has {actual} devices, {raid_type} requires at least {required}")]
    UndersizedVdev {
        vdev: String,
        raid_type: RaidType,
        required: usize,
        actual: usize,
    },

    #[error("spare {device} is also a vdev member")]
    SpareOverlap { device: String },

    #[error("invalid property {key:?}")]
    InvalidProperty { key: String },
}

/// Checks a pool name: 1..=24 ASCII alphanumeric characters.
pub fn validate_pool_name(name: &str) -> Result<(), TopologyError> {
    let reason = if name.is_empty() {
        Some("must not be empty")
    } else if name.len() > MAX_POOL_NAME_LEN {
        Some("longer than 24 characters")
    } else if !name.chars().all(|c| c.is_ascii_alphanumeric()) {
        Some("must be alphanumeric")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(TopologyError::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

/// Checks one device path before it reaches an executor argv. Paths must not
/// be blank, must not start with `-` and must not contain whitespace or
/// control characters.
pub fn validate_device_path(vdev: &str, device: &str) -> Result<(), TopologyError> {
    if device.trim().is_empty() {
        return Err(TopologyError::EmptyDevicePath {
            vdev: vdev.to_string(),
        });
    }
    if device.starts_with('-') || device.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(TopologyError::InvalidDevicePath {
            device: device.to_string(),
        });
    }
    Ok(())
}

/// Validates `spec` against the pool-construction invariants and the
/// devices already claimed in `inventory`.
///
/// `create_force` is not consulted here; it only relaxes
/// executor-level checks.
pub fn validate(spec: &Zpool, inventory: &Inventory) -> Result<(), TopologyError> {
    if inventory.contains_key(&spec.name) {
        return Err(TopologyError::DuplicateName {
            name: spec.name.clone(),
        });
    }
    validate_pool_name(&spec.name)?;

    if spec.vdevs.is_empty() {
        return Err(TopologyError::EmptyVdevList);
    }

    let mut members: HashSet<&str> = HashSet::new();
    for (idx, vdev) in spec.vdevs.iter().enumerate() {
        let label = if vdev.name.is_empty() {
            format!("#{}", idx)
        } else {
            vdev.name.clone()
        };
        if vdev.devices.is_empty() {
            return Err(TopologyError::EmptyVdev { vdev: label });
        }
        for device in &vdev.devices {
            validate_device_path(&label, device)?;
            if !members.insert(device.as_str()) {
                return Err(TopologyError::DuplicateDevice {
                    device: device.clone(),
                });
            }
        }
        let required = spec.raid_type.min_devices();
        if vdev.devices.len() < required {
            return Err(TopologyError::UndersizedVdev {
                vdev: label,
                raid_type: spec.raid_type,
                required,
                actual: vdev.devices.len(),
            });
        }
    }

    let mut spares: HashSet<&str> = HashSet::new();
    for spare in &spec.spares {
        validate_device_path("spares", spare)?;
        if members.contains(spare.as_str()) {
            return Err(TopologyError::SpareOverlap {
                device: spare.clone(),
            });
        }
        if !spares.insert(spare.as_str()) {
            return Err(TopologyError::DuplicateDevice {
                device: spare.clone(),
            });
        }
    }

    validate_devices_unused(members.iter().chain(spares.iter()).copied(), inventory)?;

    for key in spec.properties.keys() {
        if key.trim().is_empty() || key.contains('=') || key.chars().any(char::is_whitespace) {
            return Err(TopologyError::InvalidProperty { key: key.clone() });
        }
    }

    Ok(())
}

/// Rejects the first device already claimed by any pool in `inventory`.
pub fn validate_devices_unused<'a>(
    devices: impl IntoIterator<Item = &'a str>,
    inventory: &Inventory,
) -> Result<(), TopologyError> {
    let mut sorted: Vec<&str> = devices.into_iter().collect();
    sorted.sort_unstable();
    for device in sorted {
        if let Some(pool) = device_owner(inventory, device) {
            return Err(TopologyError::DeviceInUse {
                device: device.to_string(),
                pool: pool.to_string(),
            });
        }
    }
    Ok(())
}
