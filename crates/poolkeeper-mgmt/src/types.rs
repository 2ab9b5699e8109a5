//! Pool, vdev and device-replacement data model shared by the validator,
//! the pool manager and the executors.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum length of a pool name.
pub const MAX_POOL_NAME_LEN: usize = 24;

/// Maximum length of either device path in a replace request.
pub const MAX_REPLACE_PATH_LEN: usize = 24;

/// Redundancy scheme applied to every vdev of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaidType {
    /// Plain striping, no redundancy. Accepts `""` on the wire.
    #[default]
    #[serde(alias = "")]
    Stripe,
    Mirror,
    Raidz,
    Raidz2,
    Raidz3,
}

impl RaidType {
    /// Minimum member devices each vdev must contain under this scheme.
    pub fn min_devices(self) -> usize {
        match self {
            RaidType::Stripe => 1,
            RaidType::Mirror => 2,
            RaidType::Raidz => 2,
            RaidType::Raidz2 => 3,
            RaidType::Raidz3 => 4,
        }
    }

    /// Keyword used on the `zpool create` command line, if any.
    pub fn zpool_keyword(self) -> Option<&'static str> {
        match self {
            RaidType::Stripe => None,
            RaidType::Mirror => Some("mirror"),
            RaidType::Raidz => Some("raidz"),
            RaidType::Raidz2 => Some("raidz2"),
            RaidType::Raidz3 => Some("raidz3"),
        }
    }

    /// Classifies a vdev name reported by `zpool status` (`mirror-0`, `raidz2-1`).
    pub fn from_vdev_label(label: &str) -> Option<Self> {
        let kind = label.split('-').next().unwrap_or(label);
        match kind {
            "mirror" => Some(RaidType::Mirror),
            "raidz" | "raidz1" => Some(RaidType::Raidz),
            "raidz2" => Some(RaidType::Raidz2),
            "raidz3" => Some(RaidType::Raidz3),
            _ => None,
        }
    }
}

impl fmt::Display for RaidType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RaidType::Stripe => "stripe",
            RaidType::Mirror => "mirror",
            RaidType::Raidz => "raidz",
            RaidType::Raidz2 => "raidz2",
            RaidType::Raidz3 => "raidz3",
        };
        f.write_str(s)
    }
}

/// One redundancy unit: a named group of device paths.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Vdev {
    #[serde(default)]
    pub name: String,
    pub devices: Vec<String>,
}

impl Vdev {
    pub fn new(name: &str, devices: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            devices: devices.iter().map(|d| d.to_string()).collect(),
        }
    }
}

/// A pool creation request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Zpool {
    pub name: String,
    #[serde(default)]
    pub raid_type: RaidType,
    #[serde(default)]
    pub vdevs: Vec<Vdev>,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    #[serde(default)]
    pub create_force: bool,
    #[serde(default)]
    pub spares: Vec<String>,
}

/// Health as reported by the executor for a whole pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolHealth {
    Online,
    Degraded,
    Faulted,
    Offline,
    Unavail,
    Removed,
    #[default]
    Unknown,
}

impl PoolHealth {
    pub fn parse(state: &str) -> Self {
        match state.to_ascii_uppercase().as_str() {
            "ONLINE" => PoolHealth::Online,
            "DEGRADED" => PoolHealth::Degraded,
            "FAULTED" => PoolHealth::Faulted,
            "OFFLINE" => PoolHealth::Offline,
            "UNAVAIL" => PoolHealth::Unavail,
            "REMOVED" => PoolHealth::Removed,
            _ => PoolHealth::Unknown,
        }
    }
}

/// Inventory entry for an existing pool, as last reported by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolRecord {
    pub name: String,
    pub raid_type: RaidType,
    pub vdevs: Vec<Vdev>,
    pub spares: Vec<String>,
    pub properties: HashMap<String, String>,
    pub health: PoolHealth,
}

impl PoolRecord {
    /// Builds the record a successful create is expected to produce.
    pub fn from_spec(spec: &Zpool) -> Self {
        Self {
            name: spec.name.clone(),
            raid_type: spec.raid_type,
            vdevs: spec.vdevs.clone(),
            spares: spec.spares.clone(),
            properties: spec.properties.clone(),
            health: PoolHealth::Online,
        }
    }

    /// Every device path owned by the pool: vdev members and spares.
    pub fn devices(&self) -> impl Iterator<Item = &str> {
        self.vdevs
            .iter()
            .flat_map(|v| v.devices.iter())
            .chain(self.spares.iter())
            .map(String::as_str)
    }

    /// True when `device` is a vdev member (spares excluded).
    pub fn has_member(&self, device: &str) -> bool {
        self.vdevs
            .iter()
            .any(|v| v.devices.iter().any(|d| d == device))
    }

    pub fn vdev(&self, name: &str) -> Option<&Vdev> {
        self.vdevs.iter().find(|v| v.name == name)
    }
}

/// The pool inventory, keyed and ordered by pool name.
pub type Inventory = BTreeMap<String, PoolRecord>;

/// Returns the pool that currently owns `device`, if any.
pub fn device_owner<'a>(inventory: &'a Inventory, device: &str) -> Option<&'a str> {
    inventory
        .values()
        .find(|p| p.devices().any(|d| d == device))
        .map(|p| p.name.as_str())
}

/// An (old, new) device pair for replace-in-place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaceDevice {
    pub old: String,
    pub new: String,
}

/// A single utilization sample for one pool.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatPoint {
    pub time: i64,
    pub allocated: u64,
    pub free: u64,
    pub size: u64,
    pub dedup_ratio: f64,
}
