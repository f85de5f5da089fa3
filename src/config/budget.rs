//! Per-device memory budget used to plan weight placement.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::utils::{format_bytes, parse_size};

/// Placement target for a module.
///
/// Ordering matters: accelerators are filled first (by index), then cpu, and
/// disk takes whatever is left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceId {
    Accelerator(usize),
    Cpu,
    Disk,
}

impl DeviceId {
    pub fn is_accelerator(&self) -> bool {
        matches!(self, DeviceId::Accelerator(_))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Accelerator(idx) => write!(f, "{}", idx),
            DeviceId::Cpu => write!(f, "cpu"),
            DeviceId::Disk => write!(f, "disk"),
        }
    }
}

impl FromStr for DeviceId {
    type Err = crate::FetchError;

    /// Accepts `0`, `cuda:0`, `metal:0`, `cpu` and `disk`.
    fn from_str(s: &str) -> crate::Result<Self> {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "cpu" => return Ok(DeviceId::Cpu),
            "disk" => return Ok(DeviceId::Disk),
            _ => {}
        }

        let index = s
            .strip_prefix("cuda:")
            .or_else(|| s.strip_prefix("metal:"))
            .unwrap_or(&s);

        index
            .parse::<usize>()
            .map(DeviceId::Accelerator)
            .map_err(|_| crate::FetchError::ConfigError(format!("Unknown device '{}'", s)))
    }
}

/// Maximum memory each device may hold, in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaxMemory {
    limits: BTreeMap<DeviceId, u64>,
}

impl Default for MaxMemory {
    /// Six GiB on the first accelerator and six GiB of host memory.
    fn default() -> Self {
        const SIX_GIB: u64 = 6 * 1024 * 1024 * 1024;

        let mut limits = BTreeMap::new();
        limits.insert(DeviceId::Accelerator(0), SIX_GIB);
        limits.insert(DeviceId::Cpu, SIX_GIB);
        Self { limits }
    }
}

impl MaxMemory {
    pub fn new() -> Self {
        Self {
            limits: BTreeMap::new(),
        }
    }

    pub fn with_limit(mut self, device: DeviceId, bytes: u64) -> Self {
        self.limits.insert(device, bytes);
        self
    }

    /// Build a table from `DEVICE=SIZE` entries such as `0=6GiB` or `cpu=12GB`.
    pub fn from_entries<S: AsRef<str>>(entries: &[S]) -> crate::Result<Self> {
        let mut table = Self::new();
        for entry in entries {
            let entry = entry.as_ref();
            let (device, size) = entry.split_once('=').ok_or_else(|| {
                crate::FetchError::ConfigError(format!(
                    "Memory limit '{}' must look like DEVICE=SIZE",
                    entry
                ))
            })?;
            table.limits.insert(device.parse()?, parse_size(size)?);
        }
        Ok(table)
    }

    pub fn limit(&self, device: DeviceId) -> Option<u64> {
        self.limits.get(&device).copied()
    }

    /// Devices in placement order.
    pub fn devices(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.limits.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }

    /// Drop accelerator entries whose index is not below `available`.
    pub fn retain_accelerators(&mut self, available: usize) -> Vec<DeviceId> {
        let missing: Vec<DeviceId> = self
            .limits
            .keys()
            .copied()
            .filter(|d| matches!(d, DeviceId::Accelerator(idx) if *idx >= available))
            .collect();

        for device in &missing {
            self.limits.remove(device);
        }
        missing
    }
}

impl fmt::Display for MaxMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .limits
            .iter()
            .map(|(device, bytes)| format!("{}: {}", device, format_bytes(*bytes)))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}
