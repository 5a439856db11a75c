//! Device inventory probing

use serde::Serialize;
use sysinfo::System;

use crate::error::DeviceError;

use super::{DeviceId, DeviceKind};

/// Environment variable listing accelerators visible to the runtime.
///
/// Format: `cuda:0=24576,npu:1=32768` (memory in MiB).
pub const DEVICES_ENV: &str = "GENREC_DEVICES";

const MIB: u64 = 1024 * 1024;

/// A device as reported by a probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    /// Total memory in bytes
    pub total_memory: u64,
    /// Memory currently free for this runtime, in bytes
    pub free_memory: u64,
}

impl DeviceInfo {
    pub fn new(id: DeviceId, total_memory: u64) -> Self {
        Self {
            id,
            total_memory,
            free_memory: total_memory,
        }
    }

    pub fn with_free_memory(mut self, free: u64) -> Self {
        self.free_memory = free.min(self.total_memory);
        self
    }
}

/// Source of the device inventory
pub trait DeviceProbe: Send + Sync {
    fn probe(&self) -> Vec<DeviceInfo>;
}

/// Fixed inventory, used for tests and for explicit deployments
#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    devices: Vec<DeviceInfo>,
}

impl StaticProbe {
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        Self { devices }
    }

    /// A CPU device plus `count` accelerators of `kind`, all with `memory` bytes.
    pub fn uniform(kind: DeviceKind, count: u32, memory: u64) -> Self {
        let mut devices = vec![DeviceInfo::new(DeviceId::cpu(), memory)];
        devices.extend((0..count).map(|i| DeviceInfo::new(DeviceId::new(kind, i), memory)));
        Self { devices }
    }
}

impl DeviceProbe for StaticProbe {
    fn probe(&self) -> Vec<DeviceInfo> {
        self.devices.clone()
    }
}

/// Host CPU (via `sysinfo`) plus accelerators declared in [`DEVICES_ENV`]
#[derive(Debug, Clone, Default)]
pub struct SystemProbe;

impl DeviceProbe for SystemProbe {
    fn probe(&self) -> Vec<DeviceInfo> {
        let mut sys = System::new();
        sys.refresh_memory();

        let mut devices = vec![DeviceInfo::new(DeviceId::cpu(), sys.total_memory())
            .with_free_memory(sys.available_memory())];

        if let Ok(declared) = std::env::var(DEVICES_ENV) {
            match parse_inventory(&declared) {
                Ok(accelerators) => devices.extend(accelerators),
                Err(e) => tracing::warn!("Ignoring {}: {}", DEVICES_ENV, e),
            }
        }

        devices
    }
}

/// Parse an inventory declaration such as `cuda:0=24576,npu:1=32768`.
pub fn parse_inventory(s: &str) -> Result<Vec<DeviceInfo>, DeviceError> {
    let invalid = |reason: String| DeviceError::InvalidSpec {
        spec: s.to_string(),
        reason,
    };

    let mut devices: Vec<DeviceInfo> = Vec::new();
    for token in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let (device, mib) = token
            .split_once('=')
            .ok_or_else(|| invalid(format!("'{}' is missing '=<MiB>'", token)))?;
        let (kind, index) = device
            .split_once(':')
            .ok_or_else(|| invalid(format!("'{}' is missing ':<index>'", device)))?;

        let kind: DeviceKind = kind.trim().parse().map_err(invalid)?;
        let index: u32 = index
            .trim()
            .parse()
            .map_err(|_| invalid(format!("'{}' is not a device index", index)))?;
        let mib: u64 = mib
            .trim()
            .parse()
            .map_err(|_| invalid(format!("'{}' is not a memory size", mib)))?;

        let id = DeviceId::new(kind, index);
        if devices.iter().any(|d| d.id == id) {
            return Err(invalid(format!("device {} declared twice", id)));
        }
        devices.push(DeviceInfo::new(id, mib * MIB));
    }
    Ok(devices)
}
