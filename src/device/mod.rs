//! Device Pool
//!
//! This module owns the compute devices bound to a session:
//! - [`DeviceSelection`]: parsed device-selection string (`auto`, `npu:0,1`)
//! - [`DeviceProbe`]: where the inventory comes from
//! - [`DevicePool`]: the resolved devices, each with a memory arena and a
//!   serialized execution queue

mod memory;
mod probe;
mod spec;

pub use memory::{Allocation, MemoryArena};
pub use probe::{parse_inventory, DeviceInfo, DeviceProbe, StaticProbe, SystemProbe, DEVICES_ENV};
pub use spec::DeviceSelection;

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::DeviceError;

/// Kind of compute device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Cuda,
    Npu,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Cuda => "cuda",
            DeviceKind::Npu => "npu",
        }
    }

    pub fn is_accelerator(&self) -> bool {
        !matches!(self, DeviceKind::Cpu)
    }
}

impl FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(DeviceKind::Cpu),
            "cuda" => Ok(DeviceKind::Cuda),
            "npu" => Ok(DeviceKind::Npu),
            other => Err(format!("unknown device kind '{}'", other)),
        }
    }
}

/// Device identity, displayed as `kind:index`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId {
    pub kind: DeviceKind,
    pub index: u32,
}

impl DeviceId {
    pub fn new(kind: DeviceKind, index: u32) -> Self {
        Self { kind, index }
    }

    pub fn cpu() -> Self {
        Self::new(DeviceKind::Cpu, 0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.index)
    }
}

/// A device bound to a pool
#[derive(Debug)]
pub struct DeviceRef {
    info: DeviceInfo,
    arena: Arc<MemoryArena>,
    queue: Mutex<()>,
}

impl DeviceRef {
    fn new(info: DeviceInfo) -> Self {
        let arena = MemoryArena::new(info.id, info.free_memory);
        Self {
            info,
            arena,
            queue: Mutex::new(()),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.info.id
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn arena(&self) -> &Arc<MemoryArena> {
        &self.arena
    }

    /// Run `f` on this device's execution queue.
    ///
    /// Work on one device is serialized; different devices run in parallel.
    /// Blocks the calling thread, so async callers go through `spawn_blocking`.
    pub fn execute<T>(&self, f: impl FnOnce() -> T) -> T {
        let _slot = self
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f()
    }
}

/// Devices assigned to one session
#[derive(Debug)]
pub struct DevicePool {
    devices: Vec<Arc<DeviceRef>>,
}

impl DevicePool {
    /// Resolve a device-selection string against a probe.
    pub fn from_spec(spec: &str, probe: &dyn DeviceProbe) -> Result<Self, DeviceError> {
        let selection = DeviceSelection::parse(spec)?;
        Self::resolve(&selection, probe)
    }

    /// Resolve a parsed selection against the probed inventory.
    pub fn resolve(
        selection: &DeviceSelection,
        probe: &dyn DeviceProbe,
    ) -> Result<Self, DeviceError> {
        let inventory = probe.probe();

        let chosen: Vec<DeviceInfo> = match selection {
            DeviceSelection::Auto => {
                let best = inventory
                    .iter()
                    .filter(|d| d.id.kind.is_accelerator() && d.free_memory > 0)
                    .max_by(|a, b| {
                        a.free_memory
                            .cmp(&b.free_memory)
                            // Prefer the lower index on ties
                            .then_with(|| b.id.cmp(&a.id))
                    })
                    .or_else(|| inventory.iter().find(|d| d.id.kind == DeviceKind::Cpu))
                    .cloned()
                    .ok_or(DeviceError::UnknownDevice(DeviceId::cpu()))?;
                tracing::info!("Auto-selected device {}", best.id);
                vec![best]
            }
            DeviceSelection::Explicit(ids) => ids
                .iter()
                .map(|id| {
                    let info = inventory
                        .iter()
                        .find(|d| d.id == *id)
                        .ok_or(DeviceError::UnknownDevice(*id))?;
                    if info.free_memory == 0 {
                        return Err(DeviceError::Exhausted(*id));
                    }
                    Ok(info.clone())
                })
                .collect::<Result<_, _>>()?,
        };

        for info in &chosen {
            tracing::debug!(
                "Binding device {} ({:.2} GiB free)",
                info.id,
                info.free_memory as f64 / (1024.0 * 1024.0 * 1024.0)
            );
        }

        Ok(Self {
            devices: chosen
                .into_iter()
                .map(|info| Arc::new(DeviceRef::new(info)))
                .collect(),
        })
    }

    pub fn devices(&self) -> &[Arc<DeviceRef>] {
        &self.devices
    }

    pub fn get(&self, index: usize) -> Option<&Arc<DeviceRef>> {
        self.devices.get(index)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn ids(&self) -> Vec<DeviceId> {
        self.devices.iter().map(|d| d.id()).collect()
    }
}
