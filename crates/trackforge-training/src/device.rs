//! Explicit device selection.
//!
//! Devices are parsed from the run config and handed to the distributed
//! runtime and model assembly directly; the process environment is never
//! used to hide accelerators.

use crate::distributed::DistributedContext;
use crate::error::TrainingError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "index", rename_all = "snake_case")]
pub enum Device {
    Cpu,
    Cuda(u32),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Cuda(index) => write!(f, "cuda:{index}"),
        }
    }
}

/// Ordered list of accelerators visible to this process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceList {
    ids: Vec<u32>,
}

impl DeviceList {
    #[must_use]
    pub fn cpu_only() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    #[must_use]
    pub fn is_cpu_only(&self) -> bool {
        self.ids.is_empty()
    }

    /// Number of local devices, used to scale the per-device batch size.
    #[must_use]
    pub fn local_count(&self) -> usize {
        self.ids.len().max(1)
    }

    #[must_use]
    pub fn devices(&self) -> Vec<Device> {
        if self.ids.is_empty() {
            vec![Device::Cpu]
        } else {
            self.ids.iter().copied().map(Device::Cuda).collect()
        }
    }

    /// Device that drives this process.
    #[must_use]
    pub fn primary_for(&self, ctx: &DistributedContext) -> Device {
        if self.ids.is_empty() {
            return Device::Cpu;
        }
        let slot = if ctx.is_distributed() { ctx.rank as usize % self.ids.len() } else { 0 };
        Device::Cuda(self.ids[slot])
    }
}

impl FromStr for DeviceList {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut ids = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let id: u32 = part
                .parse()
                .map_err(|_| TrainingError::InvalidConfig(format!("invalid device id: {part:?}")))?;
            if ids.contains(&id) {
                return Err(TrainingError::InvalidConfig(format!("duplicate device id: {id}")));
            }
            ids.push(id);
        }
        Ok(Self { ids })
    }
}
