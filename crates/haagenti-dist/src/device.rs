//! Device identifiers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Environment variable listing the accelerators visible to this process
pub const VISIBLE_DEVICES_ENV: &str = "CUDA_VISIBLE_DEVICES";

/// Device a computation model places its buffers on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    /// Host CPU
    Cpu,
    /// Local GPU by index
    Cuda(usize),
    /// Pod-local virtual device by index
    Pod(usize),
}

impl Device {
    /// Is this an accelerator device
    pub fn is_accelerator(&self) -> bool {
        !matches!(self, Device::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(i) => write!(f, "cuda:{}", i),
            Device::Pod(i) => write!(f, "xla:{}", i),
        }
    }
}

/// Number of accelerators visible to this process.
///
/// Read from `CUDA_VISIBLE_DEVICES`; unset, empty or `-1` means none.
pub fn visible_accelerators() -> usize {
    std::env::var(VISIBLE_DEVICES_ENV)
        .map(|v| parse_visible_devices(&v))
        .unwrap_or(0)
}

fn parse_visible_devices(value: &str) -> usize {
    let value = value.trim();
    if value.is_empty() || value == "-1" {
        return 0;
    }
    value.split(',').filter(|s| !s.trim().is_empty()).count()
}
