//! Hardware targets.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    Cpu,
    Gpu,
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::Cpu => write!(f, "cpu"),
            Arch::Gpu => write!(f, "gpu"),
        }
    }
}

/// Description of the device a task is tuned for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub arch: Arch,
    pub device: String,
    /// CPU cores or GPU streaming multiprocessors.
    pub compute_units: usize,
    /// Widest legal vectorized loop.
    pub max_vector_width: usize,
    /// Largest product of unrolled loop extents.
    pub max_unroll: usize,
    /// Threads per block; ignored on CPU.
    pub max_threads_per_block: usize,
}

impl Target {
    pub fn host() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::cpu(cores)
    }

    pub fn cpu(compute_units: usize) -> Self {
        Self {
            arch: Arch::Cpu,
            device: "host".into(),
            compute_units: compute_units.max(1),
            max_vector_width: 16,
            max_unroll: 64,
            max_threads_per_block: 1,
        }
    }

    pub fn gpu(compute_units: usize) -> Self {
        Self {
            arch: Arch::Gpu,
            device: "simulated-gpu".into(),
            compute_units: compute_units.max(1),
            max_vector_width: 4,
            max_unroll: 16,
            max_threads_per_block: 1024,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}x{}", self.arch, self.device, self.compute_units)
    }
}
