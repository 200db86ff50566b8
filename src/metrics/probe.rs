//! Host resource sampling for metric samples.

use std::sync::Mutex;

use sysinfo::System;

/// CPU and memory utilization at the moment of sampling, in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub mem_percent: f64,
}

/// Source of [`ResourceUsage`] readings.
pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> ResourceUsage;
}

/// Reads whole-host utilization through `sysinfo`.
///
/// CPU usage is computed between consecutive refreshes, so the first reading
/// after construction reflects the interval since `new()`.
pub struct SystemProbe {
    system: Mutex<System>,
}

impl SystemProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SystemProbe {
    fn sample(&self) -> ResourceUsage {
        let Ok(mut system) = self.system.lock() else {
            return ResourceUsage::default();
        };
        system.refresh_cpu();
        system.refresh_memory();
        let total = system.total_memory();
        let mem_percent = if total == 0 {
            0.0
        } else {
            system.used_memory() as f64 / total as f64 * 100.0
        };
        ResourceUsage {
            cpu_percent: f64::from(system.global_cpu_info().cpu_usage()),
            mem_percent,
        }
    }
}

impl std::fmt::Debug for SystemProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemProbe").finish()
    }
}

/// Always reports the same reading. Useful where host load must not leak
/// into alert decisions.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedProbe(pub ResourceUsage);

impl ResourceProbe for FixedProbe {
    fn sample(&self) -> ResourceUsage {
        self.0
    }
}
