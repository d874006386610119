//! Host load probing for admission control.

use crate::error::EnvError;
use crate::types::SystemLoad;
use std::sync::Mutex;
use sysinfo::System;

/// Samples host CPU and memory usage.
///
/// # Implementations
///
/// - **Production**: `SysinfoProbe` - reads the host via `sysinfo`
/// - **Tests**: `StaticProbe` - returns whatever load the test dictates
pub trait AdmissionProbe: Send + Sync + 'static {
    /// Returns the current host load.
    fn system_load(&self) -> Result<SystemLoad, EnvError>;
}

/// Probe backed by `sysinfo`.
///
/// The `System` handle is kept between calls because CPU usage is computed
/// from the delta between two refreshes; the first sample reports 0% CPU.
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu_usage();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl AdmissionProbe for SysinfoProbe {
    fn system_load(&self) -> Result<SystemLoad, EnvError> {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_memory();
        system.refresh_cpu_usage();

        let total = system.total_memory();
        if total == 0 {
            return Err(EnvError::NoMemoryInfo);
        }
        let memory_percent = system.used_memory() as f64 / total as f64 * 100.0;

        Ok(SystemLoad::new(system.global_cpu_usage(), memory_percent as f32))
    }
}

/// Probe returning a fixed, adjustable load.
#[derive(Debug)]
pub struct StaticProbe {
    load: Mutex<SystemLoad>,
}

impl StaticProbe {
    pub fn new(load: SystemLoad) -> Self {
        Self {
            load: Mutex::new(load),
        }
    }

    /// A probe that always reports an idle host.
    pub fn idle() -> Self {
        Self::new(SystemLoad::idle())
    }

    /// Replaces the reported load.
    pub fn set(&self, load: SystemLoad) {
        *self.load.lock().unwrap_or_else(|e| e.into_inner()) = load;
    }
}

impl AdmissionProbe for StaticProbe {
    fn system_load(&self) -> Result<SystemLoad, EnvError> {
        Ok(*self.load.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_probe_reports_set_value() {
        let probe = StaticProbe::idle();
        assert_eq!(probe.system_load().unwrap(), SystemLoad::idle());

        probe.set(SystemLoad::new(12.0, 95.0));
        let load = probe.system_load().unwrap();
        assert_eq!(load.memory_percent, 95.0);
        assert_eq!(load.cpu_percent, 12.0);
    }

    #[test]
    fn test_system_load_clamps() {
        let load = SystemLoad::new(-5.0, 140.0);
        assert_eq!(load.cpu_percent, 0.0);
        assert_eq!(load.memory_percent, 100.0);
    }

    #[test]
    fn test_sysinfo_probe_in_range() {
        let probe = SysinfoProbe::new();
        if let Ok(load) = probe.system_load() {
            assert!((0.0..=100.0).contains(&load.memory_percent));
            assert!((0.0..=100.0).contains(&load.cpu_percent));
        }
    }
}
