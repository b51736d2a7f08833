//! Host resource reader backed by `sysinfo`.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sysinfo::{Disks, Pid, System};

use super::{ProcessUsage, ResourceReader, ResourceUsage};
use crate::error::{SourceError, SourceResult};

/// Reads CPU, memory and disk utilization of the host.
///
/// CPU usage is a delta between two refreshes, so the `System` handle is kept
/// across polls; the first reading after startup may report zero.
#[derive(Debug, Clone)]
pub struct SysinfoReader {
    system: Arc<Mutex<System>>,
    pid: Option<Pid>,
}

impl SysinfoReader {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();

        Self {
            system: Arc::new(Mutex::new(system)),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    fn read_blocking(system: &Mutex<System>) -> SourceResult<ResourceUsage> {
        let mut system = system.lock();
        system.refresh_cpu();
        system.refresh_memory();

        let cpu_percent = system.global_cpu_info().cpu_usage() as f64;

        let total_memory = system.total_memory();
        if total_memory == 0 {
            return Err(SourceError::invalid_response("os.memory", "total memory reported as zero"));
        }
        let memory_percent = system.used_memory() as f64 / total_memory as f64 * 100.0;

        let disks = Disks::new_with_refreshed_list();
        let (total, available) = disks
            .list()
            .iter()
            .filter(|d| d.total_space() > 0)
            .fold((0u64, 0u64), |(total, available), d| {
                (total + d.total_space(), available + d.available_space())
            });
        let disk_percent = if total == 0 {
            0.0
        } else {
            total.saturating_sub(available) as f64 / total as f64 * 100.0
        };

        Ok(ResourceUsage {
            cpu_percent,
            memory_percent,
            disk_percent,
        })
    }
}

impl Default for SysinfoReader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceReader for SysinfoReader {
    async fn read_resource_usage(&self) -> SourceResult<ResourceUsage> {
        let system = Arc::clone(&self.system);
        tokio::task::spawn_blocking(move || Self::read_blocking(&system))
            .await
            .map_err(|e| SourceError::unavailable("os.resources", format!("reader task failed: {}", e)))?
    }

    async fn read_process_usage(&self) -> SourceResult<ProcessUsage> {
        let Some(pid) = self.pid else {
            return Err(SourceError::unavailable("os.process", "current pid unknown"));
        };
        let system = Arc::clone(&self.system);

        tokio::task::spawn_blocking(move || {
            let mut system = system.lock();
            system.refresh_process(pid);
            system
                .process(pid)
                .map(|process| ProcessUsage {
                    pid: pid.as_u32(),
                    cpu_percent: process.cpu_usage() as f64,
                    memory_bytes: process.memory(),
                })
                .ok_or_else(|| SourceError::unavailable("os.process", "process not found"))
        })
        .await
        .map_err(|e| SourceError::unavailable("os.process", format!("reader task failed: {}", e)))?
    }
}
