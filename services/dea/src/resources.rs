//! Capacity accounting and host measurement.
//!
//! [`ResourceMonitor`] is the process-wide ledger of reserved memory, used
//! memory and instance count. Every mutation takes `&mut InstanceRecord`, so a
//! caller can only reach it while holding that record's write lock; the
//! monitor's own mutex is always taken second and released first.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::instance::{InstanceRecord, UsageSample};

/// Admission failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CapacityError {
    #[error("insufficient memory: requested {requested_mb}MB, reserved {reserved_mb}MB of {max_mb}MB")]
    InsufficientMemory {
        requested_mb: u64,
        reserved_mb: u64,
        max_mb: u64,
    },

    #[error("instance limit reached: {count} of {max}")]
    TooManyInstances { count: usize, max: usize },
}

/// Point-in-time copy of the ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceCounters {
    pub reserved_memory_mb: u64,
    pub used_memory_kb: u64,
    pub instance_count: usize,
    pub max_memory_mb: u64,
    pub max_instances: usize,
}

/// Constants of the discover delay.
///
/// The delay grows with the number of instances of the same droplet already
/// here and with memory pressure, and never exceeds `max_ms`.
#[derive(Debug, Clone, Copy)]
pub struct TaintConfig {
    pub per_instance_ms: u64,
    pub memory_pressure_ms: u64,
    pub max_ms: u64,
}

impl Default for TaintConfig {
    fn default() -> Self {
        Self {
            per_instance_ms: 10,
            memory_pressure_ms: 100,
            max_ms: 250,
        }
    }
}

/// Thread-safe capacity ledger.
pub struct ResourceMonitor {
    counters: Mutex<ResourceCounters>,
    taint: TaintConfig,
}

impl ResourceMonitor {
    pub fn new(max_memory_mb: u64, max_instances: usize) -> Self {
        Self {
            counters: Mutex::new(ResourceCounters {
                max_memory_mb,
                max_instances,
                ..ResourceCounters::default()
            }),
            taint: TaintConfig::default(),
        }
    }

    pub fn with_taint(mut self, taint: TaintConfig) -> Self {
        self.taint = taint;
        self
    }

    fn lock(&self) -> MutexGuard<'_, ResourceCounters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current counters.
    pub fn stats(&self) -> ResourceCounters {
        *self.lock()
    }

    /// Check whether an instance of `memory_mb` would be admitted right now.
    pub fn can_admit(&self, memory_mb: u64) -> Result<(), CapacityError> {
        check(&self.lock(), memory_mb)
    }

    /// Reserve the record's quota if capacity allows.
    ///
    /// The check and the reservation happen under one acquisition of the
    /// ledger, so concurrent admissions can never overcommit.
    pub fn try_track(&self, record: &mut InstanceRecord) -> Result<(), CapacityError> {
        if record.resources_tracked {
            return Ok(());
        }
        let memory_mb = record.mem_quota_mb();
        let mut counters = self.lock();
        check(&counters, memory_mb)?;
        counters.reserved_memory_mb += memory_mb;
        counters.instance_count += 1;
        record.resources_tracked = true;
        debug!(
            instance_id = %record.instance_id,
            reserved_mb = counters.reserved_memory_mb,
            instance_count = counters.instance_count,
            "Reserved instance resources"
        );
        Ok(())
    }

    /// Reserve the record's quota unconditionally.
    ///
    /// Used when replaying a snapshot: those instances were admitted before
    /// the restart and must be accounted for even if capacity shrank.
    pub fn track(&self, record: &mut InstanceRecord) {
        if record.resources_tracked {
            return;
        }
        let memory_mb = record.mem_quota_mb();
        let used_kb = record.usage.last().map(|s| s.memory_kb).unwrap_or(0);
        let mut counters = self.lock();
        counters.reserved_memory_mb += memory_mb;
        counters.used_memory_kb += used_kb;
        counters.instance_count += 1;
        record.resources_tracked = true;
        if counters.reserved_memory_mb > counters.max_memory_mb {
            warn!(
                reserved_mb = counters.reserved_memory_mb,
                max_mb = counters.max_memory_mb,
                "Recovered instances exceed memory capacity"
            );
        }
    }

    /// Release the record's reservation. Idempotent.
    pub fn untrack(&self, record: &mut InstanceRecord) {
        if !record.resources_tracked {
            return;
        }
        let memory_mb = record.mem_quota_mb();
        let used_kb = record.usage.last().map(|s| s.memory_kb).unwrap_or(0);
        let mut counters = self.lock();
        counters.reserved_memory_mb = counters.reserved_memory_mb.saturating_sub(memory_mb);
        counters.used_memory_kb = counters.used_memory_kb.saturating_sub(used_kb);
        counters.instance_count = counters.instance_count.saturating_sub(1);
        record.resources_tracked = false;
        debug!(
            instance_id = %record.instance_id,
            reserved_mb = counters.reserved_memory_mb,
            instance_count = counters.instance_count,
            "Released instance resources"
        );
    }

    /// Append a usage sample and move the used-memory total by its delta.
    pub fn record_usage(&self, record: &mut InstanceRecord, sample: UsageSample) {
        let previous_kb = record.usage.last().map(|s| s.memory_kb).unwrap_or(0);
        record.usage.push(sample);
        if !record.resources_tracked {
            return;
        }
        let mut counters = self.lock();
        counters.used_memory_kb = counters
            .used_memory_kb
            .saturating_sub(previous_kb)
            .saturating_add(sample.memory_kb);
    }

    /// Reply delay for a discover probe, in milliseconds.
    pub fn taint_ms(&self, droplet_instances: usize) -> u64 {
        let counters = self.lock();
        let mut taint = droplet_instances as u64 * self.taint.per_instance_ms;
        if counters.max_memory_mb > 0 {
            let pressure = counters.reserved_memory_mb as f64 / counters.max_memory_mb as f64;
            taint += (pressure * self.taint.memory_pressure_ms as f64) as u64;
        }
        taint.min(self.taint.max_ms)
    }
}

fn check(counters: &ResourceCounters, memory_mb: u64) -> Result<(), CapacityError> {
    if counters.reserved_memory_mb + memory_mb > counters.max_memory_mb {
        return Err(CapacityError::InsufficientMemory {
            requested_mb: memory_mb,
            reserved_mb: counters.reserved_memory_mb,
            max_mb: counters.max_memory_mb,
        });
    }
    if counters.instance_count >= counters.max_instances {
        return Err(CapacityError::TooManyInstances {
            count: counters.instance_count,
            max: counters.max_instances,
        });
    }
    Ok(())
}

// =============================================================================
// Host measurement
// =============================================================================

/// What this host can offer to instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapacity {
    pub cores: u32,
    pub memory_mb: u64,
}

impl HostCapacity {
    pub fn measure() -> Self {
        Self {
            cores: get_cpu_count(),
            memory_mb: total_memory_bytes() / (1024 * 1024),
        }
    }
}

/// Online CPUs, used for the `cores` field of instance stats.
pub fn get_cpu_count() -> u32 {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions.
        let online = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if online > 0 {
            return online as u32;
        }
    }
    std::thread::available_parallelism().map_or(1, |n| n.get() as u32)
}

fn total_memory_bytes() -> u64 {
    let from_proc = std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|content| meminfo_total(&content));
    if let Some(total) = from_proc {
        return total;
    }

    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions.
        let (page, pages) = unsafe { (libc::sysconf(libc::_SC_PAGESIZE), libc::sysconf(libc::_SC_PHYS_PAGES)) };
        if page > 0 && pages > 0 {
            return page as u64 * pages as u64;
        }
    }
    DEFAULT_MEMORY_BYTES
}

/// Assumed when the host cannot be measured.
const DEFAULT_MEMORY_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// `MemTotal` from `/proc/meminfo`, in bytes.
fn meminfo_total(content: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let rest = line.strip_prefix("MemTotal:")?;
        let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
        Some(kb * 1024)
    })
}
