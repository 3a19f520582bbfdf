//! Usage sampling, liveness and quota enforcement for running instances.
//!
//! A cycle reads targets under short try-locks, does every slow check (port
//! connects, `/proc` and disk scans) with no lock held, then applies results
//! under a try-write of each record. Instances that must crash are returned
//! to the caller, which runs the stop protocol on them.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use dea_messages::InstanceState;
use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::health::HealthPoller;
use crate::instance::{Instance, InstanceRecord, InstanceRegistry, UsageSample};
use crate::launcher::{read_proc_stats, InstanceLauncher};
use crate::resources::{ResourceCounters, ResourceMonitor};

/// CPU percentage above which a sample counts as busy.
const CPU_RENICE_THRESHOLD: f64 = 80.0;
/// Consecutive busy samples before a renice step.
const CPU_RENICE_WINDOW: usize = 3;
/// Niceness added per step.
const RENICE_INCREMENT: i32 = 4;
const MAX_RENICE_STEPS: u8 = 3;

/// What the probe needs to know about one instance.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub instance_id: String,
    pub process_group: Option<u32>,
    pub directory: PathBuf,
}

/// Raw counters for one instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawUsage {
    /// Cumulative user+system ticks of the process group.
    pub cpu_ticks: u64,
    pub memory_kb: u64,
    pub disk_bytes: u64,
}

/// Source of per-instance usage.
pub trait UsageProbe: Send + Sync {
    /// Sample every target in one pass, keyed by instance id.
    fn sample(&self, targets: &[ProbeTarget]) -> HashMap<String, RawUsage>;

    fn ticks_per_second(&self) -> u64;

    /// Set the niceness of every process in a group.
    fn renice(&self, process_group: u32, niceness: i32) -> io::Result<()>;
}

/// `/proc` and filesystem backed probe.
#[derive(Debug, Clone)]
pub struct ProcProbe {
    apps_dir: PathBuf,
}

impl ProcProbe {
    pub fn new(apps_dir: impl Into<PathBuf>) -> Self {
        Self {
            apps_dir: apps_dir.into(),
        }
    }
}

fn sysconf_or(name: libc::c_int, default: u64) -> u64 {
    let value = unsafe { libc::sysconf(name) };
    if value > 0 {
        value as u64
    } else {
        default
    }
}

/// Sum file sizes under `root`, attributed to each first-level directory.
pub fn disk_usage_by_directory(root: &Path) -> HashMap<PathBuf, u64> {
    let mut totals: HashMap<PathBuf, u64> = HashMap::new();
    for entry in walkdir::WalkDir::new(root)
        .min_depth(2)
        .into_iter()
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let Some(top) = relative.components().next() else {
            continue;
        };
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        *totals.entry(root.join(top)).or_default() += size;
    }
    totals
}

impl UsageProbe for ProcProbe {
    fn sample(&self, targets: &[ProbeTarget]) -> HashMap<String, RawUsage> {
        let page_kb = sysconf_or(libc::_SC_PAGESIZE, 4096) / 1024;
        let mut by_group: HashMap<u32, (u64, u64)> = HashMap::new();
        for stat in read_proc_stats() {
            let entry = by_group.entry(stat.pgrp).or_default();
            entry.0 += stat.utime + stat.stime;
            entry.1 += stat.rss_pages * page_kb;
        }
        let disk = disk_usage_by_directory(&self.apps_dir);

        targets
            .iter()
            .map(|target| {
                let (cpu_ticks, memory_kb) = target
                    .process_group
                    .and_then(|pgrp| by_group.get(&pgrp).copied())
                    .unwrap_or_default();
                let disk_bytes = disk.get(&target.directory).copied().unwrap_or(0);
                (
                    target.instance_id.clone(),
                    RawUsage {
                        cpu_ticks,
                        memory_kb,
                        disk_bytes,
                    },
                )
            })
            .collect()
    }

    fn ticks_per_second(&self) -> u64 {
        sysconf_or(libc::_SC_CLK_TCK, 100)
    }

    fn renice(&self, process_group: u32, niceness: i32) -> io::Result<()> {
        let rc = unsafe { libc::setpriority(libc::PRIO_PGRP, process_group as libc::id_t, niceness) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Why an instance must be crashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// The port stopped accepting connections.
    Unreachable,
    /// No process is left in the sandbox.
    ProcessGone,
    MemoryQuota { used_kb: u64, quota_kb: u64 },
    DiskQuota { used_bytes: u64, quota_bytes: u64 },
}

#[derive(Debug, Clone)]
pub struct CrashCandidate {
    pub instance: Arc<Instance>,
    pub violation: Violation,
}

/// Aggregate usage for one runtime or framework.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageTotals {
    pub instances: usize,
    pub reserved_memory_mb: u64,
    pub used_memory_kb: u64,
    pub cpu_percent: f64,
}

impl UsageTotals {
    fn add(&mut self, record: &InstanceRecord, sample: &UsageSample) {
        self.instances += 1;
        self.reserved_memory_mb += record.mem_quota_mb();
        self.used_memory_kb += sample.memory_kb;
        self.cpu_percent += sample.cpu_percent;
    }
}

/// Agent-wide status, replaced wholesale at the end of each monitor cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub updated_at: Option<DateTime<Utc>>,
    pub resources: ResourceCounters,
    pub running_instances: usize,
    /// Records skipped because a handler held their lock.
    pub skipped: usize,
    pub by_runtime: BTreeMap<String, UsageTotals>,
    pub by_framework: BTreeMap<String, UsageTotals>,
}

pub struct Monitor {
    registry: Arc<InstanceRegistry>,
    resources: Arc<ResourceMonitor>,
    launcher: Arc<dyn InstanceLauncher>,
    probe: Arc<dyn UsageProbe>,
    health: HealthPoller,
    enforce_quotas: bool,
    status: RwLock<StatusSnapshot>,
}

struct Target {
    instance: Arc<Instance>,
    probe: ProbeTarget,
    host: String,
    port: u16,
}

impl Monitor {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        resources: Arc<ResourceMonitor>,
        launcher: Arc<dyn InstanceLauncher>,
        probe: Arc<dyn UsageProbe>,
        health: HealthPoller,
        enforce_quotas: bool,
    ) -> Self {
        Self {
            registry,
            resources,
            launcher,
            probe,
            health,
            enforce_quotas,
            status: RwLock::new(StatusSnapshot::default()),
        }
    }

    /// Latest status snapshot.
    pub fn status(&self) -> StatusSnapshot {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// One monitor pass over every running instance.
    pub async fn run_cycle(&self) -> Vec<CrashCandidate> {
        let mut skipped = 0;
        let mut targets = Vec::new();
        for instance in self.registry.snapshot_instances().await {
            let Some(record) = instance.try_read() else {
                skipped += 1;
                continue;
            };
            if record.state != InstanceState::Running || record.stop_processed {
                continue;
            }
            let target = Target {
                probe: ProbeTarget {
                    instance_id: record.instance_id.clone(),
                    process_group: record.sandbox.as_ref().and_then(|s| s.process_group),
                    directory: record.directory.clone(),
                },
                host: record.host.clone(),
                port: record.port,
                instance: instance.clone(),
            };
            drop(record);
            targets.push(target);
        }

        let reachable = join_all(
            targets
                .iter()
                .map(|t| self.health.is_port_ready(&t.host, t.port)),
        )
        .await;

        let probe = self.probe.clone();
        let probe_targets: Vec<ProbeTarget> = targets.iter().map(|t| t.probe.clone()).collect();
        let samples = match tokio::task::spawn_blocking(move || probe.sample(&probe_targets)).await {
            Ok(samples) => samples,
            Err(e) => {
                warn!(error = %e, "Usage probe failed");
                HashMap::new()
            }
        };
        let ticks_per_second = self.probe.ticks_per_second().max(1);

        let mut crashed = Vec::new();
        let mut status = StatusSnapshot::default();
        for (target, reachable) in targets.into_iter().zip(reachable) {
            let Some(mut record) = target.instance.try_write() else {
                skipped += 1;
                continue;
            };
            if record.state != InstanceState::Running || record.stop_processed {
                continue;
            }

            if !reachable {
                warn!(
                    instance_id = %record.instance_id,
                    droplet_id = record.droplet_id,
                    port = record.port,
                    "Instance port unreachable"
                );
                record.process_id = None;
                drop(record);
                crashed.push(CrashCandidate {
                    instance: target.instance,
                    violation: Violation::Unreachable,
                });
                continue;
            }

            let Some(raw) = samples.get(&target.probe.instance_id) else {
                continue;
            };
            let sample = UsageSample::at_now(
                cpu_percent(record.usage.last(), raw.cpu_ticks, Utc::now(), ticks_per_second),
                raw.memory_kb,
                raw.disk_bytes,
                raw.cpu_ticks,
            );
            self.resources.record_usage(&mut record, sample);
            status.running_instances += 1;
            status
                .by_runtime
                .entry(record.runtime.clone())
                .or_default()
                .add(&record, &sample);
            status
                .by_framework
                .entry(record.framework.clone())
                .or_default()
                .add(&record, &sample);

            if self.enforce_quotas {
                if let Some(violation) = self.enforce(&mut record, target.probe.process_group) {
                    warn!(
                        instance_id = %record.instance_id,
                        violation = ?violation,
                        "Instance exceeded its quota"
                    );
                    drop(record);
                    crashed.push(CrashCandidate {
                        instance: target.instance,
                        violation,
                    });
                }
            }
        }

        status.updated_at = Some(Utc::now());
        status.resources = self.resources.stats();
        status.skipped = skipped;
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = status;
        if skipped > 0 {
            debug!(skipped, "Monitor skipped busy instances");
        }
        crashed
    }

    /// Memory and disk overruns are fatal, sustained CPU only lowers priority.
    fn enforce(&self, record: &mut InstanceRecord, process_group: Option<u32>) -> Option<Violation> {
        let sample = *record.usage.last()?;

        let quota_kb = record.mem_quota_bytes / 1024;
        if quota_kb > 0 && sample.memory_kb > quota_kb {
            return Some(Violation::MemoryQuota {
                used_kb: sample.memory_kb,
                quota_kb,
            });
        }
        if record.disk_quota_bytes > 0 && sample.disk_bytes > record.disk_quota_bytes {
            return Some(Violation::DiskQuota {
                used_bytes: sample.disk_bytes,
                quota_bytes: record.disk_quota_bytes,
            });
        }

        let busy = record.usage.len() >= CPU_RENICE_WINDOW
            && record
                .usage
                .iter()
                .rev()
                .take(CPU_RENICE_WINDOW)
                .all(|s| s.cpu_percent > CPU_RENICE_THRESHOLD);
        if busy && record.renice_steps < MAX_RENICE_STEPS {
            if let Some(pgrp) = process_group {
                let niceness = RENICE_INCREMENT * i32::from(record.renice_steps + 1);
                match self.probe.renice(pgrp, niceness) {
                    Ok(()) => {
                        record.renice_steps += 1;
                        info!(instance_id = %record.instance_id, niceness, "Reniced busy instance");
                    }
                    Err(e) => warn!(instance_id = %record.instance_id, error = %e, "Renice failed"),
                }
            }
        }
        None
    }

    /// Fast pass: crash running instances whose sandbox has no process left.
    pub async fn reconcile_processes(&self) -> Vec<CrashCandidate> {
        let mut crashed = Vec::new();
        for instance in self.registry.snapshot_instances().await {
            let Some(mut record) = instance.try_write() else {
                continue;
            };
            if record.state != InstanceState::Running || record.stop_processed || record.sandbox.is_none() {
                continue;
            }
            if self.launcher.process_alive(&record) {
                continue;
            }
            warn!(
                instance_id = %record.instance_id,
                droplet_id = record.droplet_id,
                "Instance process is gone"
            );
            record.process_id = None;
            drop(record);
            crashed.push(CrashCandidate {
                instance,
                violation: Violation::ProcessGone,
            });
        }
        crashed
    }
}

/// CPU use since the previous sample, in percent of one core.
fn cpu_percent(previous: Option<&UsageSample>, cpu_ticks: u64, now: DateTime<Utc>, ticks_per_second: u64) -> f64 {
    let Some(previous) = previous else {
        return 0.0;
    };
    let elapsed = (now - previous.timestamp).num_milliseconds() as f64 / 1000.0;
    if elapsed <= 0.0 {
        return 0.0;
    }
    let busy = cpu_ticks.saturating_sub(previous.cpu_ticks) as f64 / ticks_per_second as f64;
    (busy / elapsed * 1000.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReadinessConfig;
    use crate::instance::test_record;
    use crate::launcher::{FakeLauncher, LaunchHandles};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeProbe {
        usage: Mutex<HashMap<String, RawUsage>>,
        reniced: Mutex<Vec<(u32, i32)>>,
    }

    impl FakeProbe {
        fn set(&self, instance_id: &str, usage: RawUsage) {
            self.usage.lock().unwrap().insert(instance_id.to_string(), usage);
        }
    }

    impl UsageProbe for FakeProbe {
        fn sample(&self, targets: &[ProbeTarget]) -> HashMap<String, RawUsage> {
            let usage = self.usage.lock().unwrap();
            targets
                .iter()
                .filter_map(|t| usage.get(&t.instance_id).map(|u| (t.instance_id.clone(), *u)))
                .collect()
        }

        fn ticks_per_second(&self) -> u64 {
            100
        }

        fn renice(&self, process_group: u32, niceness: i32) -> io::Result<()> {
            self.reniced.lock().unwrap().push((process_group, niceness));
            Ok(())
        }
    }

    struct Fixture {
        monitor: Monitor,
        registry: Arc<InstanceRegistry>,
        resources: Arc<ResourceMonitor>,
        launcher: Arc<FakeLauncher>,
        probe: Arc<FakeProbe>,
    }

    fn fixture(enforce: bool) -> Fixture {
        let registry = Arc::new(InstanceRegistry::new());
        let resources = Arc::new(ResourceMonitor::new(4096, 16));
        let launcher = Arc::new(FakeLauncher::new(&["ruby"]));
        let probe = Arc::new(FakeProbe::default());
        let health = HealthPoller::new(ReadinessConfig {
            attempts: 1,
            interval: Duration::from_millis(10),
            connect_timeout: Duration::from_millis(200),
        });
        let monitor = Monitor::new(
            registry.clone(),
            resources.clone(),
            launcher.clone(),
            probe.clone(),
            health,
            enforce,
        );
        Fixture {
            monitor,
            registry,
            resources,
            launcher,
            probe,
        }
    }

    async fn running(f: &Fixture, droplet_id: u64) -> Arc<Instance> {
        let mut record = test_record(droplet_id, 0);
        let mut handles = LaunchHandles::default();
        f.launcher.launch(&record, &mut handles).await.unwrap();
        handles.apply_to(&mut record);
        f.resources.try_track(&mut record).unwrap();
        record.transition(InstanceState::Running);
        f.registry.add(record).await.unwrap()
    }

    #[tokio::test]
    async fn test_cycle_records_usage_and_status() {
        let f = fixture(false);
        let instance = running(&f, 1).await;
        f.probe.set(
            instance.instance_id(),
            RawUsage {
                cpu_ticks: 50,
                memory_kb: 2048,
                disk_bytes: 4096,
            },
        );

        assert!(f.monitor.run_cycle().await.is_empty());
        let record = instance.read().await;
        assert_eq!(record.usage.len(), 1);
        assert_eq!(record.usage.last().unwrap().memory_kb, 2048);
        drop(record);

        let status = f.monitor.status();
        assert_eq!(status.running_instances, 1);
        assert_eq!(status.resources.used_memory_kb, 2048);
        assert_eq!(status.by_runtime["ruby"].instances, 1);
        assert_eq!(status.by_framework["sinatra"].reserved_memory_mb, 256);
    }

    #[tokio::test]
    async fn test_unreachable_port_is_a_crash_candidate() {
        let f = fixture(false);
        let instance = running(&f, 1).await;
        f.launcher.kill(instance.instance_id());

        let crashed = f.monitor.run_cycle().await;
        assert_eq!(crashed.len(), 1);
        assert_eq!(crashed[0].violation, Violation::Unreachable);
        assert!(instance.read().await.process_id.is_none());
    }

    #[tokio::test]
    async fn test_memory_quota_enforced_only_when_enabled() {
        for enforce in [false, true] {
            let f = fixture(enforce);
            let instance = running(&f, 1).await;
            f.probe.set(
                instance.instance_id(),
                RawUsage {
                    cpu_ticks: 0,
                    memory_kb: 512 * 1024,
                    disk_bytes: 0,
                },
            );
            let crashed = f.monitor.run_cycle().await;
            if enforce {
                assert!(matches!(crashed[0].violation, Violation::MemoryQuota { .. }));
            } else {
                assert!(crashed.is_empty());
            }
        }
    }

    #[tokio::test]
    async fn test_sustained_cpu_renices_with_bounded_steps() {
        let f = fixture(true);
        let instance = running(&f, 1).await;
        {
            let mut record = instance.write().await;
            let past = Utc::now() - chrono::Duration::seconds(10);
            for i in 0..CPU_RENICE_WINDOW {
                let mut sample = UsageSample::at_now(95.0, 1024, 0, i as u64);
                sample.timestamp = past;
                record.usage.push(sample);
            }
            record.renice_steps = MAX_RENICE_STEPS - 1;
        }
        // 10 seconds of wall clock, 10 seconds of ticks: 100% of a core.
        f.probe.set(
            instance.instance_id(),
            RawUsage {
                cpu_ticks: 1002,
                memory_kb: 1024,
                disk_bytes: 0,
            },
        );

        assert!(f.monitor.run_cycle().await.is_empty());
        assert_eq!(f.probe.reniced.lock().unwrap().len(), 1);
        assert_eq!(instance.read().await.renice_steps, MAX_RENICE_STEPS);

        assert!(f.monitor.run_cycle().await.is_empty());
        assert_eq!(f.probe.reniced.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_finds_dead_processes() {
        let f = fixture(false);
        let alive = running(&f, 1).await;
        let dead = running(&f, 2).await;
        f.launcher.kill(dead.instance_id());

        let crashed = f.monitor.reconcile_processes().await;
        assert_eq!(crashed.len(), 1);
        assert_eq!(crashed[0].instance.instance_id(), dead.instance_id());
        assert_eq!(crashed[0].violation, Violation::ProcessGone);
        assert!(alive.read().await.process_id.is_some());
    }

    #[tokio::test]
    async fn test_locked_records_are_skipped() {
        let f = fixture(false);
        let instance = running(&f, 1).await;
        f.launcher.kill(instance.instance_id());
        let _guard = instance.write().await;

        assert!(f.monitor.run_cycle().await.is_empty());
        assert!(f.monitor.reconcile_processes().await.is_empty());
        assert_eq!(f.monitor.status().skipped, 1);
    }

    #[test]
    fn test_cpu_percent_from_tick_delta() {
        let now = Utc::now();
        let mut previous = UsageSample::at_now(0.0, 0, 0, 100);
        previous.timestamp = now - chrono::Duration::seconds(2);
        assert_eq!(cpu_percent(Some(&previous), 200, now, 100), 50.0);
        assert_eq!(cpu_percent(None, 200, now, 100), 0.0);
        assert_eq!(cpu_percent(Some(&previous), 50, now, 100), 0.0);
    }

    #[test]
    fn test_disk_usage_attributed_to_instance_directories() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("a/logs")).unwrap();
        std::fs::create_dir_all(dir.path().join("b")).unwrap();
        std::fs::write(dir.path().join("a/app.rb"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("a/logs/stdout.log"), vec![0u8; 50]).unwrap();
        std::fs::write(dir.path().join("b/x"), vec![0u8; 7]).unwrap();
        std::fs::write(dir.path().join("stray"), vec![0u8; 1]).unwrap();

        let usage = disk_usage_by_directory(dir.path());
        assert_eq!(usage[&dir.path().join("a")], 150);
        assert_eq!(usage[&dir.path().join("b")], 7);
        assert_eq!(usage.len(), 2);
    }
}
