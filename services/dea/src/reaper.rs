//! Cleanup of stopped, crashed and deleted instances.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dea_messages::InstanceState;
use tracing::{debug, info, warn};

use crate::instance::{Instance, InstanceRegistry};
use crate::launcher::{remove_directory, InstanceLauncher};
use crate::resources::ResourceMonitor;

/// Counts from one reap pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapSummary {
    pub sandboxes_released: usize,
    pub directories_removed: usize,
    pub removed: usize,
    pub skipped: usize,
}

pub struct Reaper {
    registry: Arc<InstanceRegistry>,
    resources: Arc<ResourceMonitor>,
    launcher: Arc<dyn InstanceLauncher>,
    crash_lifetime: Duration,
}

impl Reaper {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        resources: Arc<ResourceMonitor>,
        launcher: Arc<dyn InstanceLauncher>,
        crash_lifetime: Duration,
    ) -> Self {
        Self {
            registry,
            resources,
            launcher,
            crash_lifetime,
        }
    }

    /// One pass. Records are only removed from the registry after every
    /// record lock taken by the pass has been released.
    pub async fn run_cycle(&self) -> ReapSummary {
        let now = Utc::now();
        let mut summary = ReapSummary::default();
        let mut removable = Vec::new();

        let instances = self.registry.snapshot_instances().await;
        self.stop_lingering_processes(&instances).await;

        for instance in instances {
            let Some(mut record) = instance.try_write() else {
                summary.skipped += 1;
                continue;
            };
            if record.orphaned
                || record.launching
                || !matches!(
                    record.state,
                    InstanceState::Stopped | InstanceState::Crashed | InstanceState::Deleted
                )
            {
                continue;
            }
            let aged = record.is_aged_crash(now, self.crash_lifetime);

            self.resources.untrack(&mut record);

            if record.has_live_handle() || record.principal.is_some() {
                match self.launcher.release_sandbox(&mut record).await {
                    Ok(()) => summary.sandboxes_released += 1,
                    Err(e) => {
                        warn!(
                            instance_id = %record.instance_id,
                            reason = e.reason_code(),
                            error = %e,
                            "Failed to release sandbox, will retry"
                        );
                        continue;
                    }
                }
            }

            // Fresh crashes keep their directory so logs can be fetched.
            let reclaim = aged || record.state != InstanceState::Crashed;
            if reclaim && !record.directory_released {
                match remove_directory(&record.directory).await {
                    Ok(_) => {
                        record.directory_released = true;
                        summary.directories_removed += 1;
                        debug!(instance_id = %record.instance_id, "Removed instance directory");
                    }
                    Err(e) => {
                        warn!(
                            instance_id = %record.instance_id,
                            path = %record.directory.display(),
                            error = %e,
                            "Failed to remove instance directory, will retry"
                        );
                        continue;
                    }
                }
            }

            if record.directory_released && !record.exit_notice_pending() {
                removable.push(record.instance_id.clone());
            }
        }

        for instance_id in removable {
            if self.registry.remove(&instance_id).await.is_some() {
                summary.removed += 1;
                info!(instance_id = %instance_id, "Reaped instance");
            }
        }
        summary
    }

    /// Gracefully stop Stopped instances whose process is still up.
    ///
    /// The stop can take the whole grace period, so it runs on a copy of the
    /// record with no lock held.
    async fn stop_lingering_processes(&self, instances: &[Arc<Instance>]) {
        let mut lingering = Vec::new();
        for instance in instances {
            let Some(record) = instance.try_read() else {
                continue;
            };
            if !record.orphaned
                && !record.launching
                && record.state == InstanceState::Stopped
                && record.has_live_handle()
            {
                lingering.push(record.clone());
            }
        }

        for record in lingering {
            if let Err(e) = self.launcher.stop_process(&record).await {
                warn!(instance_id = %record.instance_id, error = %e, "Failed to stop instance process");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::test_record;
    use crate::launcher::{FakeLauncher, LaunchHandles};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        apps: std::path::PathBuf,
        reaper: Reaper,
        registry: Arc<InstanceRegistry>,
        resources: Arc<ResourceMonitor>,
        launcher: Arc<FakeLauncher>,
    }

    fn fixture(crash_lifetime: Duration) -> Fixture {
        let dir = TempDir::new().unwrap();
        let apps = dir.path().join("apps");
        let registry = Arc::new(InstanceRegistry::new());
        let resources = Arc::new(ResourceMonitor::new(4096, 16));
        let launcher = Arc::new(FakeLauncher::new(&["ruby"]));
        let reaper = Reaper::new(registry.clone(), resources.clone(), launcher.clone(), crash_lifetime);
        Fixture {
            _dir: dir,
            apps,
            reaper,
            registry,
            resources,
            launcher,
        }
    }

    async fn instance_in(f: &Fixture, droplet_id: u64, state: InstanceState) -> Arc<Instance> {
        let mut record = test_record(droplet_id, 0);
        record.directory = f.apps.join(format!("app-{droplet_id}"));
        std::fs::create_dir_all(record.directory.join("logs")).unwrap();
        let mut handles = LaunchHandles::default();
        f.launcher.launch(&record, &mut handles).await.unwrap();
        handles.apply_to(&mut record);
        f.resources.try_track(&mut record).unwrap();
        record.transition(InstanceState::Running);
        if state == InstanceState::Deleted {
            record.transition(InstanceState::Crashed);
        }
        record.transition(state);
        f.registry.add(record).await.unwrap()
    }

    #[tokio::test]
    async fn test_stopped_instance_is_fully_reaped() {
        let f = fixture(Duration::from_secs(3600));
        let instance = instance_in(&f, 1, InstanceState::Stopped).await;
        let directory = instance.read().await.directory.clone();

        let summary = f.reaper.run_cycle().await;
        assert_eq!(summary.sandboxes_released, 1);
        assert_eq!(summary.directories_removed, 1);
        assert_eq!(summary.removed, 1);
        assert!(!directory.exists());
        assert!(f.registry.is_empty().await);
        assert_eq!(f.resources.stats().instance_count, 0);
        assert!(!f.launcher.is_running(instance.instance_id()));
        assert_eq!(f.launcher.stops(), 1);
    }

    #[tokio::test]
    async fn test_instance_still_launching_is_left_alone() {
        let f = fixture(Duration::ZERO);
        let instance = instance_in(&f, 1, InstanceState::Stopped).await;
        instance.write().await.launching = true;

        let summary = f.reaper.run_cycle().await;
        assert_eq!(summary, ReapSummary::default());
        assert_eq!(f.launcher.stops(), 0);
        let record = instance.read().await;
        assert!(record.has_live_handle());
        assert!(record.directory.exists());
        drop(record);

        instance.write().await.launching = false;
        assert_eq!(f.reaper.run_cycle().await.removed, 1);
        assert_eq!(f.launcher.releases(), 1);
    }

    #[tokio::test]
    async fn test_pending_exit_notice_defers_removal() {
        let f = fixture(Duration::ZERO);
        let instance = instance_in(&f, 1, InstanceState::Stopped).await;
        {
            let mut record = instance.write().await;
            record.stop_processed = true;
            record.exit_reason = Some(dea_messages::ExitReason::Stopped);
        }

        let summary = f.reaper.run_cycle().await;
        assert_eq!(summary.directories_removed, 1);
        assert_eq!(summary.removed, 0);

        instance.write().await.notified_exited = true;
        assert_eq!(f.reaper.run_cycle().await.removed, 1);
    }

    #[tokio::test]
    async fn test_fresh_crash_keeps_directory() {
        let f = fixture(Duration::from_secs(3600));
        let instance = instance_in(&f, 1, InstanceState::Crashed).await;

        let summary = f.reaper.run_cycle().await;
        assert_eq!(summary.sandboxes_released, 1);
        assert_eq!(summary.removed, 0);
        let record = instance.read().await;
        assert!(record.directory.exists());
        assert!(!record.has_live_handle());
        assert_eq!(f.resources.stats().reserved_memory_mb, 0);
    }

    #[tokio::test]
    async fn test_aged_crash_is_removed() {
        let f = fixture(Duration::ZERO);
        instance_in(&f, 1, InstanceState::Crashed).await;

        let summary = f.reaper.run_cycle().await;
        assert_eq!(summary.removed, 1);
        assert!(f.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_missing_directory_is_not_fatal() {
        let f = fixture(Duration::from_secs(3600));
        let instance = instance_in(&f, 1, InstanceState::Deleted).await;
        std::fs::remove_dir_all(&instance.read().await.directory).unwrap();

        assert_eq!(f.reaper.run_cycle().await.removed, 1);
    }

    #[tokio::test]
    async fn test_live_and_busy_instances_untouched() {
        let f = fixture(Duration::ZERO);
        let running = instance_in(&f, 1, InstanceState::Running).await;
        let stopped = instance_in(&f, 2, InstanceState::Stopped).await;
        let guard = stopped.write().await;

        let summary = f.reaper.run_cycle().await;
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.removed, 0);
        assert!(f.launcher.is_running(running.instance_id()));
        drop(guard);

        assert_eq!(f.reaper.run_cycle().await.removed, 1);
        assert_eq!(f.registry.len().await, 1);
    }
}
