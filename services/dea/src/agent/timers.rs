//! Periodic work: heartbeat, monitor, process reconciliation, reaping and
//! snapshot writes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dea_messages::{topics, ExitReason, Heartbeat, InstanceState};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::Agent;
use crate::bus::BusError;
use crate::heartbeat::run_heartbeat_loop;
use crate::monitor::CrashCandidate;
use crate::reaper::ReapSummary;

/// Run `tick` every `period` until shutdown.
///
/// Each tick runs as its own task; a panicking tick is logged and the timer
/// carries on.
fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        debug!(timer = name, period_ms = period.as_millis() as u64, "Timer started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = tokio::spawn(tick()).await {
                        error!(timer = name, error = %e, "Timer tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!(timer = name, "Timer stopped");
                        break;
                    }
                }
            }
        }
    })
}

impl Agent {
    /// Publish one heartbeat covering every non-stopped instance.
    ///
    /// Returns how many instances it reported.
    pub async fn heartbeat(&self) -> Result<usize, BusError> {
        let mut droplets = Vec::new();
        let mut busy = Vec::new();
        self.registry
            .for_each_locked(|instance| match instance.try_read() {
                Some(record) => {
                    if !matches!(record.state, InstanceState::Stopped | InstanceState::Deleted) {
                        droplets.push(record.to_heartbeat());
                    }
                }
                None => busy.push(Arc::clone(instance)),
            })
            .await;
        for instance in busy {
            let record = instance.read().await;
            if !matches!(record.state, InstanceState::Stopped | InstanceState::Deleted) {
                droplets.push(record.to_heartbeat());
            }
        }

        let reported = droplets.len();
        let heartbeat = Heartbeat {
            droplets,
            dea: self.config.agent_id.clone(),
            prod: self.config.prod,
        };
        self.publish(topics::DEA_HEARTBEAT, &heartbeat).await?;
        Ok(reported)
    }

    /// `healthmanager.start`: heartbeat right away.
    pub async fn handle_healthmanager_start(self: &Arc<Self>) -> Result<(), BusError> {
        self.heartbeat().await.map(|_| ())
    }

    async fn crash_all(self: &Arc<Self>, candidates: Vec<CrashCandidate>) -> usize {
        let mut crashed = 0;
        for candidate in candidates {
            debug!(
                instance_id = %candidate.instance.instance_id(),
                violation = ?candidate.violation,
                "Crashing instance"
            );
            if self.stop_instance(&candidate.instance, ExitReason::Crashed).await {
                crashed += 1;
            }
        }
        crashed
    }

    /// One monitor pass; returns how many instances were crashed.
    pub async fn run_monitor_cycle(self: &Arc<Self>) -> usize {
        let candidates = self.monitor.run_cycle().await;
        self.crash_all(candidates).await
    }

    /// One process reconciliation pass; returns how many instances were crashed.
    pub async fn run_process_check(self: &Arc<Self>) -> usize {
        let candidates = self.monitor.reconcile_processes().await;
        self.crash_all(candidates).await
    }

    pub async fn run_reap_cycle(&self) -> ReapSummary {
        self.resend_exit_notices().await;
        let summary = self.reaper.run_cycle().await;
        if summary.removed > 0 || summary.sandboxes_released > 0 {
            debug!(?summary, "Reap cycle finished");
        }
        summary
    }

    /// Publish exited notifications that failed during the stop protocol.
    ///
    /// The reaper keeps such records registered until this succeeds.
    pub async fn resend_exit_notices(&self) -> usize {
        let mut sent = 0;
        for instance in self.registry.snapshot_instances().await {
            let Some(mut record) = instance.try_write() else {
                continue;
            };
            if !record.exit_notice_pending() {
                continue;
            }
            let exited = record.to_exited();
            match self.publish(topics::DROPLET_EXITED, &exited).await {
                Ok(()) => {
                    record.notified_exited = true;
                    sent += 1;
                    info!(instance_id = %record.instance_id, "Published delayed exited notification");
                }
                Err(e) => {
                    warn!(instance_id = %record.instance_id, error = %e, "Exited notification still failing");
                    break;
                }
            }
        }
        if sent > 0 {
            self.snapshots.schedule();
        }
        sent
    }

    /// Start every periodic task. They stop when shutdown completes.
    pub fn run_timers(self: &Arc<Self>) {
        let shutdown = self.shutdown_tx.subscribe();
        info!(
            heartbeat_ms = self.config.heartbeat_interval.as_millis() as u64,
            monitor_ms = self.config.monitor_interval.as_millis() as u64,
            reap_ms = self.config.reap_interval.as_millis() as u64,
            "Starting timers"
        );

        self.track_task(tokio::spawn(run_heartbeat_loop(
            Arc::clone(self),
            self.config.heartbeat_interval,
            shutdown.clone(),
        )));

        let agent = Arc::clone(self);
        self.track_task(spawn_periodic(
            "monitor",
            self.config.monitor_interval,
            shutdown.clone(),
            move || {
                let agent = Arc::clone(&agent);
                async move {
                    agent.run_monitor_cycle().await;
                }
            },
        ));

        let agent = Arc::clone(self);
        self.track_task(spawn_periodic(
            "process_check",
            self.config.process_check_interval,
            shutdown.clone(),
            move || {
                let agent = Arc::clone(&agent);
                async move {
                    agent.run_process_check().await;
                }
            },
        ));

        let agent = Arc::clone(self);
        self.track_task(spawn_periodic(
            "reaper",
            self.config.reap_interval,
            shutdown.clone(),
            move || {
                let agent = Arc::clone(&agent);
                async move {
                    agent.run_reap_cycle().await;
                }
            },
        ));

        let snapshots = Arc::clone(&self.snapshots);
        self.track_task(tokio::spawn(async move { snapshots.run(shutdown).await }));
    }
}
