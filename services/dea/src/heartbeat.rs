//! Periodic `dea.heartbeat` publishing.
//!
//! The health manager compares each heartbeat against the desired instance
//! count per droplet. Instances stuck in Starting or left Crashed show up
//! here until they are reaped; Stopped and Deleted ones do not.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::agent::Agent;
use crate::bus::BusError;

/// Failures tolerated at warn level before logging at error level.
const QUIET_FAILURES: u32 = 3;

/// Publish heartbeats every `interval` until `shutdown` flips.
///
/// The first heartbeat goes out immediately so the health manager learns
/// about recovered instances without waiting a full period.
pub async fn run_heartbeat_loop(agent: Arc<Agent>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    info!(
        agent_id = %agent.config().agent_id,
        interval_secs = interval.as_secs(),
        "Heartbeat loop started"
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures = 0u32;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                failures = record_outcome(agent.heartbeat().await, failures);
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Heartbeat loop stopped");
                    return;
                }
            }
        }
    }
}

/// Log one heartbeat attempt and return the updated failure streak.
fn record_outcome(result: Result<usize, BusError>, failures: u32) -> u32 {
    match result {
        Ok(reported) => {
            if failures > 0 {
                info!(after_failures = failures, "Heartbeat recovered");
            }
            debug!(instances = reported, "Heartbeat published");
            0
        }
        Err(e) => {
            let failures = failures + 1;
            if failures <= QUIET_FAILURES {
                warn!(error = %e, failures, "Heartbeat publish failed");
            } else {
                error!(error = %e, failures, "Heartbeat publish keeps failing");
            }
            failures
        }
    }
}
