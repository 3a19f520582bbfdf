//! Stop protocol, evacuation and shutdown.

use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};

use dea_messages::{decode, topics, ExitReason, InstanceState, StopRequest};
use futures_util::future::join_all;
use tracing::{debug, error, info, warn};

use super::Agent;
use crate::bus::BusError;
use crate::instance::Instance;

impl Agent {
    /// Stop every instance matching the selector.
    ///
    /// Processed while shutting down as well.
    pub async fn handle_stop(self: &Arc<Self>, payload: &[u8]) -> Result<(), BusError> {
        let selector: StopRequest = decode(payload)?;
        let mut matched = 0;

        for instance in self.registry.find_by_droplet(selector.droplet_id).await {
            let selected = {
                let record = instance.read().await;
                selector.matches(
                    record.droplet_id,
                    &record.version,
                    &record.instance_id,
                    record.index,
                    record.state,
                )
            };
            if !selected {
                continue;
            }
            matched += 1;

            let mut record = instance.write().await;
            if record.state == InstanceState::Crashed {
                // Forces the reaper to reclaim the directory right away.
                record.transition(InstanceState::Deleted);
                info!(instance_id = %record.instance_id, "Marked crashed instance for deletion");
                drop(record);
                self.snapshots.schedule();
                continue;
            }
            drop(record);
            self.stop_instance(&instance, ExitReason::Stopped).await;
        }

        debug!(droplet_id = selector.droplet_id, matched, "Processed stop request");
        Ok(())
    }

    /// Run the stop protocol on one instance.
    ///
    /// Idempotent: the first call unregisters routes, sets the exit reason,
    /// publishes the single exited notification and moves the state; later
    /// calls return false without side effects. The caller must not hold
    /// the record's lock.
    pub async fn stop_instance(self: &Arc<Self>, instance: &Arc<Instance>, reason: ExitReason) -> bool {
        let mut record = instance.write().await;
        if record.stop_processed {
            return false;
        }

        let was_live = record.is_live();
        if record.state == InstanceState::Running {
            let uris = record.uris.clone();
            if let Err(e) = self.unregister_routes(&record, uris).await {
                warn!(instance_id = %record.instance_id, error = %e, "Failed to unregister routes");
            }
        }

        if was_live {
            if record.exit_reason.is_none() {
                record.exit_reason = Some(reason);
            }
            let target = match reason {
                ExitReason::Crashed => InstanceState::Crashed,
                _ => InstanceState::Stopped,
            };
            record.transition(target);

            if !record.notified_exited {
                let exited = record.to_exited();
                match self.publish(topics::DROPLET_EXITED, &exited).await {
                    Ok(()) => record.notified_exited = true,
                    Err(e) => warn!(instance_id = %record.instance_id, error = %e, "Failed to publish exited, will retry"),
                }
            }
        }
        record.stop_processed = true;

        info!(
            instance_id = %record.instance_id,
            droplet_id = record.droplet_id,
            state = %record.state,
            reason = %reason.as_str(),
            "Stopped instance"
        );
        drop(record);
        self.snapshots.schedule();

        let agent = Arc::clone(self);
        let instance = Arc::clone(instance);
        tokio::spawn(async move { agent.finish_stop(&instance).await });
        true
    }

    /// Stop the process outside the record lock, then release the reservation.
    pub(super) async fn finish_stop(&self, instance: &Arc<Instance>) {
        let record = instance.read().await.clone();
        if record.has_live_handle() {
            if let Err(e) = self.launcher.stop_process(&record).await {
                warn!(
                    instance_id = %record.instance_id,
                    reason = e.reason_code(),
                    error = %e,
                    "Failed to stop instance process"
                );
            }
        }

        let mut record = instance.write().await;
        self.resources.untrack(&mut record);
        drop(record);
        self.snapshots.schedule();
    }

    /// Announce that every instance is leaving so the platform can place
    /// replacements. Starts are refused from here on.
    pub async fn evacuate(self: &Arc<Self>) {
        if self.evacuating.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Evacuating instances");

        for instance in self.registry.snapshot_instances().await {
            let mut record = instance.write().await;
            record.evacuated = true;
            if !record.is_live() || record.notified_exited {
                continue;
            }
            record.exit_reason = Some(ExitReason::Evacuated);
            let exited = record.to_exited();
            match self.publish(topics::DROPLET_EXITED, &exited).await {
                Ok(()) => record.notified_exited = true,
                Err(e) => warn!(instance_id = %record.instance_id, error = %e, "Failed to publish evacuation"),
            }
        }
        self.snapshots.schedule();
    }

    /// Stop every live instance, write a final snapshot and halt the timers.
    pub async fn shutdown(self: &Arc<Self>) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down agent");

        let instances = self.registry.snapshot_instances().await;
        let mut stopping = Vec::new();
        for instance in instances {
            if !instance.read().await.is_live() {
                continue;
            }
            if self.stop_instance(&instance, ExitReason::AgentShutdown).await {
                stopping.push(instance);
            }
        }
        // Wait for the processes here rather than on the spawned tasks.
        join_all(stopping.iter().map(|instance| self.finish_stop(instance))).await;

        if let Err(e) = self.snapshots.flush_now().await {
            error!(error = %e, "Failed to write final snapshot");
        }

        self.shutdown_tx.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
        info!("Agent shut down");
    }
}
