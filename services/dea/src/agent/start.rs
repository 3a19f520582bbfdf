//! Start handling: admission, background launch and readiness.

use std::sync::Arc;

use dea_messages::{decode, topics, ExitReason, Heartbeat, InstanceState, StartRequest};
use tracing::{debug, info, warn};

use super::Agent;
use crate::bus::BusError;
use crate::health::Readiness;
use crate::instance::{Instance, InstanceRecord, RegistryError};
use crate::launcher::LaunchHandles;

impl Agent {
    /// Admit a start request and launch it in the background.
    ///
    /// Rejections are logged and otherwise silent.
    pub async fn handle_start(self: &Arc<Self>, payload: &[u8]) -> Result<(), BusError> {
        let request: StartRequest = decode(payload)?;
        let droplet_id = request.droplet_id;
        let index = request.index;

        if self.is_shutting_down() || self.is_evacuating() {
            info!(droplet_id, index, "Ignoring start while shutting down");
            return Ok(());
        }
        if let Err(e) = request.validate() {
            warn!(droplet_id, index, error = %e, "Rejecting malformed start request");
            return Ok(());
        }
        if !self.config.supports_runtime(&request.runtime) || !self.launcher.supports_runtime(&request.runtime) {
            warn!(droplet_id, index, runtime = %request.runtime, "Rejecting unsupported runtime");
            return Ok(());
        }

        let instance_id = uuid::Uuid::new_v4().simple().to_string();
        let directory = self
            .config
            .apps_dir()
            .join(format!("{}-{}-{}", request.name, index, instance_id));
        let mut record = InstanceRecord::from_start(
            &request,
            instance_id,
            directory,
            self.config.local_route.clone(),
            self.config.usage_history_len,
        );
        record.launching = true;

        let resources = self.resources.clone();
        let instance = match self
            .registry
            .add_with(record, |record| resources.try_track(record).map_err(RegistryError::from))
            .await
        {
            Ok(instance) => instance,
            Err(e) => {
                warn!(droplet_id, index, error = %e, "Rejecting start request");
                return Ok(());
            }
        };

        info!(
            instance_id = %instance.instance_id(),
            droplet_id,
            index,
            memory_mb = request.limits.memory_mb,
            "Admitted instance"
        );

        let agent = Arc::clone(self);
        tokio::spawn(async move { agent.launch_instance(instance).await });
        Ok(())
    }

    /// Launch outside every lock, then wait for readiness.
    ///
    /// A stop that lands while the launch runs has already moved the record
    /// on; whatever the launch built is torn down here instead.
    async fn launch_instance(self: Arc<Self>, instance: Arc<Instance>) {
        let record = instance.read().await.clone();
        let mut handles = LaunchHandles::default();
        let result = self.launcher.launch(&record, &mut handles).await;

        let mut record = instance.write().await;
        handles.apply_to(&mut record);
        record.launching = false;
        let state = record.state;
        drop(record);
        self.snapshots.schedule();

        if let Err(e) = result {
            warn!(
                instance_id = %instance.instance_id(),
                reason = e.reason_code(),
                error = %e,
                "Launch failed"
            );
            if !self.stop_instance(&instance, ExitReason::Crashed).await {
                self.finish_stop(&instance).await;
            }
            return;
        }
        if state != InstanceState::Starting {
            debug!(instance_id = %instance.instance_id(), state = %state, "Instance stopped during launch");
            self.finish_stop(&instance).await;
            return;
        }
        self.await_readiness(instance).await;
    }

    /// Poll until the instance accepts connections, then mark it Running.
    pub(super) async fn await_readiness(self: Arc<Self>, instance: Arc<Instance>) {
        match self.health.wait_until_ready(&instance).await {
            Readiness::Ready => {
                let mut record = instance.write().await;
                if record.state != InstanceState::Starting || record.stop_processed {
                    return;
                }
                record.transition(InstanceState::Running);
                info!(
                    instance_id = %record.instance_id,
                    droplet_id = record.droplet_id,
                    port = record.port,
                    "Instance is running"
                );

                let heartbeat = Heartbeat {
                    droplets: vec![record.to_heartbeat()],
                    dea: self.config.agent_id.clone(),
                    prod: self.config.prod,
                };
                if let Err(e) = self.publish(topics::DEA_HEARTBEAT, &heartbeat).await {
                    warn!(instance_id = %record.instance_id, error = %e, "Failed to publish heartbeat");
                }
                let uris = record.uris.clone();
                if let Err(e) = self.register_routes(&record, uris).await {
                    warn!(instance_id = %record.instance_id, error = %e, "Failed to register routes");
                }
                drop(record);
                self.snapshots.schedule();
            }
            Readiness::TimedOut => {
                warn!(instance_id = %instance.instance_id(), "Instance never became ready");
                self.stop_instance(&instance, ExitReason::Crashed).await;
            }
            Readiness::Abandoned => {
                debug!(instance_id = %instance.instance_id(), "Readiness polling abandoned");
            }
        }
    }
}
