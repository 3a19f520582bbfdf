//! Read-only queries. None of these mutate instance state.

use std::sync::Arc;
use std::time::Duration;

use dea_messages::{
    decode, AgentStatus, DiscoverRequest, DropletStatusResponse, FindDropletRequest, InstanceState,
};
use tracing::debug;

use super::Agent;
use crate::bus::BusError;

impl Agent {
    fn file_uri(&self) -> String {
        format!(
            "http://{}:{}/instances/",
            self.config.local_route, self.config.file_viewer_port
        )
    }

    /// `dea.status`: identity plus capacity counters.
    pub async fn handle_status(self: &Arc<Self>, reply_to: Option<&str>) -> Result<(), BusError> {
        let status = self.monitor.status();
        // Before the first monitor cycle the ledger itself is the freshest source.
        let counters = if status.updated_at.is_some() {
            status.resources
        } else {
            self.resources.stats()
        };
        let reply = AgentStatus {
            hello: self.hello(),
            max_memory: counters.max_memory_mb,
            reserved_memory: counters.reserved_memory_mb,
            used_memory: counters.used_memory_kb,
            num_clients: counters.instance_count,
        };
        self.reply(reply_to, &reply).await
    }

    /// `dea.find.droplet`: one reply per matching instance.
    pub async fn handle_find(self: &Arc<Self>, payload: &[u8], reply_to: Option<&str>) -> Result<(), BusError> {
        let request: FindDropletRequest = decode(payload)?;
        let selector = &request.selector;
        let file_uri = self.file_uri();

        for instance in self.registry.find_by_droplet(selector.droplet_id).await {
            let response = {
                let record = instance.read().await;
                if !selector.matches(
                    record.droplet_id,
                    &record.version,
                    &record.instance_id,
                    record.index,
                    record.state,
                ) {
                    continue;
                }
                let stats = (request.include_stats && record.state == InstanceState::Running)
                    .then(|| record.stats(self.cores));
                record.to_find_response(&self.config.agent_id, file_uri.clone(), stats)
            };
            self.reply(reply_to, &response).await?;
        }
        Ok(())
    }

    /// `droplet.status`: one reply per running instance.
    pub async fn handle_droplet_status(self: &Arc<Self>, reply_to: Option<&str>) -> Result<(), BusError> {
        for instance in self.registry.snapshot_instances().await {
            let response = {
                let record = instance.read().await;
                if record.state != InstanceState::Running {
                    continue;
                }
                DropletStatusResponse {
                    name: record.name.clone(),
                    host: record.host.clone(),
                    port: record.port,
                    uris: record.uris.clone(),
                    uptime: record.uptime_secs(),
                    mem_quota: record.mem_quota_bytes,
                    disk_quota: record.disk_quota_bytes,
                    fds_quota: record.fds_quota,
                    usage: record.usage_report(),
                }
            };
            self.reply(reply_to, &response).await?;
        }
        Ok(())
    }

    /// `dea.discover`: answer after a load-dependent delay, or not at all.
    pub async fn handle_discover(self: &Arc<Self>, payload: &[u8], reply_to: Option<&str>) -> Result<(), BusError> {
        let request: DiscoverRequest = decode(payload)?;
        if self.is_shutting_down() || self.is_evacuating() {
            return Ok(());
        }
        if !self.config.supports_runtime(&request.runtime) || !self.launcher.supports_runtime(&request.runtime) {
            debug!(droplet_id = request.droplet_id, runtime = %request.runtime, "Discover for unsupported runtime");
            return Ok(());
        }
        if let Err(e) = self.resources.can_admit(request.limits.memory_mb) {
            debug!(droplet_id = request.droplet_id, error = %e, "Discover declined");
            return Ok(());
        }

        let existing = self.registry.droplet_instance_count(request.droplet_id).await;
        let taint = self.resources.taint_ms(existing);
        debug!(droplet_id = request.droplet_id, taint_ms = taint, "Answering discover");
        tokio::time::sleep(Duration::from_millis(taint)).await;
        self.reply(reply_to, &self.hello()).await
    }
}
