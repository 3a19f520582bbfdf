//! Router registration and URI updates.

use std::collections::BTreeSet;
use std::sync::Arc;

use dea_messages::{decode, topics, InstanceState, UpdateRequest};
use tracing::{info, warn};

use super::Agent;
use crate::bus::BusError;
use crate::instance::InstanceRecord;

/// URIs to unregister and to register when moving from `current` to `requested`.
pub fn diff_uris(current: &[String], requested: &[String]) -> (Vec<String>, Vec<String>) {
    let current: BTreeSet<&String> = current.iter().collect();
    let requested: BTreeSet<&String> = requested.iter().collect();
    let removed = current.difference(&requested).map(|u| u.to_string()).collect();
    let added = requested.difference(&current).map(|u| u.to_string()).collect();
    (removed, added)
}

impl Agent {
    pub(super) async fn register_routes(&self, record: &InstanceRecord, uris: Vec<String>) -> Result<(), BusError> {
        if uris.is_empty() {
            return Ok(());
        }
        let registration = record.route_registration(&self.config.agent_id, uris);
        self.publish(topics::ROUTER_REGISTER, &registration).await
    }

    pub(super) async fn unregister_routes(&self, record: &InstanceRecord, uris: Vec<String>) -> Result<(), BusError> {
        if uris.is_empty() {
            return Ok(());
        }
        let registration = record.route_registration(&self.config.agent_id, uris);
        self.publish(topics::ROUTER_UNREGISTER, &registration).await
    }

    /// `dea.update`: remap the droplet's URIs.
    pub async fn handle_update(self: &Arc<Self>, payload: &[u8]) -> Result<(), BusError> {
        let request: UpdateRequest = decode(payload)?;
        let mut requested: Vec<String> = Vec::with_capacity(request.uris.len());
        for uri in request.uris {
            if !requested.contains(&uri) {
                requested.push(uri);
            }
        }

        for instance in self.registry.find_by_droplet(request.droplet_id).await {
            let mut record = instance.write().await;
            if record.stop_processed {
                continue;
            }
            if record.state == InstanceState::Running {
                let (removed, added) = diff_uris(&record.uris, &requested);
                if let Err(e) = self.unregister_routes(&record, removed).await {
                    warn!(instance_id = %record.instance_id, error = %e, "Failed to unregister routes");
                }
                if let Err(e) = self.register_routes(&record, added).await {
                    warn!(instance_id = %record.instance_id, error = %e, "Failed to register routes");
                }
            }
            record.uris = requested.clone();
            info!(instance_id = %record.instance_id, uris = ?record.uris, "Updated instance uris");
        }
        self.snapshots.schedule();
        Ok(())
    }

    /// `router.start`: re-register every running instance.
    pub async fn handle_router_start(self: &Arc<Self>) -> Result<(), BusError> {
        for instance in self.registry.snapshot_instances().await {
            let record = instance.read().await;
            if record.state != InstanceState::Running {
                continue;
            }
            self.register_routes(&record, record.uris.clone()).await?;
        }
        Ok(())
    }
}
