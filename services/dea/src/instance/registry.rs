//! Concurrent instance registry.
//!
//! Instances are grouped by droplet. The registry lock only guards the map;
//! each record has its own lock. A holder of the registry lock may take a
//! record lock for a short region, never the other way round.

use std::collections::BTreeMap;
use std::sync::Arc;

use dea_messages::DropletId;
use thiserror::Error;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info};

use super::{Instance, InstanceRecord};
use crate::resources::{CapacityError, ResourceMonitor};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("instance already registered: {0}")]
    Duplicate(String),

    #[error("admission rejected: {0}")]
    Capacity(#[from] CapacityError),

    #[error("admission rejected: {0}")]
    Rejected(String),
}

/// All instances known to this agent.
pub struct InstanceRegistry {
    droplets: RwLock<BTreeMap<DropletId, Vec<Arc<Instance>>>>,
    dirty: Arc<Notify>,
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self {
            droplets: RwLock::new(BTreeMap::new()),
            dirty: Arc::new(Notify::new()),
        }
    }

    /// Signal fired whenever the persisted view should be rewritten.
    pub fn dirty_signal(&self) -> Arc<Notify> {
        self.dirty.clone()
    }

    /// Request a snapshot write. Concurrent requests coalesce.
    pub fn mark_dirty(&self) {
        self.dirty.notify_one();
    }

    pub async fn add(&self, record: InstanceRecord) -> Result<Arc<Instance>, RegistryError> {
        self.add_with(record, |_| Ok(())).await
    }

    /// Insert `record` after running `admit` on it under the registry write lock.
    ///
    /// `admit` is where capacity is reserved, so two concurrent starts are
    /// serialized and cannot both pass the same check.
    pub async fn add_with<F>(
        &self,
        mut record: InstanceRecord,
        admit: F,
    ) -> Result<Arc<Instance>, RegistryError>
    where
        F: FnOnce(&mut InstanceRecord) -> Result<(), RegistryError>,
    {
        let mut droplets = self.droplets.write().await;
        let duplicate = droplets
            .values()
            .flatten()
            .any(|i| i.instance_id() == record.instance_id);
        if duplicate {
            return Err(RegistryError::Duplicate(record.instance_id));
        }

        admit(&mut record)?;

        let instance = Arc::new(Instance::new(record));
        droplets
            .entry(instance.droplet_id())
            .or_default()
            .push(instance.clone());
        drop(droplets);

        debug!(
            instance_id = %instance.instance_id(),
            droplet_id = instance.droplet_id(),
            index = instance.index(),
            "Registered instance"
        );
        self.mark_dirty();
        Ok(instance)
    }

    /// Remove an instance. Returns it if it was present.
    pub async fn remove(&self, instance_id: &str) -> Option<Arc<Instance>> {
        let mut droplets = self.droplets.write().await;
        let mut removed = None;
        let mut emptied = None;
        for (droplet_id, instances) in droplets.iter_mut() {
            if let Some(pos) = instances.iter().position(|i| i.instance_id() == instance_id) {
                removed = Some(instances.remove(pos));
                if instances.is_empty() {
                    emptied = Some(*droplet_id);
                }
                break;
            }
        }
        if let Some(droplet_id) = emptied {
            droplets.remove(&droplet_id);
        }
        drop(droplets);

        if removed.is_some() {
            debug!(instance_id = %instance_id, "Removed instance");
            self.mark_dirty();
        }
        removed
    }

    pub async fn get(&self, instance_id: &str) -> Option<Arc<Instance>> {
        let droplets = self.droplets.read().await;
        droplets
            .values()
            .flatten()
            .find(|i| i.instance_id() == instance_id)
            .cloned()
    }

    pub async fn find_by_droplet(&self, droplet_id: DropletId) -> Vec<Arc<Instance>> {
        let droplets = self.droplets.read().await;
        droplets.get(&droplet_id).cloned().unwrap_or_default()
    }

    pub async fn droplet_instance_count(&self, droplet_id: DropletId) -> usize {
        let droplets = self.droplets.read().await;
        droplets.get(&droplet_id).map(Vec::len).unwrap_or(0)
    }

    pub async fn len(&self) -> usize {
        let droplets = self.droplets.read().await;
        droplets.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Run `f` on every instance while holding the registry read lock.
    ///
    /// `f` must be short and must not wait on record locks; use
    /// [`Self::snapshot_instances`] for anything else.
    pub async fn for_each_locked<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Instance>),
    {
        let droplets = self.droplets.read().await;
        for instance in droplets.values().flatten() {
            f(instance);
        }
    }

    /// Copy every instance reference under a brief read lock.
    pub async fn snapshot_instances(&self) -> Vec<Arc<Instance>> {
        let droplets = self.droplets.read().await;
        droplets.values().flatten().cloned().collect()
    }

    /// Clone every record, for persistence.
    pub async fn to_snapshot(&self) -> Vec<InstanceRecord> {
        let instances = self.snapshot_instances().await;
        let mut records = Vec::with_capacity(instances.len());
        for instance in instances {
            records.push(instance.read().await.clone());
        }
        records
    }

    /// Repopulate from persisted records.
    ///
    /// Every record comes back orphaned, and those that held a reservation
    /// have it re-registered before they become visible to handlers.
    pub async fn recover(
        &self,
        records: Vec<InstanceRecord>,
        monitor: &ResourceMonitor,
    ) -> Vec<Arc<Instance>> {
        let mut droplets = self.droplets.write().await;
        let mut recovered = Vec::with_capacity(records.len());
        for mut record in records {
            let duplicate = droplets
                .values()
                .flatten()
                .any(|i| i.instance_id() == record.instance_id);
            if duplicate {
                continue;
            }

            record.orphaned = true;
            let held_reservation = record.resources_tracked;
            record.resources_tracked = false;
            if held_reservation {
                monitor.track(&mut record);
            }

            let instance = Arc::new(Instance::new(record));
            droplets
                .entry(instance.droplet_id())
                .or_default()
                .push(instance.clone());
            recovered.push(instance);
        }
        drop(droplets);

        info!(count = recovered.len(), "Recovered instances from snapshot");
        recovered
    }
}
