//! Instance records and the registry that owns them.

mod record;
mod registry;

use dea_messages::DropletId;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use record::{can_transition, InstanceRecord, UsageHistory, UsageSample};
pub use registry::{InstanceRegistry, RegistryError};

/// A registered instance: immutable identity plus its lock-protected record.
#[derive(Debug)]
pub struct Instance {
    instance_id: String,
    droplet_id: DropletId,
    index: u32,
    record: RwLock<InstanceRecord>,
}

impl Instance {
    pub fn new(record: InstanceRecord) -> Self {
        Self {
            instance_id: record.instance_id.clone(),
            droplet_id: record.droplet_id,
            index: record.index,
            record: RwLock::new(record),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn droplet_id(&self) -> DropletId {
        self.droplet_id
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, InstanceRecord> {
        self.record.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, InstanceRecord> {
        self.record.write().await
    }

    /// Non-blocking read, for periodic scans.
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, InstanceRecord>> {
        self.record.try_read().ok()
    }

    /// Non-blocking write, for periodic scans.
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, InstanceRecord>> {
        self.record.try_write().ok()
    }
}

#[cfg(test)]
pub(crate) fn test_record(droplet_id: DropletId, index: u32) -> InstanceRecord {
    let request: dea_messages::StartRequest = serde_json::from_value(serde_json::json!({
        "droplet": droplet_id,
        "version": "v1",
        "name": format!("app-{droplet_id}"),
        "uris": [format!("app-{droplet_id}.example.com")],
        "index": index,
        "runtime": "ruby",
        "framework": "sinatra",
        "sha1": "da39a3ee5e6b4b0d3255bfef95601890afd80709",
        "executableUri": "http://cc/droplets/1",
        "executableFile": "/shared/droplets/1",
        "limits": {"mem": 256, "disk": 1024, "fds": 256}
    }))
    .unwrap();
    let instance_id = uuid::Uuid::new_v4().simple().to_string();
    let directory = std::path::PathBuf::from(format!("/tmp/apps/app-{droplet_id}-{index}-{instance_id}"));
    InstanceRecord::from_start(&request, instance_id, directory, "127.0.0.1".to_string(), 8)
}
