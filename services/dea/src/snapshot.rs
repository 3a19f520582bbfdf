//! Instance snapshot persistence.
//!
//! The whole registry is serialized to one JSON file. Writes go to a temp file
//! that is synced and then renamed over the previous snapshot, so a crash at
//! any point leaves either the old or the new file in place.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::instance::{InstanceRecord, InstanceRegistry};

/// Snapshot file format version.
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot I/O failed on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("snapshot task failed: {0}")]
    Task(String),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> SnapshotError + '_ {
    move |source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// On-disk snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub agent_id: String,
    pub time: DateTime<Utc>,
    pub instances: Vec<InstanceRecord>,
}

impl Snapshot {
    pub fn new(agent_id: impl Into<String>, instances: Vec<InstanceRecord>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            agent_id: agent_id.into(),
            time: Utc::now(),
            instances,
        }
    }
}

/// Reads and atomically writes the snapshot file.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot.
    ///
    /// A missing file or a different format version yields `None`.
    pub fn load(&self) -> Result<Option<Snapshot>, SnapshotError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No snapshot, starting fresh");
                return Ok(None);
            }
            Err(e) => return Err(io_error(&self.path)(e)),
        };

        let snapshot: Snapshot = serde_json::from_str(&content)?;
        if snapshot.version != SNAPSHOT_VERSION {
            warn!(
                file_version = snapshot.version,
                current_version = SNAPSHOT_VERSION,
                "Snapshot version mismatch, ignoring it"
            );
            return Ok(None);
        }

        info!(
            path = %self.path.display(),
            instance_count = snapshot.instances.len(),
            "Loaded snapshot"
        );
        Ok(Some(snapshot))
    }

    /// Write the snapshot atomically.
    pub fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(snapshot)?;
        {
            let mut file = File::create(&tmp_path).map_err(io_error(&tmp_path))?;
            file.write_all(&content).map_err(io_error(&tmp_path))?;
            file.sync_all().map_err(io_error(&tmp_path))?;
        }
        fs::rename(&tmp_path, &self.path).map_err(io_error(&self.path))?;

        debug!(
            path = %self.path.display(),
            instance_count = snapshot.instances.len(),
            "Saved snapshot"
        );
        Ok(())
    }
}

/// Debounced snapshot writer driven by the registry's dirty signal.
pub struct SnapshotWriter {
    store: SnapshotStore,
    registry: Arc<InstanceRegistry>,
    agent_id: String,
    debounce: Duration,
    write_lock: Mutex<()>,
}

impl SnapshotWriter {
    pub fn new(
        store: SnapshotStore,
        registry: Arc<InstanceRegistry>,
        agent_id: impl Into<String>,
        debounce: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            agent_id: agent_id.into(),
            debounce,
            write_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Ask for a write on the next debounce window.
    pub fn schedule(&self) {
        self.registry.mark_dirty();
    }

    /// Write the current registry contents now.
    pub async fn flush_now(&self) -> Result<(), SnapshotError> {
        let _guard = self.write_lock.lock().await;
        let snapshot = Snapshot::new(self.agent_id.clone(), self.registry.to_snapshot().await);
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.save(&snapshot))
            .await
            .map_err(|e| SnapshotError::Task(e.to_string()))?
    }

    /// Coalesce dirty signals into debounced writes until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let dirty = self.registry.dirty_signal();
        info!(debounce_ms = self.debounce.as_millis() as u64, "Snapshot writer started");

        loop {
            tokio::select! {
                _ = dirty.notified() => {}
                _ = shutdown.changed() => {
                    info!("Snapshot writer shutting down");
                    return;
                }
            }

            // Requests arriving during the quiet period collapse into the
            // single stored permit and are served by this write.
            tokio::time::sleep(self.debounce).await;

            if let Err(e) = self.flush_now().await {
                error!(error = %e, "Failed to write snapshot");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::test_record;
    use crate::resources::ResourceMonitor;
    use dea_messages::InstanceState;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("db/applications.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_replaces_previous_file() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("db/applications.json"));

        store
            .save(&Snapshot::new("dea-1", vec![test_record(1, 0)]))
            .unwrap();
        store
            .save(&Snapshot::new("dea-1", vec![test_record(1, 0), test_record(1, 1)]))
            .unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.instances.len(), 2);
        assert!(!dir.path().join("db/applications.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_snapshot_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("applications.json");
        fs::write(&path, "{not json").unwrap();
        let err = SnapshotStore::new(&path).load().unwrap_err();
        assert!(matches!(err, SnapshotError::Parse(_)));
    }

    #[test]
    fn test_version_mismatch_is_ignored() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("applications.json"));
        let mut snapshot = Snapshot::new("dea-1", vec![]);
        snapshot.version = SNAPSHOT_VERSION + 1;
        store.save(&snapshot).unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_round_trip_preserves_identity_and_orphans() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(InstanceRegistry::new());
        let mut running = test_record(7, 2);
        running.transition(InstanceState::Running);
        running.resources_tracked = true;
        running.uris = vec!["b.example.com".into(), "a.example.com".into()];
        let original = running.clone();
        registry.add(running).await.unwrap();

        let writer = SnapshotWriter::new(
            SnapshotStore::new(dir.path().join("applications.json")),
            registry,
            "dea-1",
            Duration::from_millis(10),
        );
        writer.flush_now().await.unwrap();

        let snapshot = writer.store().load().unwrap().unwrap();
        let restored = Arc::new(InstanceRegistry::new());
        let monitor = ResourceMonitor::new(4096, 10);
        restored.recover(snapshot.instances, &monitor).await;

        let instance = restored.get(&original.instance_id).await.unwrap();
        let record = instance.read().await;
        assert_eq!(record.droplet_id, 7);
        assert_eq!(record.index, 2);
        assert_eq!(record.uris, original.uris);
        assert_eq!(record.mem_quota_bytes, original.mem_quota_bytes);
        assert_eq!(record.disk_quota_bytes, original.disk_quota_bytes);
        assert_eq!(record.fds_quota, original.fds_quota);
        assert_eq!(record.state, InstanceState::Running);
        assert!(record.orphaned);
        assert_eq!(monitor.stats().reserved_memory_mb, 256);
    }

    #[tokio::test]
    async fn test_writer_coalesces_dirty_signals() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("applications.json");
        let registry = Arc::new(InstanceRegistry::new());
        let writer = Arc::new(SnapshotWriter::new(
            SnapshotStore::new(&path),
            registry.clone(),
            "dea-1",
            Duration::from_millis(20),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = {
            let writer = writer.clone();
            tokio::spawn(async move { writer.run(shutdown_rx).await })
        };

        for index in 0..5 {
            registry.add(test_record(1, index)).await.unwrap();
        }

        let mut loaded = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Ok(Some(snapshot)) = writer.store().load() {
                if snapshot.instances.len() == 5 {
                    loaded = Some(snapshot);
                    break;
                }
            }
        }
        assert!(loaded.is_some());

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
