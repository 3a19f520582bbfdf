//! Droplet staging.
//!
//! A droplet is resolved in order from the local cache, the shared mount and
//! finally the network. Anything not already in the cache is hashed before
//! it is moved in, and a hash mismatch fails the launch.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("download of {uri} failed with status {status}")]
    Status { uri: String, status: u16 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("invalid content hash: {0}")]
    InvalidHash(String),

    #[error("download timed out")]
    Timeout,

    #[error("staging task failed: {0}")]
    Task(String),
}

/// Content-addressed droplet download.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Download `uri` into `dest`, returning the byte count.
    async fn fetch(&self, uri: &str, dest: &Path) -> Result<u64, ArtifactError>;
}

/// Downloads droplets over HTTP.
pub struct HttpArtifactStore {
    client: Client,
    timeout: Duration,
}

impl HttpArtifactStore {
    pub fn new(timeout: Duration) -> Result<Self, ArtifactError> {
        let client = Client::builder().connect_timeout(Duration::from_secs(30)).build()?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    async fn fetch(&self, uri: &str, dest: &Path) -> Result<u64, ArtifactError> {
        let response = tokio::time::timeout(self.timeout, self.client.get(uri).send())
            .await
            .map_err(|_| ArtifactError::Timeout)??;

        match response.status() {
            StatusCode::OK => {}
            status => {
                return Err(ArtifactError::Status {
                    uri: uri.to_string(),
                    status: status.as_u16(),
                })
            }
        }

        let mut file = File::create(dest)?;
        let mut total = 0u64;
        let mut stream = response.bytes_stream();
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let chunk = match tokio::time::timeout_at(deadline, stream.next()).await {
                Ok(Some(chunk)) => chunk?,
                Ok(None) => break,
                Err(_) => return Err(ArtifactError::Timeout),
            };
            file.write_all(&chunk)?;
            total += chunk.len() as u64;
        }
        file.sync_all()?;
        Ok(total)
    }
}

/// Where a staged droplet came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageSource {
    Cache,
    Shared,
    Download,
}

#[derive(Debug, Clone)]
pub struct StagedDroplet {
    pub path: PathBuf,
    pub source: StageSource,
}

/// Resolves droplets into the local cache.
pub struct DropletStager {
    droplets_dir: PathBuf,
    shared_dir: Option<PathBuf>,
    store: Arc<dyn ArtifactStore>,
    /// Per-hash locks so concurrent starts of one droplet download it once.
    stage_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DropletStager {
    pub fn new(
        droplets_dir: PathBuf,
        shared_dir: Option<PathBuf>,
        store: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            droplets_dir,
            shared_dir,
            store,
            stage_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn cached_path(&self, sha1: &str) -> PathBuf {
        self.droplets_dir.join(sha1).join("droplet.tgz")
    }

    /// Make the droplet with hash `sha1` available locally.
    pub async fn stage(
        &self,
        sha1: &str,
        executable_file: &str,
        executable_uri: &str,
    ) -> Result<StagedDroplet, ArtifactError> {
        validate_hash(sha1)?;
        let cached = self.cached_path(sha1);
        if cached.exists() {
            debug!(sha1 = %sha1, "Droplet cache hit");
            return Ok(StagedDroplet {
                path: cached,
                source: StageSource::Cache,
            });
        }

        let lock = self.stage_lock(sha1).await;
        let result = {
            let _guard = lock.lock().await;
            self.stage_exclusive(sha1, cached, executable_file, executable_uri)
                .await
        };
        self.release_stage_lock(sha1, lock).await;
        result
    }

    /// Stage while holding the per-hash lock.
    async fn stage_exclusive(
        &self,
        sha1: &str,
        cached: PathBuf,
        executable_file: &str,
        executable_uri: &str,
    ) -> Result<StagedDroplet, ArtifactError> {
        // Another start may have staged it while we waited.
        if cached.exists() {
            return Ok(StagedDroplet {
                path: cached,
                source: StageSource::Cache,
            });
        }

        let droplet_dir = self.droplets_dir.join(sha1);
        tokio::fs::create_dir_all(&droplet_dir).await?;
        let tmp_path = droplet_dir.join(format!("droplet.{}.tmp", uuid::Uuid::new_v4().simple()));
        let start = Instant::now();

        let source = match self.shared_path(executable_file) {
            Some(shared) => {
                debug!(sha1 = %sha1, path = %shared.display(), "Copying droplet from shared mount");
                tokio::fs::copy(&shared, &tmp_path).await?;
                StageSource::Shared
            }
            None => {
                debug!(sha1 = %sha1, uri = %executable_uri, "Downloading droplet");
                if let Err(e) = self.store.fetch(executable_uri, &tmp_path).await {
                    let _ = tokio::fs::remove_file(&tmp_path).await;
                    return Err(e);
                }
                StageSource::Download
            }
        };

        let hashed = tmp_path.clone();
        let actual = tokio::task::spawn_blocking(move || sha1_file(&hashed))
            .await
            .map_err(|e| ArtifactError::Task(e.to_string()))??;
        if !actual.eq_ignore_ascii_case(sha1) {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            warn!(expected = %sha1, actual = %actual, "Droplet hash mismatch");
            return Err(ArtifactError::HashMismatch {
                expected: sha1.to_string(),
                actual,
            });
        }

        tokio::fs::rename(&tmp_path, &cached).await?;
        info!(
            sha1 = %sha1,
            source = ?source,
            duration_ms = start.elapsed().as_millis() as u64,
            "Droplet staged"
        );
        Ok(StagedDroplet {
            path: cached,
            source,
        })
    }

    fn shared_path(&self, executable_file: &str) -> Option<PathBuf> {
        let shared_dir = self.shared_dir.as_ref()?;
        let candidate = Path::new(executable_file);
        let path = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            shared_dir.join(candidate)
        };
        if !path.starts_with(shared_dir) || !path.is_file() {
            return None;
        }
        Some(path)
    }

    async fn stage_lock(&self, sha1: &str) -> Arc<Mutex<()>> {
        let mut locks = self.stage_locks.lock().await;
        locks
            .entry(sha1.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop our reference and forget the lock once nobody else holds it.
    async fn release_stage_lock(&self, sha1: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.stage_locks.lock().await;
        drop(lock);
        if locks.get(sha1).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(sha1);
        }
    }
}

fn validate_hash(sha1: &str) -> Result<(), ArtifactError> {
    if sha1.len() == 40 && sha1.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(ArtifactError::InvalidHash(sha1.to_string()))
    }
}

/// Hex SHA-1 of a file's contents.
pub fn sha1_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Serves fixed bytes and counts fetches.
    struct StaticStore {
        body: Vec<u8>,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl ArtifactStore for StaticStore {
        async fn fetch(&self, _uri: &str, dest: &Path) -> Result<u64, ArtifactError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::fs::write(dest, &self.body).await?;
            Ok(self.body.len() as u64)
        }
    }

    fn sha1_hex(bytes: &[u8]) -> String {
        hex::encode(Sha1::digest(bytes))
    }

    fn stager(dir: &TempDir, body: &[u8], shared: Option<PathBuf>) -> (DropletStager, Arc<StaticStore>) {
        let store = Arc::new(StaticStore {
            body: body.to_vec(),
            fetches: AtomicUsize::new(0),
        });
        let stager = DropletStager::new(dir.path().join("droplets"), shared, store.clone());
        (stager, store)
    }

    #[tokio::test]
    async fn test_download_then_cache_hit() {
        let dir = TempDir::new().unwrap();
        let body = b"droplet bits";
        let sha = sha1_hex(body);
        let (stager, store) = stager(&dir, body, None);

        let first = stager.stage(&sha, "droplet", "http://cc/droplet").await.unwrap();
        assert_eq!(first.source, StageSource::Download);
        assert_eq!(fs::read(&first.path).unwrap(), body);

        let second = stager.stage(&sha, "droplet", "http://cc/droplet").await.unwrap();
        assert_eq!(second.source, StageSource::Cache);
        assert_eq!(store.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hash_mismatch_is_fatal_and_not_cached() {
        let dir = TempDir::new().unwrap();
        let (stager, _) = stager(&dir, b"tampered", None);
        let expected = sha1_hex(b"original");

        let err = stager.stage(&expected, "droplet", "http://cc/droplet").await.unwrap_err();
        assert!(matches!(err, ArtifactError::HashMismatch { .. }));
        assert!(!stager.cached_path(&expected).exists());
    }

    #[tokio::test]
    async fn test_shared_mount_preferred_over_download() {
        let dir = TempDir::new().unwrap();
        let shared = dir.path().join("shared");
        fs::create_dir_all(&shared).unwrap();
        let body = b"shared bits";
        fs::write(shared.join("droplet-42"), body).unwrap();
        let (stager, store) = stager(&dir, b"unused", Some(shared.clone()));

        let staged = stager
            .stage(&sha1_hex(body), shared.join("droplet-42").to_str().unwrap(), "http://cc/42")
            .await
            .unwrap();
        assert_eq!(staged.source, StageSource::Shared);
        assert_eq!(store.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stage_locks_are_released() {
        let dir = TempDir::new().unwrap();
        let body = b"droplet bits";
        let (stager, _) = stager(&dir, body, None);

        let digest = sha1_hex(body);
        let (first, second) = tokio::join!(
            stager.stage(&digest, "droplet", "http://cc/droplet"),
            stager.stage(&digest, "droplet", "http://cc/droplet"),
        );
        first.unwrap();
        second.unwrap();
        stager
            .stage(&sha1_hex(b"other"), "droplet", "http://cc/other")
            .await
            .unwrap_err();

        assert!(stager.stage_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_hash_rejected() {
        let dir = TempDir::new().unwrap();
        let (stager, _) = stager(&dir, b"", None);
        let err = stager.stage("../../etc", "x", "http://cc/x").await.unwrap_err();
        assert!(matches!(err, ArtifactError::InvalidHash(_)));
    }
}
