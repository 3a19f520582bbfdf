//! Configuration for the droplet execution agent.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::resources::HostCapacity;

/// Readiness polling budget for newly launched instances.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessConfig {
    /// Connect attempts before the instance is declared crashed.
    pub attempts: u32,
    /// Delay between attempts.
    pub interval: Duration,
    /// Timeout of a single connect attempt.
    pub connect_timeout: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            attempts: 1000,
            interval: Duration::from_millis(100),
            connect_timeout: Duration::from_millis(250),
        }
    }
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this agent, used in topics and payloads.
    pub agent_id: String,

    /// Message bus address.
    pub nats_uri: String,

    /// Root for the droplet cache, instance directories and snapshot.
    pub base_dir: PathBuf,

    /// Optional shared mount holding droplets by file name.
    pub shared_dir: Option<PathBuf>,

    /// Address published to routers and used for readiness checks.
    pub local_route: String,

    /// Port advertised in file URIs and hello messages.
    pub file_viewer_port: u16,

    /// Memory capacity in megabytes.
    pub max_memory_mb: u64,

    /// Instance capacity.
    pub max_instances: usize,

    /// Runtimes this agent accepts.
    pub runtimes: Vec<String>,

    pub heartbeat_interval: Duration,
    pub monitor_interval: Duration,
    pub process_check_interval: Duration,
    pub reap_interval: Duration,

    /// How long crashed instances keep their directory.
    pub crash_lifetime: Duration,

    /// Quiet period before a requested snapshot is written.
    pub snapshot_debounce: Duration,

    /// Kill on memory/disk quota violations, renice on sustained CPU.
    pub enforce_quotas: bool,

    /// Mark heartbeats as production.
    pub prod: bool,

    /// Run each instance as its own system user.
    pub secure: bool,

    /// Grace period between SIGTERM and SIGKILL on stop.
    pub stop_grace: Duration,

    /// Deadline for a single droplet download.
    pub download_timeout: Duration,

    /// Time between announcing an evacuation and shutting down.
    pub evacuation_delay: Duration,

    pub readiness: ReadinessConfig,

    /// Samples kept per instance.
    pub usage_history_len: usize,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Defaults rooted at `base_dir`, with capacity taken from the host.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let host = HostCapacity::measure();
        Self {
            agent_id: uuid::Uuid::new_v4().simple().to_string(),
            nats_uri: "nats://127.0.0.1:4222".to_string(),
            base_dir: base_dir.into(),
            shared_dir: None,
            local_route: "127.0.0.1".to_string(),
            file_viewer_port: 12345,
            max_memory_mb: host.memory_mb.max(1),
            max_instances: 32,
            runtimes: ["ruby", "node", "java", "php", "python"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            heartbeat_interval: Duration::from_secs(10),
            monitor_interval: Duration::from_millis(2000),
            process_check_interval: Duration::from_secs(1),
            reap_interval: Duration::from_secs(10),
            crash_lifetime: Duration::from_secs(3600),
            snapshot_debounce: Duration::from_millis(500),
            enforce_quotas: false,
            prod: false,
            secure: false,
            stop_grace: Duration::from_secs(5),
            download_timeout: Duration::from_secs(300),
            evacuation_delay: Duration::from_secs(30),
            readiness: ReadinessConfig::default(),
            usage_history_len: 30,
            log_level: "info".to_string(),
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let base_dir =
            std::env::var("DEA_BASE_DIR").unwrap_or_else(|_| "/var/vcap/data/dea".to_string());
        let mut config = Self::new(base_dir);

        if let Ok(id) = std::env::var("DEA_ID") {
            config.agent_id = id;
        }
        if let Ok(uri) = std::env::var("DEA_NATS_URI") {
            config.nats_uri = uri;
        }
        config.shared_dir = std::env::var("DEA_SHARED_DIR").ok().map(PathBuf::from);
        if let Ok(route) = std::env::var("DEA_LOCAL_ROUTE") {
            config.local_route = route;
        }
        if let Ok(runtimes) = std::env::var("DEA_RUNTIMES") {
            config.runtimes = runtimes
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(port) = env_parse::<u16>("DEA_FILE_VIEWER_PORT")? {
            config.file_viewer_port = port;
        }
        if let Some(mb) = env_parse::<u64>("DEA_MAX_MEMORY_MB")? {
            config.max_memory_mb = mb;
        }
        if let Some(n) = env_parse::<usize>("DEA_MAX_INSTANCES")? {
            config.max_instances = n;
        }
        if let Some(secs) = env_parse::<u64>("DEA_HEARTBEAT_INTERVAL_SECS")? {
            config.heartbeat_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(ms) = env_parse::<u64>("DEA_MONITOR_INTERVAL_MS")? {
            config.monitor_interval = Duration::from_millis(ms.max(100));
        }
        if let Some(secs) = env_parse::<u64>("DEA_REAP_INTERVAL_SECS")? {
            config.reap_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = env_parse::<u64>("DEA_CRASH_LIFETIME_SECS")? {
            config.crash_lifetime = Duration::from_secs(secs);
        }
        if let Some(attempts) = env_parse::<u32>("DEA_READINESS_ATTEMPTS")? {
            config.readiness.attempts = attempts.max(1);
        }
        if let Some(ms) = env_parse::<u64>("DEA_READINESS_INTERVAL_MS")? {
            config.readiness.interval = Duration::from_millis(ms.max(10));
        }

        config.enforce_quotas = env_flag("DEA_ENFORCE_QUOTAS");
        config.prod = env_flag("DEA_PROD");
        config.secure = env_flag("DEA_SECURE");
        if let Some(secs) = env_parse::<u64>("DEA_STOP_GRACE_SECS")? {
            config.stop_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("DEA_EVACUATION_DELAY_SECS")? {
            config.evacuation_delay = Duration::from_secs(secs);
        }
        config.log_level = std::env::var("DEA_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(config)
    }

    /// Cache of staged droplets, keyed by content hash.
    pub fn droplets_dir(&self) -> PathBuf {
        self.base_dir.join("droplets")
    }

    /// Parent of every instance directory.
    pub fn apps_dir(&self) -> PathBuf {
        self.base_dir.join("apps")
    }

    /// Snapshot file location.
    pub fn snapshot_path(&self) -> PathBuf {
        self.base_dir.join("db").join("applications.json")
    }

    pub fn supports_runtime(&self, runtime: &str) -> bool {
        self.runtimes.iter().any(|r| r == runtime)
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    std::env::var(name)
        .ok()
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{name} must be a valid number"))
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
