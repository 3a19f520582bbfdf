//! Shared fixtures: an agent on an in-process bus with a fake launcher.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use dea_agent::bus::LocalBus;
use dea_agent::config::ReadinessConfig;
use dea_agent::launcher::FakeLauncher;
use dea_agent::monitor::{ProbeTarget, RawUsage, UsageProbe};
use dea_agent::{Agent, Config, Instance};
use dea_messages::{topics, InstanceState};
use serde_json::{json, Value};
use tempfile::TempDir;

pub const AGENT_ID: &str = "test-dea";

/// Reports nothing; the monitor then only checks liveness.
#[derive(Debug, Default)]
pub struct IdleProbe;

impl UsageProbe for IdleProbe {
    fn sample(&self, _targets: &[ProbeTarget]) -> HashMap<String, RawUsage> {
        HashMap::new()
    }

    fn ticks_per_second(&self) -> u64 {
        100
    }

    fn renice(&self, _process_group: u32, _niceness: i32) -> io::Result<()> {
        Ok(())
    }
}

pub fn test_config(base_dir: &std::path::Path) -> Config {
    let mut config = Config::new(base_dir);
    config.agent_id = AGENT_ID.to_string();
    config.max_memory_mb = 1024;
    config.max_instances = 8;
    config.runtimes = vec!["ruby".to_string()];
    config.local_route = "127.0.0.1".to_string();
    // Timers stay quiet; tests drive cycles explicitly.
    config.heartbeat_interval = Duration::from_secs(3600);
    config.monitor_interval = Duration::from_secs(3600);
    config.process_check_interval = Duration::from_secs(3600);
    config.reap_interval = Duration::from_secs(3600);
    config.snapshot_debounce = Duration::from_millis(10);
    config.readiness = ReadinessConfig {
        attempts: 20,
        interval: Duration::from_millis(20),
        connect_timeout: Duration::from_millis(200),
    };
    config
}

pub struct Harness {
    pub dir: TempDir,
    pub bus: Arc<LocalBus>,
    pub launcher: Arc<FakeLauncher>,
    pub agent: Arc<Agent>,
}

impl Harness {
    pub async fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let launcher = Arc::new(FakeLauncher::new(&["ruby"]));
        Self::start_in(dir, launcher).await
    }

    /// Start an agent over an existing base directory and launcher.
    pub async fn start_in(dir: TempDir, launcher: Arc<FakeLauncher>) -> Self {
        let bus = Arc::new(LocalBus::new());
        let agent = Agent::new(
            test_config(dir.path()),
            bus.clone(),
            launcher.clone(),
            Arc::new(IdleProbe),
        );
        agent.start().await.unwrap();
        Self {
            dir,
            bus,
            launcher,
            agent,
        }
    }

    pub fn send(&self, subject: &str, payload: Value) {
        self.bus
            .inject(subject, serde_json::to_vec(&payload).unwrap(), None);
    }

    pub fn request(&self, subject: &str, payload: Value, reply_to: &str) {
        self.bus
            .inject(subject, serde_json::to_vec(&payload).unwrap(), Some(reply_to));
    }

    pub fn start_droplet(&self, droplet_id: u64, index: u32, memory_mb: u64) {
        self.send(&topics::dea_start(AGENT_ID), start_request(droplet_id, index, memory_mb));
    }

    /// Every payload published on `subject`, decoded.
    pub fn published(&self, subject: &str) -> Vec<Value> {
        self.bus
            .published_on(subject)
            .into_iter()
            .map(|m| serde_json::from_slice(&m.payload).unwrap())
            .collect()
    }

    pub async fn instance(&self, droplet_id: u64, index: u32) -> Option<Arc<Instance>> {
        self.agent
            .registry()
            .find_by_droplet(droplet_id)
            .await
            .into_iter()
            .find(|i| i.index() == index)
    }

    /// Wait for the instance to exist and reach `state`.
    pub async fn wait_for_state(&self, droplet_id: u64, index: u32, state: InstanceState) -> Arc<Instance> {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        loop {
            if let Some(instance) = self.instance(droplet_id, index).await {
                if instance.read().await.state == state {
                    return instance;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "droplet {droplet_id} index {index} never reached {state}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

pub fn start_request(droplet_id: u64, index: u32, memory_mb: u64) -> Value {
    json!({
        "droplet": droplet_id,
        "name": format!("app{droplet_id}"),
        "version": "v1",
        "uris": [format!("app{droplet_id}.example.com")],
        "index": index,
        "runtime": "ruby",
        "framework": "sinatra",
        "sha1": "da39a3ee5e6b4b0d3255bfef95601890afd80709",
        "executableUri": format!("http://cc/droplets/{droplet_id}"),
        "executableFile": format!("/shared/droplets/{droplet_id}"),
        "limits": {"mem": memory_mb, "disk": 1024, "fds": 256}
    })
}

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Re-evaluate a condition until it holds, failing after [`TIMEOUT`].
macro_rules! eventually {
    ($cond:expr) => {{
        let deadline = tokio::time::Instant::now() + $crate::common::TIMEOUT;
        loop {
            if $cond {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not met: {}",
                stringify!($cond)
            );
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }};
}
