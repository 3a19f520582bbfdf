//! Per-instance state.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dea_messages::{
    DropletId, ExitReason, ExitedMessage, FindDropletResponse, InstanceHeartbeat, InstanceState,
    InstanceStats, RouteRegistration, RouteTags, ServiceBinding, StartRequest, UsageReport,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::launcher::{ExecutionPlugin, Principal, SandboxHandle};

/// Whether a state machine edge exists.
///
/// Crashed never leads back to Running; Deleted and Stopped are final.
pub fn can_transition(from: InstanceState, to: InstanceState) -> bool {
    use InstanceState::*;
    matches!(
        (from, to),
        (Starting, Running)
            | (Starting, Stopped)
            | (Starting, Crashed)
            | (Running, Stopped)
            | (Running, Crashed)
            | (Crashed, Deleted)
    )
}

/// One monitor sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_kb: u64,
    pub disk_bytes: u64,
    /// Cumulative user+system CPU ticks of the process tree.
    pub cpu_ticks: u64,
}

impl UsageSample {
    pub fn at_now(cpu_percent: f64, memory_kb: u64, disk_bytes: u64, cpu_ticks: u64) -> Self {
        Self {
            timestamp: Utc::now(),
            cpu_percent,
            memory_kb,
            disk_bytes,
            cpu_ticks,
        }
    }

    pub fn to_report(&self) -> UsageReport {
        UsageReport {
            cpu: self.cpu_percent,
            mem: self.memory_kb,
            disk: self.disk_bytes,
            time: self.timestamp.timestamp(),
        }
    }
}

/// Bounded usage history; the oldest sample is evicted first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageHistory {
    capacity: usize,
    samples: VecDeque<UsageSample>,
}

impl UsageHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, sample: UsageSample) {
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn last(&self) -> Option<&UsageSample> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &UsageSample> {
        self.samples.iter()
    }
}

/// Everything the agent knows about one instance.
///
/// Guarded by the owning [`Instance`](super::Instance)'s lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    // Identity
    pub instance_id: String,
    pub droplet_id: DropletId,
    pub index: u32,
    pub version: String,
    pub name: String,

    // Placement
    pub uris: Vec<String>,
    pub users: Vec<String>,
    pub runtime: String,
    pub framework: String,
    pub directory: PathBuf,
    pub host: String,
    pub port: u16,
    pub debug_mode: Option<String>,
    pub debug_ip: Option<String>,
    pub debug_port: Option<u16>,

    // Artifact
    pub sha1: String,
    pub executable_uri: String,
    pub executable_file: String,
    pub services: Vec<ServiceBinding>,
    pub environment: Vec<String>,

    // Quotas
    pub mem_quota_bytes: u64,
    pub disk_quota_bytes: u64,
    pub fds_quota: u64,

    // Lifecycle
    pub state: InstanceState,
    pub state_timestamp: DateTime<Utc>,
    pub start_timestamp: DateTime<Utc>,
    pub crash_timestamp: Option<DateTime<Utc>>,
    pub exit_reason: Option<ExitReason>,
    pub notified_exited: bool,
    pub stop_processed: bool,
    pub resources_tracked: bool,
    pub evacuated: bool,
    #[serde(skip)]
    pub orphaned: bool,
    /// Set once the instance directory has been deleted.
    pub directory_released: bool,
    /// A launch task is still building this instance's handles.
    #[serde(default)]
    pub launching: bool,

    // Runtime handle
    pub process_id: Option<u32>,
    pub sandbox: Option<SandboxHandle>,
    pub principal: Option<Principal>,
    #[serde(skip)]
    pub plugin: Option<Arc<dyn ExecutionPlugin>>,
    /// Basic-auth pair for the file viewer.
    pub file_credentials: [String; 2],

    // Usage
    pub usage: UsageHistory,
    /// Priority downgrades applied for sustained CPU.
    pub renice_steps: u8,
}

impl InstanceRecord {
    /// Build a Starting record from an admitted start request.
    pub fn from_start(
        request: &StartRequest,
        instance_id: String,
        directory: PathBuf,
        host: String,
        history_len: usize,
    ) -> Self {
        let now = Utc::now();
        let mut uris: Vec<String> = Vec::with_capacity(request.uris.len());
        for uri in &request.uris {
            if !uris.contains(uri) {
                uris.push(uri.clone());
            }
        }

        Self {
            instance_id,
            droplet_id: request.droplet_id,
            index: request.index,
            version: request.version.clone(),
            name: request.name.clone(),
            uris,
            users: request.users.clone(),
            runtime: request.runtime.clone(),
            framework: request.framework.clone(),
            directory,
            host,
            port: 0,
            debug_mode: request.debug.clone(),
            debug_ip: None,
            debug_port: None,
            sha1: request.sha1.clone().unwrap_or_default(),
            executable_uri: request.executable_uri.clone().unwrap_or_default(),
            executable_file: request.executable_file.clone().unwrap_or_default(),
            services: request.services.clone(),
            environment: request.environment.clone(),
            mem_quota_bytes: request.limits.memory_bytes(),
            disk_quota_bytes: request.limits.disk_bytes(),
            fds_quota: request.limits.fds,
            state: InstanceState::Starting,
            state_timestamp: now,
            start_timestamp: now,
            crash_timestamp: None,
            exit_reason: None,
            notified_exited: false,
            stop_processed: false,
            resources_tracked: false,
            evacuated: false,
            orphaned: false,
            directory_released: false,
            launching: false,
            process_id: None,
            sandbox: None,
            principal: None,
            plugin: None,
            file_credentials: [random_token(), random_token()],
            usage: UsageHistory::new(history_len),
            renice_steps: 0,
        }
    }

    pub fn mem_quota_mb(&self) -> u64 {
        self.mem_quota_bytes / (1024 * 1024)
    }

    /// Move to `to` if the state machine allows it.
    ///
    /// Returns false and leaves the record untouched otherwise.
    pub fn transition(&mut self, to: InstanceState) -> bool {
        if self.state == to {
            return true;
        }
        if !can_transition(self.state, to) {
            warn!(
                instance_id = %self.instance_id,
                from = %self.state,
                to = %to,
                "Rejected invalid state transition"
            );
            return false;
        }
        self.state = to;
        self.state_timestamp = Utc::now();
        if to == InstanceState::Crashed {
            self.crash_timestamp = Some(self.state_timestamp);
        }
        true
    }

    pub fn is_live(&self) -> bool {
        matches!(self.state, InstanceState::Starting | InstanceState::Running)
    }

    /// Crashed long enough ago that its directory may be reclaimed.
    pub fn is_aged_crash(&self, now: DateTime<Utc>, lifetime: Duration) -> bool {
        if self.state != InstanceState::Crashed {
            return false;
        }
        let crashed_at = self.crash_timestamp.unwrap_or(self.state_timestamp);
        let lifetime = chrono::Duration::from_std(lifetime).unwrap_or(chrono::Duration::MAX);
        now - crashed_at >= lifetime
    }

    /// Whether a plugin or sandbox still holds OS resources.
    pub fn has_live_handle(&self) -> bool {
        self.plugin.is_some() || self.sandbox.is_some()
    }

    /// Stopped while live, but the exited notification never went out.
    pub fn exit_notice_pending(&self) -> bool {
        self.stop_processed && !self.notified_exited && self.exit_reason.is_some()
    }

    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.start_timestamp).num_seconds().max(0)
    }

    pub fn to_heartbeat(&self) -> InstanceHeartbeat {
        InstanceHeartbeat {
            droplet: self.droplet_id,
            version: self.version.clone(),
            instance: self.instance_id.clone(),
            index: self.index,
            state: self.state,
            state_timestamp: self.state_timestamp.timestamp(),
        }
    }

    pub fn to_exited(&self) -> ExitedMessage {
        let reason = self.exit_reason.unwrap_or(ExitReason::Crashed);
        let crash_timestamp = if reason == ExitReason::Crashed {
            Some(self.crash_timestamp.unwrap_or_else(Utc::now).timestamp())
        } else {
            None
        };
        ExitedMessage {
            droplet: self.droplet_id,
            version: self.version.clone(),
            instance: self.instance_id.clone(),
            index: self.index,
            reason,
            crash_timestamp,
        }
    }

    pub fn route_registration(&self, agent_id: &str, uris: Vec<String>) -> RouteRegistration {
        RouteRegistration {
            dea: agent_id.to_string(),
            app: self.droplet_id,
            host: self.host.clone(),
            port: self.port,
            uris,
            tags: RouteTags {
                framework: self.framework.clone(),
                runtime: self.runtime.clone(),
            },
            private_instance_id: self.instance_id.clone(),
        }
    }

    pub fn usage_report(&self) -> Option<UsageReport> {
        self.usage.last().map(UsageSample::to_report)
    }

    pub fn stats(&self, cores: u32) -> InstanceStats {
        InstanceStats {
            name: self.name.clone(),
            host: self.host.clone(),
            port: self.port,
            uris: self.uris.clone(),
            uptime: self.uptime_secs(),
            mem_quota: self.mem_quota_bytes,
            disk_quota: self.disk_quota_bytes,
            fds_quota: self.fds_quota,
            cores,
            usage: self.usage_report(),
        }
    }

    pub fn to_find_response(
        &self,
        agent_id: &str,
        file_uri: String,
        stats: Option<InstanceStats>,
    ) -> FindDropletResponse {
        FindDropletResponse {
            dea: agent_id.to_string(),
            version: self.version.clone(),
            droplet: self.droplet_id,
            instance: self.instance_id.clone(),
            index: self.index,
            state: self.state,
            state_timestamp: self.state_timestamp.timestamp(),
            file_uri,
            credentials: self.file_credentials.clone(),
            staged: self.staged_name(),
            debug_ip: self.debug_ip.clone(),
            debug_port: self.debug_port,
            stats,
        }
    }

    /// Directory name relative to the apps root.
    pub fn staged_name(&self) -> String {
        self.directory
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

fn random_token() -> String {
    use rand::Rng;
    let bytes: [u8; 16] = rand::rng().random();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::test_record;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(InstanceState::Starting, InstanceState::Running, true)]
    #[case(InstanceState::Starting, InstanceState::Crashed, true)]
    #[case(InstanceState::Running, InstanceState::Stopped, true)]
    #[case(InstanceState::Running, InstanceState::Crashed, true)]
    #[case(InstanceState::Crashed, InstanceState::Deleted, true)]
    #[case(InstanceState::Crashed, InstanceState::Running, false)]
    #[case(InstanceState::Crashed, InstanceState::Starting, false)]
    #[case(InstanceState::Stopped, InstanceState::Running, false)]
    #[case(InstanceState::Deleted, InstanceState::Crashed, false)]
    #[case(InstanceState::Running, InstanceState::Starting, false)]
    fn test_transition_table(
        #[case] from: InstanceState,
        #[case] to: InstanceState,
        #[case] allowed: bool,
    ) {
        assert_eq!(can_transition(from, to), allowed);
    }

    #[test]
    fn test_crashed_never_returns_to_running() {
        let mut record = test_record(1, 0);
        assert!(record.transition(InstanceState::Crashed));
        assert!(record.crash_timestamp.is_some());
        assert!(!record.transition(InstanceState::Running));
        assert_eq!(record.state, InstanceState::Crashed);
    }

    #[test]
    fn test_aged_crash() {
        let mut record = test_record(1, 0);
        record.transition(InstanceState::Crashed);
        let crashed_at = record.crash_timestamp.unwrap();
        let lifetime = Duration::from_secs(60);
        assert!(!record.is_aged_crash(crashed_at + chrono::Duration::seconds(30), lifetime));
        assert!(record.is_aged_crash(crashed_at + chrono::Duration::seconds(61), lifetime));
    }

    #[test]
    fn test_exited_message_carries_crash_timestamp_only_for_crashes() {
        let mut record = test_record(1, 0);
        record.exit_reason = Some(ExitReason::Stopped);
        assert!(record.to_exited().crash_timestamp.is_none());

        record.exit_reason = None;
        let exited = record.to_exited();
        assert_eq!(exited.reason, ExitReason::Crashed);
        assert!(exited.crash_timestamp.is_some());
    }

    #[test]
    fn test_from_start_saturates_huge_limits() {
        let request: StartRequest = serde_json::from_value(serde_json::json!({
            "droplet": 5,
            "name": "foo",
            "runtime": "ruby",
            "limits": {"mem": 17592186044416u64, "disk": 17592186044416u64, "fds": 64}
        }))
        .unwrap();
        let record = InstanceRecord::from_start(
            &request,
            "abc".to_string(),
            PathBuf::from("/apps/foo-0-abc"),
            "127.0.0.1".to_string(),
            4,
        );
        assert_eq!(record.mem_quota_bytes, u64::MAX);
        assert_eq!(record.disk_quota_bytes, u64::MAX);
    }

    #[test]
    fn test_exit_notice_pending() {
        let mut record = test_record(1, 0);
        assert!(!record.exit_notice_pending());
        record.stop_processed = true;
        assert!(!record.exit_notice_pending());
        record.exit_reason = Some(ExitReason::Stopped);
        assert!(record.exit_notice_pending());
        record.notified_exited = true;
        assert!(!record.exit_notice_pending());
    }

    #[test]
    fn test_from_start_dedups_uris() {
        let request: StartRequest = serde_json::from_value(serde_json::json!({
            "droplet": 5,
            "name": "foo",
            "uris": ["a.example.com", "b.example.com", "a.example.com"],
            "runtime": "ruby",
            "limits": {"mem": 128, "disk": 256, "fds": 64}
        }))
        .unwrap();
        let record = InstanceRecord::from_start(
            &request,
            "abc".to_string(),
            PathBuf::from("/apps/foo-0-abc"),
            "127.0.0.1".to_string(),
            4,
        );
        assert_eq!(record.uris, vec!["a.example.com", "b.example.com"]);
        assert_eq!(record.mem_quota_mb(), 128);
        assert_eq!(record.state, InstanceState::Starting);
        assert_eq!(record.staged_name(), "foo-0-abc");
        assert_ne!(record.file_credentials[0], record.file_credentials[1]);
    }

    proptest! {
        #[test]
        fn prop_usage_history_is_bounded(capacity in 1usize..20, pushes in 0usize..80) {
            let mut history = UsageHistory::new(capacity);
            for i in 0..pushes {
                history.push(UsageSample::at_now(0.0, i as u64, 0, 0));
            }
            prop_assert_eq!(history.len(), pushes.min(capacity));
            if pushes > 0 {
                prop_assert_eq!(history.last().unwrap().memory_kb, (pushes - 1) as u64);
                let oldest = history.iter().next().unwrap().memory_kb;
                prop_assert_eq!(oldest, pushes.saturating_sub(capacity) as u64);
            }
        }
    }
}
