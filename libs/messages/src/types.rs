//! Message payload definitions.
//!
//! Field names on the wire follow the platform's existing JSON contracts;
//! Rust field names are descriptive and mapped with `serde(rename)`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::MessageError;

/// Droplet (application) identifier assigned by the cloud controller.
pub type DropletId = u64;

// =============================================================================
// Status Enums
// =============================================================================

/// Lifecycle state of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Starting,
    Running,
    Stopped,
    Crashed,
    Deleted,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Starting => "STARTING",
            InstanceState::Running => "RUNNING",
            InstanceState::Stopped => "STOPPED",
            InstanceState::Crashed => "CRASHED",
            InstanceState::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an instance left Starting/Running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitReason {
    #[serde(rename = "STOPPED")]
    Stopped,
    #[serde(rename = "CRASHED")]
    Crashed,
    #[serde(rename = "DEA_EVACUATION")]
    Evacuated,
    #[serde(rename = "DEA_SHUTDOWN")]
    AgentShutdown,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Stopped => "STOPPED",
            ExitReason::Crashed => "CRASHED",
            ExitReason::Evacuated => "DEA_EVACUATION",
            ExitReason::AgentShutdown => "DEA_SHUTDOWN",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Commands
// =============================================================================

/// Resource limits requested for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Memory in megabytes.
    #[serde(rename = "mem")]
    pub memory_mb: u64,
    /// Disk in megabytes.
    #[serde(rename = "disk")]
    pub disk_mb: u64,
    /// Open file descriptors.
    pub fds: u64,
}

impl Limits {
    /// Largest memory or disk limit accepted, in megabytes (1 TiB).
    pub const MAX_MB: u64 = 1 << 20;

    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb.saturating_mul(1024 * 1024)
    }

    pub fn disk_bytes(&self) -> u64 {
        self.disk_mb.saturating_mul(1024 * 1024)
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            memory_mb: 256,
            disk_mb: 2048,
            fds: 256,
        }
    }
}

/// A bound service as sent by the cloud controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceBinding {
    pub name: String,
    #[serde(default, rename = "type")]
    pub service_type: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub plan_option: Option<serde_json::Value>,
    #[serde(default)]
    pub credentials: serde_json::Value,
}

/// `dea.{id}.start`: place one instance on this agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    #[serde(rename = "droplet")]
    pub droplet_id: DropletId,
    #[serde(default)]
    pub version: String,
    pub name: String,
    #[serde(default)]
    pub uris: Vec<String>,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub runtime: String,
    #[serde(default)]
    pub framework: String,
    #[serde(default)]
    pub sha1: Option<String>,
    #[serde(default, rename = "executableUri")]
    pub executable_uri: Option<String>,
    #[serde(default, rename = "executableFile")]
    pub executable_file: Option<String>,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub services: Vec<ServiceBinding>,
    #[serde(default, rename = "env")]
    pub environment: Vec<String>,
    /// Debug mode (`run` or `suspend`), absent for normal starts.
    #[serde(default)]
    pub debug: Option<String>,
}

impl StartRequest {
    /// Check the fields without which the artifact cannot be staged.
    pub fn validate(&self) -> Result<(), MessageError> {
        fn present(value: &Option<String>) -> bool {
            value.as_deref().is_some_and(|v| !v.trim().is_empty())
        }

        if !present(&self.sha1) {
            return Err(MessageError::MissingField("sha1"));
        }
        if !present(&self.executable_file) {
            return Err(MessageError::MissingField("executableFile"));
        }
        if !present(&self.executable_uri) {
            return Err(MessageError::MissingField("executableUri"));
        }
        if self.name.trim().is_empty() {
            return Err(MessageError::MissingField("name"));
        }
        for (field, value) in [("mem", self.limits.memory_mb), ("disk", self.limits.disk_mb)] {
            if value > Limits::MAX_MB {
                return Err(MessageError::OutOfRange { field, value });
            }
        }
        Ok(())
    }
}

/// Instance selector shared by `dea.stop` and `dea.find.droplet`.
///
/// Every present filter must match; absent filters match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceSelector {
    #[serde(rename = "droplet")]
    pub droplet_id: DropletId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, rename = "instances", skip_serializing_if = "Option::is_none")]
    pub instance_ids: Option<Vec<String>>,
    #[serde(default, rename = "indices", skip_serializing_if = "Option::is_none")]
    pub indexes: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub states: Option<Vec<InstanceState>>,
}

impl InstanceSelector {
    pub fn for_droplet(droplet_id: DropletId) -> Self {
        Self {
            droplet_id,
            ..Self::default()
        }
    }

    /// Check whether an instance with the given attributes is selected.
    pub fn matches(
        &self,
        droplet_id: DropletId,
        version: &str,
        instance_id: &str,
        index: u32,
        state: InstanceState,
    ) -> bool {
        if self.droplet_id != droplet_id {
            return false;
        }
        if let Some(wanted) = &self.version {
            if wanted != version {
                return false;
            }
        }
        if let Some(ids) = &self.instance_ids {
            if !ids.iter().any(|id| id == instance_id) {
                return false;
            }
        }
        if let Some(indexes) = &self.indexes {
            if !indexes.contains(&index) {
                return false;
            }
        }
        if let Some(states) = &self.states {
            if !states.contains(&state) {
                return false;
            }
        }
        true
    }
}

/// `dea.stop` payload.
pub type StopRequest = InstanceSelector;

/// `dea.find.droplet` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FindDropletRequest {
    #[serde(flatten)]
    pub selector: InstanceSelector,
    #[serde(default)]
    pub include_stats: bool,
}

/// `dea.update` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRequest {
    #[serde(rename = "droplet")]
    pub droplet_id: DropletId,
    #[serde(default)]
    pub uris: Vec<String>,
}

/// `dea.discover` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverRequest {
    #[serde(rename = "droplet")]
    pub droplet_id: DropletId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub runtime: String,
    #[serde(default)]
    pub sha: Option<String>,
    #[serde(default)]
    pub limits: Limits,
}

// =============================================================================
// Replies
// =============================================================================

/// Agent identity, used for `dea.start` and discover replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub id: String,
    pub ip: String,
    pub port: u16,
    pub version: String,
}

/// One usage sample as reported on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    /// CPU percentage over the last sampling window.
    pub cpu: f64,
    /// Resident memory in kilobytes.
    pub mem: u64,
    /// Disk usage in bytes.
    pub disk: u64,
    /// Sample time, seconds since the Unix epoch.
    pub time: i64,
}

/// Statistics block attached to `dea.find.droplet` replies when requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceStats {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub uris: Vec<String>,
    pub uptime: i64,
    pub mem_quota: u64,
    pub disk_quota: u64,
    pub fds_quota: u64,
    pub cores: u32,
    pub usage: Option<UsageReport>,
}

/// `dea.find.droplet` reply, one per matching instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindDropletResponse {
    pub dea: String,
    pub version: String,
    pub droplet: DropletId,
    pub instance: String,
    pub index: u32,
    pub state: InstanceState,
    pub state_timestamp: i64,
    pub file_uri: String,
    pub credentials: [String; 2],
    pub staged: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<InstanceStats>,
}

/// `droplet.status` reply, one per running instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropletStatusResponse {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub uris: Vec<String>,
    pub uptime: i64,
    pub mem_quota: u64,
    pub disk_quota: u64,
    pub fds_quota: u64,
    pub usage: Option<UsageReport>,
}

/// `dea.status` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    #[serde(flatten)]
    pub hello: Hello,
    /// Memory capacity in megabytes.
    pub max_memory: u64,
    /// Memory reserved by tracked instances, in megabytes.
    pub reserved_memory: u64,
    /// Memory in use by tracked instances, in kilobytes.
    pub used_memory: u64,
    /// Tracked instance count.
    pub num_clients: usize,
}

// =============================================================================
// Events
// =============================================================================

/// One entry of a heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceHeartbeat {
    pub droplet: DropletId,
    pub version: String,
    pub instance: String,
    pub index: u32,
    pub state: InstanceState,
    pub state_timestamp: i64,
}

/// `dea.heartbeat` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub droplets: Vec<InstanceHeartbeat>,
    pub dea: String,
    pub prod: bool,
}

/// `droplet.exited` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitedMessage {
    pub droplet: DropletId,
    pub version: String,
    pub instance: String,
    pub index: u32,
    pub reason: ExitReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crash_timestamp: Option<i64>,
}

/// Tags attached to route registrations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTags {
    pub framework: String,
    pub runtime: String,
}

/// `router.register` / `router.unregister` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRegistration {
    pub dea: String,
    pub app: DropletId,
    pub host: String,
    pub port: u16,
    pub uris: Vec<String>,
    pub tags: RouteTags,
    pub private_instance_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start_json() -> serde_json::Value {
        serde_json::json!({
            "droplet": 42,
            "version": "v1-abc",
            "name": "foo",
            "uris": ["foo.example.com"],
            "users": ["dev@example.com"],
            "index": 0,
            "runtime": "ruby19",
            "framework": "sinatra",
            "sha1": "da39a3ee5e6b4b0d3255bfef95601890afd80709",
            "executableUri": "http://cc/droplets/42",
            "executableFile": "/shared/droplets/42",
            "limits": { "mem": 512, "disk": 2048, "fds": 256 },
            "services": [],
            "env": ["FOO=bar"],
            "debug": null
        })
    }

    #[test]
    fn test_start_request_wire_names() {
        let request: StartRequest = serde_json::from_value(start_json()).unwrap();
        assert_eq!(request.droplet_id, 42);
        assert_eq!(request.limits.memory_mb, 512);
        assert_eq!(request.environment, vec!["FOO=bar".to_string()]);
        assert_eq!(
            request.executable_uri.as_deref(),
            Some("http://cc/droplets/42")
        );
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_start_request_missing_sha1_is_invalid() {
        let mut json = start_json();
        json["sha1"] = serde_json::Value::Null;
        let request: StartRequest = serde_json::from_value(json).unwrap();
        let err = request.validate().unwrap_err();
        assert!(matches!(err, MessageError::MissingField("sha1")));
    }

    #[test]
    fn test_start_request_blank_uri_is_invalid() {
        let mut json = start_json();
        json["executableUri"] = serde_json::json!("  ");
        let request: StartRequest = serde_json::from_value(json).unwrap();
        assert!(matches!(
            request.validate(),
            Err(MessageError::MissingField("executableUri"))
        ));
    }

    #[test]
    fn test_start_request_oversized_limits_are_invalid() {
        let mut json = start_json();
        json["limits"]["mem"] = serde_json::json!(1u64 << 44);
        let request: StartRequest = serde_json::from_value(json).unwrap();
        assert!(matches!(
            request.validate(),
            Err(MessageError::OutOfRange { field: "mem", .. })
        ));
        assert_eq!(request.limits.memory_bytes(), u64::MAX);

        let mut json = start_json();
        json["limits"]["disk"] = serde_json::json!(u64::MAX);
        let request: StartRequest = serde_json::from_value(json).unwrap();
        assert!(matches!(
            request.validate(),
            Err(MessageError::OutOfRange { field: "disk", .. })
        ));
    }

    #[test]
    fn test_start_request_largest_limits_are_valid() {
        let mut json = start_json();
        json["limits"]["mem"] = serde_json::json!(Limits::MAX_MB);
        json["limits"]["disk"] = serde_json::json!(Limits::MAX_MB);
        let request: StartRequest = serde_json::from_value(json).unwrap();
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_selector_without_filters_matches_droplet() {
        let selector: StopRequest = serde_json::from_str(r#"{"droplet": 7}"#).unwrap();
        assert!(selector.instance_ids.is_none());
        assert!(selector.matches(7, "v1", "abc", 3, InstanceState::Running));
        assert!(!selector.matches(8, "v1", "abc", 3, InstanceState::Running));
    }

    #[test]
    fn test_selector_all_filters_must_match() {
        let selector: StopRequest = serde_json::from_str(
            r#"{"droplet": 7, "version": "v2", "indices": [0, 1], "states": ["RUNNING"]}"#,
        )
        .unwrap();
        assert!(selector.matches(7, "v2", "abc", 1, InstanceState::Running));
        assert!(!selector.matches(7, "v1", "abc", 1, InstanceState::Running));
        assert!(!selector.matches(7, "v2", "abc", 2, InstanceState::Running));
        assert!(!selector.matches(7, "v2", "abc", 1, InstanceState::Crashed));
    }

    #[test]
    fn test_find_request_flattens_selector() {
        let request: FindDropletRequest = serde_json::from_str(
            r#"{"droplet": 9, "instances": ["i1"], "include_stats": true}"#,
        )
        .unwrap();
        assert_eq!(request.selector.droplet_id, 9);
        assert_eq!(request.selector.instance_ids, Some(vec!["i1".to_string()]));
        assert!(request.include_stats);
    }

    #[test]
    fn test_exit_reason_wire_names() {
        let json = serde_json::to_string(&ExitReason::Evacuated).unwrap();
        assert_eq!(json, "\"DEA_EVACUATION\"");
        let json = serde_json::to_string(&InstanceState::Crashed).unwrap();
        assert_eq!(json, "\"CRASHED\"");
    }

    #[test]
    fn test_exited_omits_missing_crash_timestamp() {
        let exited = ExitedMessage {
            droplet: 1,
            version: "v1".to_string(),
            instance: "abc".to_string(),
            index: 0,
            reason: ExitReason::Stopped,
            crash_timestamp: None,
        };
        let json = serde_json::to_value(&exited).unwrap();
        assert!(json.get("crash_timestamp").is_none());
        assert_eq!(json["reason"], "STOPPED");
    }

    #[test]
    fn test_agent_status_flattens_identity() {
        let status = AgentStatus {
            hello: Hello {
                id: "dea-1".to_string(),
                ip: "10.0.0.1".to_string(),
                port: 12345,
                version: "0.1.0".to_string(),
            },
            max_memory: 4096,
            reserved_memory: 512,
            used_memory: 1024,
            num_clients: 1,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["id"], "dea-1");
        assert_eq!(json["num_clients"], 1);
    }
}
