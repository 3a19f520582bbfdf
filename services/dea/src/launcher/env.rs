//! Environment block for an instance process.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::warn;

use crate::instance::InstanceRecord;

/// Build the ordered environment for `record`.
///
/// System variables come first, then runtime variables, then user
/// `KEY=VALUE` strings. A user variable never replaces a system one.
pub fn build_environment(
    record: &InstanceRecord,
    runtime_env: &[(String, String)],
) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = Vec::new();
    let port = record.port.to_string();

    env.push(("HOME".into(), record.directory.display().to_string()));
    env.push(("VCAP_APPLICATION".into(), application_descriptor(record).to_string()));
    env.push(("VCAP_SERVICES".into(), services_descriptor(record).to_string()));
    env.push(("VCAP_APP_HOST".into(), record.host.clone()));
    env.push(("VCAP_APP_PORT".into(), port.clone()));
    env.push(("PORT".into(), port));

    if let (Some(mode), Some(debug_port)) = (&record.debug_mode, record.debug_port) {
        env.push(("VCAP_DEBUG_IP".into(), record.debug_ip.clone().unwrap_or_else(|| record.host.clone())));
        env.push(("VCAP_DEBUG_PORT".into(), debug_port.to_string()));
        env.push(("VCAP_DEBUG_MODE".into(), mode.clone()));
    }

    let system_len = env.len();
    for (key, value) in runtime_env {
        if !env[..system_len].iter().any(|(k, _)| k == key) {
            env.push((key.clone(), value.clone()));
        }
    }

    for entry in &record.environment {
        let Some((key, value)) = entry.split_once('=') else {
            warn!(instance_id = %record.instance_id, entry = %entry, "Ignoring malformed environment entry");
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        if env[..system_len].iter().any(|(k, _)| k == key) {
            warn!(
                instance_id = %record.instance_id,
                key = %key,
                "User environment may not override a system variable"
            );
            continue;
        }
        match env.iter_mut().find(|(k, _)| k == key) {
            Some(existing) => existing.1 = value.to_string(),
            None => env.push((key.to_string(), value.to_string())),
        }
    }

    env
}

fn application_descriptor(record: &InstanceRecord) -> Value {
    json!({
        "instance_id": record.instance_id,
        "instance_index": record.index,
        "name": record.name,
        "uris": record.uris,
        "users": record.users,
        "version": record.version,
        "start": record.start_timestamp.to_rfc3339(),
        "runtime": record.runtime,
        "state_timestamp": record.state_timestamp.timestamp(),
        "host": record.host,
        "port": record.port,
        "limits": {
            "mem": record.mem_quota_mb(),
            "disk": record.disk_quota_bytes / (1024 * 1024),
            "fds": record.fds_quota,
        },
    })
}

fn services_descriptor(record: &InstanceRecord) -> Value {
    let mut grouped: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for service in &record.services {
        let label = if service.version.is_empty() {
            service.service_type.clone()
        } else {
            format!("{}-{}", service.service_type, service.version)
        };
        grouped.entry(label.clone()).or_default().push(json!({
            "name": service.name,
            "label": label,
            "plan": service.plan,
            "tags": service.tags,
            "plan_option": service.plan_option,
            "credentials": service.credentials,
        }));
    }
    json!(grouped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::test_record;
    use dea_messages::ServiceBinding;

    fn lookup<'a>(env: &'a [(String, String)], key: &str) -> Option<&'a str> {
        env.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_system_variables_present() {
        let mut record = test_record(3, 1);
        record.port = 61000;
        let env = build_environment(&record, &[]);

        assert_eq!(lookup(&env, "PORT"), Some("61000"));
        assert_eq!(lookup(&env, "VCAP_APP_HOST"), Some("127.0.0.1"));
        let app: Value = serde_json::from_str(lookup(&env, "VCAP_APPLICATION").unwrap()).unwrap();
        assert_eq!(app["instance_index"], 1);
        assert_eq!(app["limits"]["mem"], 256);
        assert!(app.get("file_credentials").is_none());
        assert!(lookup(&env, "VCAP_DEBUG_PORT").is_none());
    }

    #[test]
    fn test_user_cannot_override_system_variables() {
        let mut record = test_record(3, 0);
        record.port = 61000;
        record.environment = vec![
            "PORT=1".to_string(),
            "RACK_ENV=staging".to_string(),
            "FOO=bar=baz".to_string(),
            "garbage".to_string(),
        ];
        let runtime = vec![("RACK_ENV".to_string(), "production".to_string())];
        let env = build_environment(&record, &runtime);

        assert_eq!(lookup(&env, "PORT"), Some("61000"));
        assert_eq!(lookup(&env, "RACK_ENV"), Some("staging"));
        assert_eq!(lookup(&env, "FOO"), Some("bar=baz"));
        assert!(lookup(&env, "garbage").is_none());
    }

    #[test]
    fn test_services_whitelisted_and_grouped() {
        let mut record = test_record(3, 0);
        record.services = vec![ServiceBinding {
            name: "db".into(),
            service_type: "mysql".into(),
            version: "5.1".into(),
            vendor: "oracle".into(),
            credentials: json!({"user": "u"}),
            ..ServiceBinding::default()
        }];
        let env = build_environment(&record, &[]);
        let services: Value = serde_json::from_str(lookup(&env, "VCAP_SERVICES").unwrap()).unwrap();
        let db = &services["mysql-5.1"][0];
        assert_eq!(db["name"], "db");
        assert_eq!(db["credentials"]["user"], "u");
        assert!(db.get("vendor").is_none());
    }

    #[test]
    fn test_debug_variables() {
        let mut record = test_record(3, 0);
        record.debug_mode = Some("suspend".into());
        record.debug_port = Some(61001);
        let env = build_environment(&record, &[]);
        assert_eq!(lookup(&env, "VCAP_DEBUG_PORT"), Some("61001"));
        assert_eq!(lookup(&env, "VCAP_DEBUG_MODE"), Some("suspend"));
    }
}
