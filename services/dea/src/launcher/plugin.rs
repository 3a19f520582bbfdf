//! Execution plugins.
//!
//! A plugin owns one instance's process: it prepares the staged directory,
//! starts the process inside the sandbox, stops it, and can reattach to it
//! after an agent restart. Plugins are chosen by runtime name through the
//! [`PluginRegistry`].

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::principal::Principal;
use super::sandbox::{Sandbox, SandboxCommand, SandboxError, SandboxHandle, StopSignal};

const PID_FILE: &str = "run.pid";

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("start script missing: {0}")]
    MissingStartScript(PathBuf),

    #[error("plugin I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("no plugin for runtime {0}")]
    UnsupportedRuntime(String),
}

/// Everything a plugin needs to run one instance.
#[derive(Debug, Clone, Copy)]
pub struct PluginContext<'a> {
    pub instance_id: &'a str,
    pub directory: &'a Path,
    pub port: u16,
    pub environment: &'a [(String, String)],
    pub principal: Option<&'a Principal>,
}

#[async_trait]
pub trait ExecutionPlugin: fmt::Debug + Send + Sync {
    /// Prepare the staged directory.
    async fn configure(&self, ctx: &PluginContext<'_>) -> Result<(), PluginError>;

    /// Start the process. Returns its pid.
    async fn start(&self, ctx: &PluginContext<'_>, sandbox: &mut SandboxHandle) -> Result<u32, PluginError>;

    /// Stop the process, forcibly if it does not exit in time.
    async fn stop(&self, sandbox: &SandboxHandle) -> Result<(), PluginError>;

    /// Remove plugin state from the instance directory.
    async fn cleanup(&self, directory: &Path) -> Result<(), PluginError>;

    fn process_id(&self) -> Option<u32>;

    /// Reattach after a restart. Returns whether the process is still alive.
    async fn recover_application(
        &self,
        directory: &Path,
        sandbox: &SandboxHandle,
        process_id: Option<u32>,
    ) -> Result<bool, PluginError>;
}

/// Builds plugins for one runtime.
pub trait PluginFactory: Send + Sync {
    /// Runtime-specific variables added to the environment block.
    fn runtime_environment(&self) -> Vec<(String, String)>;

    fn create(&self) -> Arc<dyn ExecutionPlugin>;
}

/// Runs the droplet's `startup` script.
pub struct ProcessPlugin {
    sandbox: Arc<dyn Sandbox>,
    stop_grace: Duration,
    pid: Mutex<Option<u32>>,
}

impl fmt::Debug for ProcessPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessPlugin")
            .field("stop_grace", &self.stop_grace)
            .field("pid", &self.process_id())
            .finish()
    }
}

impl ProcessPlugin {
    pub fn new(sandbox: Arc<dyn Sandbox>, stop_grace: Duration) -> Self {
        Self {
            sandbox,
            stop_grace,
            pid: Mutex::new(None),
        }
    }

    fn set_pid(&self, pid: Option<u32>) {
        *self.pid.lock().unwrap_or_else(PoisonError::into_inner) = pid;
    }
}

#[async_trait]
impl ExecutionPlugin for ProcessPlugin {
    async fn configure(&self, ctx: &PluginContext<'_>) -> Result<(), PluginError> {
        let script = ctx.directory.join("startup");
        let metadata = match tokio::fs::metadata(&script).await {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => return Err(PluginError::MissingStartScript(script)),
        };

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut permissions = metadata.permissions();
            if permissions.mode() & 0o100 == 0 {
                permissions.set_mode(permissions.mode() | 0o755);
                tokio::fs::set_permissions(&script, permissions).await?;
            }
        }
        #[cfg(not(unix))]
        let _ = metadata;

        tokio::fs::create_dir_all(ctx.directory.join("logs")).await?;
        debug!(instance_id = %ctx.instance_id, "Configured instance directory");
        Ok(())
    }

    async fn start(&self, ctx: &PluginContext<'_>, sandbox: &mut SandboxHandle) -> Result<u32, PluginError> {
        let logs = ctx.directory.join("logs");
        let command = SandboxCommand {
            program: ctx.directory.join("startup"),
            args: vec!["-p".to_string(), ctx.port.to_string()],
            cwd: ctx.directory.to_path_buf(),
            env: ctx.environment.to_vec(),
            uid: ctx.principal.and_then(|p| p.uid),
            gid: ctx.principal.and_then(|p| p.gid),
            stdout: Some(logs.join("stdout.log")),
            stderr: Some(logs.join("stderr.log")),
        };
        let pid = self.sandbox.spawn(sandbox, command).await?;
        self.set_pid(Some(pid));
        tokio::fs::write(ctx.directory.join(PID_FILE), pid.to_string()).await?;
        info!(instance_id = %ctx.instance_id, pid = pid, port = ctx.port, "Started instance process");
        Ok(pid)
    }

    async fn stop(&self, sandbox: &SandboxHandle) -> Result<(), PluginError> {
        if self.sandbox.processes(sandbox).is_empty() {
            self.set_pid(None);
            return Ok(());
        }

        self.sandbox.signal(sandbox, StopSignal::Terminate)?;
        let deadline = tokio::time::Instant::now() + self.stop_grace;
        while tokio::time::Instant::now() < deadline {
            if self.sandbox.processes(sandbox).is_empty() {
                self.set_pid(None);
                debug!(sandbox = %sandbox.id, "Instance process exited after SIGTERM");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        warn!(sandbox = %sandbox.id, "Instance process ignored SIGTERM, killing");
        self.sandbox.signal(sandbox, StopSignal::Kill)?;
        self.set_pid(None);
        Ok(())
    }

    async fn cleanup(&self, directory: &Path) -> Result<(), PluginError> {
        self.set_pid(None);
        match tokio::fs::remove_file(directory.join(PID_FILE)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn process_id(&self) -> Option<u32> {
        *self.pid.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn recover_application(
        &self,
        directory: &Path,
        sandbox: &SandboxHandle,
        process_id: Option<u32>,
    ) -> Result<bool, PluginError> {
        let pid = match process_id {
            Some(pid) => Some(pid),
            None => tokio::fs::read_to_string(directory.join(PID_FILE))
                .await
                .ok()
                .and_then(|s| s.trim().parse().ok()),
        };
        let alive = !self.sandbox.processes(sandbox).is_empty();
        self.set_pid(if alive { pid } else { None });
        Ok(alive)
    }
}

/// Factory for [`ProcessPlugin`] with a fixed runtime environment.
pub struct ProcessPluginFactory {
    sandbox: Arc<dyn Sandbox>,
    stop_grace: Duration,
    runtime_env: Vec<(String, String)>,
}

impl ProcessPluginFactory {
    pub fn new(sandbox: Arc<dyn Sandbox>, stop_grace: Duration, runtime_env: Vec<(String, String)>) -> Self {
        Self {
            sandbox,
            stop_grace,
            runtime_env,
        }
    }
}

impl PluginFactory for ProcessPluginFactory {
    fn runtime_environment(&self) -> Vec<(String, String)> {
        self.runtime_env.clone()
    }

    fn create(&self) -> Arc<dyn ExecutionPlugin> {
        Arc::new(ProcessPlugin::new(self.sandbox.clone(), self.stop_grace))
    }
}

/// Default variables for well-known runtimes.
fn default_runtime_env(runtime: &str) -> Vec<(String, String)> {
    let pairs: &[(&str, &str)] = match runtime {
        r if r.starts_with("ruby") => &[("RACK_ENV", "production"), ("RAILS_ENV", "production")],
        r if r.starts_with("node") => &[("NODE_ENV", "production")],
        r if r.starts_with("java") => &[("JAVA_OPTS", "-Djava.io.tmpdir=tmp")],
        r if r.starts_with("python") => &[("PYTHONUNBUFFERED", "1")],
        _ => &[],
    };
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Plugins keyed by runtime name.
#[derive(Default)]
pub struct PluginRegistry {
    factories: HashMap<String, Arc<dyn PluginFactory>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A [`ProcessPlugin`] factory for each runtime in `runtimes`.
    pub fn with_process_plugins(runtimes: &[String], sandbox: Arc<dyn Sandbox>, stop_grace: Duration) -> Self {
        let mut registry = Self::new();
        for runtime in runtimes {
            registry.register(
                runtime,
                Arc::new(ProcessPluginFactory::new(
                    sandbox.clone(),
                    stop_grace,
                    default_runtime_env(runtime),
                )),
            );
        }
        registry
    }

    pub fn register(&mut self, runtime: &str, factory: Arc<dyn PluginFactory>) {
        self.factories.insert(runtime.to_string(), factory);
    }

    pub fn supports(&self, runtime: &str) -> bool {
        self.factories.contains_key(runtime)
    }

    pub fn factory(&self, runtime: &str) -> Result<Arc<dyn PluginFactory>, PluginError> {
        self.factories
            .get(runtime)
            .cloned()
            .ok_or_else(|| PluginError::UnsupportedRuntime(runtime.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::sandbox::{MockSandbox, SandboxLimits};
    use tempfile::TempDir;

    fn limits() -> SandboxLimits {
        SandboxLimits {
            memory_bytes: 0,
            nofile: 0,
            nproc: 0,
        }
    }

    #[tokio::test]
    async fn test_configure_requires_startup_script() {
        let dir = TempDir::new().unwrap();
        let plugin = ProcessPlugin::new(Arc::new(MockSandbox::new()), Duration::from_millis(10));
        let ctx = PluginContext {
            instance_id: "abc",
            directory: dir.path(),
            port: 61000,
            environment: &[],
            principal: None,
        };
        assert!(matches!(
            plugin.configure(&ctx).await,
            Err(PluginError::MissingStartScript(_))
        ));

        std::fs::write(dir.path().join("startup"), "#!/bin/sh\n").unwrap();
        plugin.configure(&ctx).await.unwrap();
        assert!(dir.path().join("logs").is_dir());
    }

    #[tokio::test]
    async fn test_start_stop_and_recover() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("startup"), "#!/bin/sh\n").unwrap();
        let sandbox = Arc::new(MockSandbox::new());
        let plugin = ProcessPlugin::new(sandbox.clone(), Duration::from_millis(50));
        let ctx = PluginContext {
            instance_id: "abc",
            directory: dir.path(),
            port: 61000,
            environment: &[],
            principal: None,
        };
        let mut handle = sandbox.create("abc", limits()).await.unwrap();
        let pid = plugin.start(&ctx, &mut handle).await.unwrap();
        assert_eq!(plugin.process_id(), Some(pid));

        // A fresh plugin reattaches through the pid file.
        let recovered = ProcessPlugin::new(sandbox.clone(), Duration::from_millis(50));
        assert!(recovered.recover_application(dir.path(), &handle, None).await.unwrap());
        assert_eq!(recovered.process_id(), Some(pid));

        plugin.stop(&handle).await.unwrap();
        assert!(plugin.process_id().is_none());
        assert!(!recovered.recover_application(dir.path(), &handle, Some(pid)).await.unwrap());

        plugin.cleanup(dir.path()).await.unwrap();
        assert!(!dir.path().join(PID_FILE).exists());
    }

    #[test]
    fn test_registry_by_runtime() {
        let registry = PluginRegistry::with_process_plugins(
            &["ruby19".to_string(), "node".to_string()],
            Arc::new(MockSandbox::new()),
            Duration::from_secs(1),
        );
        assert!(registry.supports("ruby19"));
        assert!(!registry.supports("cobol"));
        let env = registry.factory("ruby19").unwrap().runtime_environment();
        assert!(env.iter().any(|(k, v)| k == "RACK_ENV" && v == "production"));
        assert!(matches!(
            registry.factory("cobol"),
            Err(PluginError::UnsupportedRuntime(_))
        ));
    }
}
