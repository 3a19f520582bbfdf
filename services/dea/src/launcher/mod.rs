//! Instance launching.
//!
//! [`DropletLauncher`] does the blocking work of getting one instance from a
//! start request to a running process: stage the droplet, unpack it, create
//! an OS principal and sandbox, build the environment and start the process.
//! It never touches the registry; handles it creates are reported through
//! [`LaunchHandles`] so a failed launch can still be cleaned up.

mod archive;
mod artifact;
mod env;
mod fake;
mod plugin;
mod principal;
mod sandbox;

use std::io;
use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::instance::InstanceRecord;

pub use archive::{ArchiveExtractor, TarGzExtractor};
pub use artifact::{
    sha1_file, ArtifactError, ArtifactStore, DropletStager, HttpArtifactStore, StageSource,
    StagedDroplet,
};
pub use env::build_environment;
pub use fake::FakeLauncher;
pub use plugin::{
    ExecutionPlugin, PluginContext, PluginError, PluginFactory, PluginRegistry, ProcessPlugin,
    ProcessPluginFactory,
};
pub use principal::{
    generate_credential, Credential, Principal, PrincipalManager, SharedPrincipals,
    SystemPrincipals,
};
pub use sandbox::{
    parse_proc_stat, read_proc_stats, MockSandbox, ProcStat, ProcessGroupSandbox, Sandbox,
    SandboxCommand, SandboxError, SandboxHandle, SandboxLimits, StopSignal,
};

/// Launch failures, each with a stable reason code for logs.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("artifact_unavailable: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("extract_failed: {0}")]
    Extract(#[source] io::Error),

    #[error("sandbox_failed: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("plugin_failed: {0}")]
    Plugin(#[from] PluginError),

    #[error("port_allocation_failed: {0}")]
    Port(#[source] io::Error),

    #[error("unsupported_runtime: {0}")]
    UnsupportedRuntime(String),

    #[error("task_failed: {0}")]
    Task(String),
}

impl LaunchError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            LaunchError::Artifact(ArtifactError::HashMismatch { .. }) => "hash_mismatch",
            LaunchError::Artifact(_) => "artifact_unavailable",
            LaunchError::Extract(_) => "extract_failed",
            LaunchError::Sandbox(_) => "sandbox_failed",
            LaunchError::Plugin(_) => "plugin_failed",
            LaunchError::Port(_) => "port_allocation_failed",
            LaunchError::UnsupportedRuntime(_) => "unsupported_runtime",
            LaunchError::Task(_) => "task_failed",
        }
    }
}

/// Resources created during a launch, filled in step by step.
#[derive(Debug, Default)]
pub struct LaunchHandles {
    pub port: Option<u16>,
    pub debug_port: Option<u16>,
    pub process_id: Option<u32>,
    pub sandbox: Option<SandboxHandle>,
    pub principal: Option<Principal>,
    pub plugin: Option<Arc<dyn ExecutionPlugin>>,
}

impl LaunchHandles {
    /// Copy whatever was created onto the record.
    pub fn apply_to(self, record: &mut InstanceRecord) {
        if let Some(port) = self.port {
            record.port = port;
        }
        if let Some(debug_port) = self.debug_port {
            record.debug_port = Some(debug_port);
            record.debug_ip = Some(record.host.clone());
        }
        if self.process_id.is_some() {
            record.process_id = self.process_id;
        }
        if self.sandbox.is_some() {
            record.sandbox = self.sandbox;
        }
        if self.principal.is_some() {
            record.principal = self.principal;
        }
        if self.plugin.is_some() {
            record.plugin = self.plugin;
        }
    }
}

#[async_trait]
pub trait InstanceLauncher: Send + Sync {
    fn supports_runtime(&self, runtime: &str) -> bool;

    /// Bring `record` up. Runs outside every registry and record lock.
    async fn launch(&self, record: &InstanceRecord, handles: &mut LaunchHandles) -> Result<(), LaunchError>;

    /// Gracefully stop the instance's process.
    async fn stop_process(&self, record: &InstanceRecord) -> Result<(), LaunchError>;

    /// Release the sandbox and principal and clear the record's handles.
    async fn release_sandbox(&self, record: &mut InstanceRecord) -> Result<(), LaunchError>;

    /// Whether any process is still alive in the instance's sandbox.
    fn process_alive(&self, record: &InstanceRecord) -> bool;

    /// Reattach a recovered record. Returns whether its process survived.
    async fn recover(&self, record: &mut InstanceRecord) -> Result<bool, LaunchError>;
}

/// Ask the OS for a free TCP port.
pub fn allocate_port() -> io::Result<u16> {
    let listener = TcpListener::bind(("0.0.0.0", 0))?;
    Ok(listener.local_addr()?.port())
}

/// Production launcher.
pub struct DropletLauncher {
    stager: DropletStager,
    extractor: Arc<dyn ArchiveExtractor>,
    sandbox: Arc<dyn Sandbox>,
    principals: Arc<dyn PrincipalManager>,
    plugins: PluginRegistry,
}

impl DropletLauncher {
    pub fn new(
        stager: DropletStager,
        extractor: Arc<dyn ArchiveExtractor>,
        sandbox: Arc<dyn Sandbox>,
        principals: Arc<dyn PrincipalManager>,
        plugins: PluginRegistry,
    ) -> Self {
        Self {
            stager,
            extractor,
            sandbox,
            principals,
            plugins,
        }
    }
}

fn sandbox_limits(record: &InstanceRecord) -> SandboxLimits {
    SandboxLimits {
        // Address-space limits are coarse; leave headroom over the RSS quota.
        memory_bytes: record.mem_quota_bytes.saturating_mul(2),
        nofile: record.fds_quota,
        nproc: 512,
    }
}

#[async_trait]
impl InstanceLauncher for DropletLauncher {
    fn supports_runtime(&self, runtime: &str) -> bool {
        self.plugins.supports(runtime)
    }

    async fn launch(&self, record: &InstanceRecord, handles: &mut LaunchHandles) -> Result<(), LaunchError> {
        let instance_id = record.instance_id.as_str();
        let factory = self
            .plugins
            .factory(&record.runtime)
            .map_err(|_| LaunchError::UnsupportedRuntime(record.runtime.clone()))?;

        // 1. Stage
        let staged = self
            .stager
            .stage(&record.sha1, &record.executable_file, &record.executable_uri)
            .await?;
        debug!(instance_id = %instance_id, source = ?staged.source, "Droplet ready");

        // 2. Unpack
        let extractor = self.extractor.clone();
        let archive = staged.path.clone();
        let directory = record.directory.clone();
        tokio::task::spawn_blocking(move || extractor.extract(&archive, &directory))
            .await
            .map_err(|e| LaunchError::Task(e.to_string()))?
            .map_err(LaunchError::Extract)?;

        // 3. Ports
        let port = allocate_port().map_err(LaunchError::Port)?;
        handles.port = Some(port);
        if record.debug_mode.is_some() {
            handles.debug_port = Some(allocate_port().map_err(LaunchError::Port)?);
        }

        // 4. Principal and directory ownership
        let principal = self.principals.create(instance_id).await?;
        handles.principal = Some(principal.clone());
        self.principals
            .secure_directory(&principal, &record.directory)
            .await?;

        // 5. Environment
        let mut placed = record.clone();
        placed.port = port;
        placed.debug_port = handles.debug_port;
        if placed.debug_port.is_some() {
            placed.debug_ip = Some(placed.host.clone());
        }
        let environment = build_environment(&placed, &factory.runtime_environment());

        // 6. Sandbox and process
        let sandbox = handles
            .sandbox
            .insert(self.sandbox.create(instance_id, sandbox_limits(record)).await?);
        let plugin = factory.create();
        handles.plugin = Some(plugin.clone());
        let ctx = PluginContext {
            instance_id,
            directory: &record.directory,
            port,
            environment: &environment,
            principal: Some(&principal),
        };
        plugin.configure(&ctx).await?;
        let pid = plugin.start(&ctx, sandbox).await?;
        handles.process_id = Some(pid);

        info!(
            instance_id = %instance_id,
            droplet_id = record.droplet_id,
            pid = pid,
            port = port,
            "Instance launched"
        );
        Ok(())
    }

    async fn stop_process(&self, record: &InstanceRecord) -> Result<(), LaunchError> {
        let (Some(plugin), Some(sandbox)) = (&record.plugin, &record.sandbox) else {
            if let Some(sandbox) = &record.sandbox {
                self.sandbox.signal(sandbox, StopSignal::Kill)?;
            }
            return Ok(());
        };
        plugin.stop(sandbox).await?;
        Ok(())
    }

    async fn release_sandbox(&self, record: &mut InstanceRecord) -> Result<(), LaunchError> {
        if let Some(plugin) = record.plugin.take() {
            if let Err(e) = plugin.cleanup(&record.directory).await {
                warn!(instance_id = %record.instance_id, error = %e, "Plugin cleanup failed");
            }
        }
        if let Some(sandbox) = record.sandbox.take() {
            if let Err(e) = self.sandbox.destroy(&sandbox).await {
                record.sandbox = Some(sandbox);
                return Err(e.into());
            }
        }
        if let Some(principal) = record.principal.take() {
            if let Err(e) = self.principals.delete(&principal).await {
                record.principal = Some(principal);
                return Err(e.into());
            }
        }
        record.process_id = None;
        debug!(instance_id = %record.instance_id, "Released sandbox");
        Ok(())
    }

    fn process_alive(&self, record: &InstanceRecord) -> bool {
        record
            .sandbox
            .as_ref()
            .is_some_and(|sandbox| !self.sandbox.processes(sandbox).is_empty())
    }

    async fn recover(&self, record: &mut InstanceRecord) -> Result<bool, LaunchError> {
        let Some(sandbox) = record.sandbox.clone() else {
            return Ok(false);
        };
        let factory = self.plugins.factory(&record.runtime)?;
        let plugin = factory.create();
        let alive = plugin
            .recover_application(&record.directory, &sandbox, record.process_id)
            .await?;
        if alive {
            record.process_id = plugin.process_id();
        }
        record.plugin = Some(plugin);
        Ok(alive)
    }
}

/// Remove an instance directory, treating missing or inaccessible as done.
pub async fn remove_directory(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            warn!(path = %path.display(), error = %e, "Instance directory not removable, abandoning it");
            Ok(true)
        }
        Err(e) => Err(e),
    }
}
