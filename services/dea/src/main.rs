//! Droplet Execution Agent
//!
//! Runs application instances on this node on behalf of the cloud
//! controller.
//!
//! ## Signals
//!
//! - `SIGINT`/`SIGTERM`: stop every instance and exit
//! - `SIGUSR2`: evacuate, wait, then shut down
//!
//! Losing the message bus connection writes a final snapshot and exits
//! non-zero.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dea_agent::bus::{MessageBus, NatsBus};
use dea_agent::launcher::{
    DropletLauncher, DropletStager, HttpArtifactStore, PluginRegistry, PrincipalManager,
    ProcessGroupSandbox, Sandbox, SharedPrincipals, SystemPrincipals, TarGzExtractor,
};
use dea_agent::monitor::ProcProbe;
use dea_agent::{Agent, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        agent_id = %config.agent_id,
        nats_uri = %config.nats_uri,
        base_dir = %config.base_dir.display(),
        "Configuration loaded"
    );

    for dir in [config.droplets_dir(), config.apps_dir()] {
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let bus: Arc<dyn MessageBus> = NatsBus::connect(&config.nats_uri, &format!("dea-{}", config.agent_id))
        .await
        .context("failed to connect to message bus")?;

    // Create the launcher
    let sandbox: Arc<dyn Sandbox> = Arc::new(ProcessGroupSandbox::new());
    let principals: Arc<dyn PrincipalManager> = if config.secure {
        Arc::new(SystemPrincipals)
    } else {
        Arc::new(SharedPrincipals)
    };
    let stager = DropletStager::new(
        config.droplets_dir(),
        config.shared_dir.clone(),
        Arc::new(HttpArtifactStore::new(config.download_timeout)?),
    );
    let plugins = PluginRegistry::with_process_plugins(&config.runtimes, sandbox.clone(), config.stop_grace);
    let launcher = Arc::new(DropletLauncher::new(
        stager,
        Arc::new(TarGzExtractor),
        sandbox,
        principals,
        plugins,
    ));
    let probe = Arc::new(ProcProbe::new(config.apps_dir()));

    let evacuation_delay = config.evacuation_delay;
    let agent = Agent::new(config, bus.clone(), launcher, probe);
    agent.start().await?;

    let mut terminate = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut evacuate = signal(SignalKind::user_defined2()).context("failed to install SIGUSR2 handler")?;
    let mut lost = bus.connection_lost();

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = terminate.recv() => {
            info!("Received SIGTERM");
        }
        _ = evacuate.recv() => {
            info!(delay_secs = evacuation_delay.as_secs(), "Received evacuation signal");
            agent.evacuate().await;
            tokio::time::sleep(evacuation_delay).await;
        }
        _ = lost.wait_for(|lost| *lost) => {
            error!("Message bus connection lost");
            if let Err(e) = agent.snapshots().flush_now().await {
                error!(error = %e, "Failed to write final snapshot");
            }
            std::process::exit(1);
        }
    }

    agent.shutdown().await;
    info!("Agent shutdown complete");
    Ok(())
}
