//! The agent: owns the registry, capacity ledger, launcher and periodic
//! tasks, and dispatches bus messages to handlers.
//!
//! ## Locking
//!
//! - The registry lock is only held for short lookups and inserts;
//!   handlers work on copied `Arc<Instance>` lists.
//! - A record's write lock serializes every state transition of that
//!   instance. Capacity accounting runs while it is held.
//! - Periodic scans only try-lock records and skip busy ones.
//! - Launch and stop work run on spawned tasks, never inside a handler.

mod query;
mod routes;
mod start;
mod stop;
mod timers;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use dea_messages::{topics, Hello, InstanceState};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{publish_json, BusError, BusMessage, MessageBus};
use crate::config::Config;
use crate::health::HealthPoller;
use crate::instance::InstanceRegistry;
use crate::launcher::InstanceLauncher;
use crate::monitor::{Monitor, StatusSnapshot, UsageProbe};
use crate::reaper::Reaper;
use crate::resources::{get_cpu_count, ResourceMonitor};
use crate::snapshot::{SnapshotStore, SnapshotWriter};

/// Topics the agent subscribes to.
fn subscribed_topics(agent_id: &str) -> Vec<String> {
    vec![
        topics::dea_start(agent_id),
        topics::DEA_STOP.to_string(),
        topics::DEA_STATUS.to_string(),
        topics::DEA_DISCOVER.to_string(),
        topics::DEA_FIND_DROPLET.to_string(),
        topics::DEA_UPDATE.to_string(),
        topics::DROPLET_STATUS.to_string(),
        topics::ROUTER_START.to_string(),
        topics::HEALTHMANAGER_START.to_string(),
    ]
}

pub struct Agent {
    config: Config,
    bus: Arc<dyn MessageBus>,
    registry: Arc<InstanceRegistry>,
    resources: Arc<ResourceMonitor>,
    launcher: Arc<dyn InstanceLauncher>,
    health: HealthPoller,
    monitor: Monitor,
    reaper: Reaper,
    snapshots: Arc<SnapshotWriter>,
    cores: u32,
    start_topic: String,
    shutting_down: AtomicBool,
    evacuating: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Agent {
    pub fn new(
        config: Config,
        bus: Arc<dyn MessageBus>,
        launcher: Arc<dyn InstanceLauncher>,
        probe: Arc<dyn UsageProbe>,
    ) -> Arc<Self> {
        let registry = Arc::new(InstanceRegistry::new());
        let resources = Arc::new(ResourceMonitor::new(config.max_memory_mb, config.max_instances));
        let health = HealthPoller::new(config.readiness);
        let monitor = Monitor::new(
            registry.clone(),
            resources.clone(),
            launcher.clone(),
            probe,
            health,
            config.enforce_quotas,
        );
        let reaper = Reaper::new(
            registry.clone(),
            resources.clone(),
            launcher.clone(),
            config.crash_lifetime,
        );
        let snapshots = Arc::new(SnapshotWriter::new(
            SnapshotStore::new(config.snapshot_path()),
            registry.clone(),
            config.agent_id.clone(),
            config.snapshot_debounce,
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            start_topic: topics::dea_start(&config.agent_id),
            config,
            bus,
            registry,
            resources,
            launcher,
            health,
            monitor,
            reaper,
            snapshots,
            cores: get_cpu_count(),
            shutting_down: AtomicBool::new(false),
            evacuating: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn resources(&self) -> &Arc<ResourceMonitor> {
        &self.resources
    }

    pub fn snapshots(&self) -> &Arc<SnapshotWriter> {
        &self.snapshots
    }

    /// Agent-wide status maintained by the monitor cycle.
    pub fn status(&self) -> StatusSnapshot {
        self.monitor.status()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn is_evacuating(&self) -> bool {
        self.evacuating.load(Ordering::SeqCst)
    }

    /// Resolves once shutdown has completed.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    fn hello(&self) -> Hello {
        Hello {
            id: self.config.agent_id.clone(),
            ip: self.config.local_route.clone(),
            port: self.config.file_viewer_port,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    fn track_task(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Recover persisted instances, subscribe, announce and start timers.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!(
            agent_id = %self.config.agent_id,
            max_memory_mb = self.config.max_memory_mb,
            max_instances = self.config.max_instances,
            "Starting agent"
        );

        self.recover().await.context("failed to recover instances")?;

        for topic in subscribed_topics(&self.config.agent_id) {
            let mut subscription = self
                .bus
                .subscribe(&topic)
                .await
                .with_context(|| format!("failed to subscribe to {topic}"))?;
            let agent = Arc::clone(self);
            self.track_task(tokio::spawn(async move {
                while let Some(message) = subscription.next().await {
                    let agent = Arc::clone(&agent);
                    tokio::spawn(async move { agent.handle_message(message).await });
                }
                debug!(subject = %subscription.subject(), "Subscription closed");
            }));
        }

        publish_json(self.bus.as_ref(), topics::DEA_HELLO, &self.hello())
            .await
            .context("failed to announce agent")?;

        self.run_timers();
        info!(agent_id = %self.config.agent_id, "Agent started");
        Ok(())
    }

    /// Dispatch one bus message. Errors are logged, never returned.
    pub async fn handle_message(self: Arc<Self>, message: BusMessage) {
        let BusMessage {
            subject,
            payload,
            reply_to,
        } = message;
        let reply_to = reply_to.as_deref();

        let result = match subject.as_str() {
            s if s == self.start_topic => self.handle_start(&payload).await,
            topics::DEA_STOP => self.handle_stop(&payload).await,
            topics::DEA_STATUS => self.handle_status(reply_to).await,
            topics::DEA_DISCOVER => self.handle_discover(&payload, reply_to).await,
            topics::DEA_FIND_DROPLET => self.handle_find(&payload, reply_to).await,
            topics::DEA_UPDATE => self.handle_update(&payload).await,
            topics::DROPLET_STATUS => self.handle_droplet_status(reply_to).await,
            topics::ROUTER_START => self.handle_router_start().await,
            topics::HEALTHMANAGER_START => self.handle_healthmanager_start().await,
            other => {
                debug!(subject = %other, "Ignoring message on unexpected subject");
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(subject = %subject, error = %e, "Failed to handle message");
        }
    }

    async fn publish<T: Serialize + Sync>(&self, subject: &str, value: &T) -> Result<(), BusError> {
        publish_json(self.bus.as_ref(), subject, value).await
    }

    /// Publish a reply when the request carried a reply subject.
    async fn reply<T: Serialize + Sync>(&self, reply_to: Option<&str>, value: &T) -> Result<(), BusError> {
        match reply_to {
            Some(subject) => self.publish(subject, value).await,
            None => {
                debug!("Query without reply subject, dropping response");
                Ok(())
            }
        }
    }

    /// Replay the snapshot and reattach every recovered instance.
    async fn recover(self: &Arc<Self>) -> Result<()> {
        let store = self.snapshots.store().clone();
        let loaded = tokio::task::spawn_blocking(move || store.load())
            .await
            .context("snapshot load task failed")?;
        let snapshot = match loaded {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable snapshot");
                return Ok(());
            }
        };

        let recovered = self
            .registry
            .recover(snapshot.instances, &self.resources)
            .await;
        for instance in recovered {
            let mut record = instance.write().await;
            let alive = if record.is_live() {
                match self.launcher.recover(&mut record).await {
                    Ok(alive) => alive,
                    Err(e) => {
                        warn!(instance_id = %record.instance_id, error = %e, "Failed to reattach instance");
                        false
                    }
                }
            } else {
                false
            };
            record.orphaned = false;
            // The launch task did not survive the restart.
            record.launching = false;
            let state = record.state;
            drop(record);

            match (state, alive) {
                (InstanceState::Starting, true) => {
                    info!(instance_id = %instance.instance_id(), "Resuming readiness checks");
                    let agent = Arc::clone(self);
                    tokio::spawn(async move { agent.await_readiness(instance).await });
                }
                (InstanceState::Starting | InstanceState::Running, false) => {
                    warn!(instance_id = %instance.instance_id(), "Recovered instance is not running");
                    self.stop_instance(&instance, dea_messages::ExitReason::Crashed).await;
                }
                _ => {}
            }
        }
        self.snapshots.schedule();
        Ok(())
    }
}
