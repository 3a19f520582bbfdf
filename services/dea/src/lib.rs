//! Droplet Execution Agent Library
//!
//! The agent runs on each node and manages application instances. It takes
//! start and stop commands from the message bus, stages and launches droplets
//! in sandboxes, watches their health and usage, and reports back through
//! heartbeats and exit notifications.
//!
//! ## Architecture
//!
//! ```text
//! Agent
//! ├── InstanceRegistry   (instances by droplet, per-record locks)
//! ├── ResourceMonitor    (reserved memory and instance count)
//! ├── InstanceLauncher   (stage, unpack, sandbox, start)
//! ├── Monitor            (liveness, usage, quota enforcement)
//! ├── Reaper             (sandbox and directory cleanup)
//! └── SnapshotWriter     (debounced crash-recovery state)
//! ```
//!
//! ## Modules
//!
//! - `agent`: message handlers, stop protocol and timers
//! - `bus`: message bus trait, NATS client and in-process bus
//! - `launcher`: artifact staging, sandboxes, principals and plugins
//! - `snapshot`: atomic persistence of instance records

pub mod agent;
pub mod bus;
pub mod config;
pub mod health;
pub mod heartbeat;
pub mod instance;
pub mod launcher;
pub mod monitor;
pub mod reaper;
pub mod resources;
pub mod snapshot;

// Re-export commonly used types
pub use agent::Agent;
pub use config::Config;
pub use instance::{Instance, InstanceRecord, InstanceRegistry};
pub use resources::ResourceMonitor;
