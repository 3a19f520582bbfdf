//! Port readiness checks.

use std::time::Duration;

use dea_messages::InstanceState;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::config::ReadinessConfig;
use crate::instance::Instance;

/// Single connect-and-drop attempt against `host:port`.
pub async fn is_port_ready(host: &str, port: u16, connect_timeout: Duration) -> bool {
    if port == 0 {
        return false;
    }
    match timeout(connect_timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            debug!(host, port, error = %e, "port check failed: connection error");
            false
        }
        Err(_) => {
            debug!(host, port, "port check failed: timeout");
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Attempt budget exhausted.
    TimedOut,
    /// The instance left Starting while we were polling (stopped or crashed).
    Abandoned,
}

/// Startup readiness polling with a bounded attempt budget.
#[derive(Debug, Clone, Copy)]
pub struct HealthPoller {
    config: ReadinessConfig,
}

impl HealthPoller {
    pub fn new(config: ReadinessConfig) -> Self {
        Self { config }
    }

    pub async fn is_port_ready(&self, host: &str, port: u16) -> bool {
        is_port_ready(host, port, self.config.connect_timeout).await
    }

    /// Poll the instance's port until it accepts a connection.
    ///
    /// The record lock is only held long enough to read the target address.
    pub async fn wait_until_ready(&self, instance: &Instance) -> Readiness {
        for attempt in 0..self.config.attempts {
            let (state, host, port) = {
                let record = instance.read().await;
                (record.state, record.host.clone(), record.port)
            };
            if state != InstanceState::Starting {
                return Readiness::Abandoned;
            }
            if self.is_port_ready(&host, port).await {
                debug!(instance_id = %instance.instance_id(), attempts = attempt + 1, "Instance is accepting connections");
                return Readiness::Ready;
            }
            tokio::time::sleep(self.config.interval).await;
        }
        Readiness::TimedOut
    }
}
