//! Message bus seam.
//!
//! The agent only needs publish, subscribe and a signal for a lost
//! connection. [`NatsBus`] speaks the NATS text protocol; [`LocalBus`] is an
//! in-process bus for tests and embedding.

mod local;
mod nats;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use dea_messages::MessageError;

pub use local::LocalBus;
pub use nats::NatsBus;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bus connection lost")]
    Disconnected,

    #[error("bus protocol error: {0}")]
    Protocol(String),

    #[error("invalid bus address: {0}")]
    InvalidAddress(String),

    #[error(transparent)]
    Message(#[from] MessageError),
}

/// One delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    pub reply_to: Option<String>,
}

/// Stream of messages for one subscribed subject.
#[derive(Debug)]
pub struct Subscription {
    subject: String,
    rx: mpsc::UnboundedReceiver<BusMessage>,
}

impl Subscription {
    pub(crate) fn new(subject: impl Into<String>, rx: mpsc::UnboundedReceiver<BusMessage>) -> Self {
        Self {
            subject: subject.into(),
            rx,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next message, or `None` once the bus has gone away.
    pub async fn next(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError>;

    /// Flips to `true` when the transport is gone for good.
    fn connection_lost(&self) -> watch::Receiver<bool>;
}

/// Serialize `value` as JSON and publish it.
pub async fn publish_json<T>(bus: &dyn MessageBus, subject: &str, value: &T) -> Result<(), BusError>
where
    T: Serialize + Sync,
{
    let payload = dea_messages::encode(value)?;
    bus.publish(subject, payload).await
}
