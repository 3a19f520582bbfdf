//! In-process bus.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use super::{BusError, BusMessage, MessageBus, Subscription};

/// Delivers messages to local subscribers and records everything published.
pub struct LocalBus {
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<BusMessage>>>>,
    published: Mutex<Vec<BusMessage>>,
    lost: watch::Sender<bool>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LocalBus {
    pub fn new() -> Self {
        let (lost, _) = watch::channel(false);
        Self {
            subscribers: Mutex::new(HashMap::new()),
            published: Mutex::new(Vec::new()),
            lost,
        }
    }

    /// Deliver a message as if it came from another bus client.
    pub fn inject(&self, subject: &str, payload: Vec<u8>, reply_to: Option<&str>) {
        self.deliver(BusMessage {
            subject: subject.to_string(),
            payload,
            reply_to: reply_to.map(str::to_string),
        });
    }

    /// Everything published through this bus, oldest first.
    pub fn published(&self) -> Vec<BusMessage> {
        lock(&self.published).clone()
    }

    /// Messages published on `subject`.
    pub fn published_on(&self, subject: &str) -> Vec<BusMessage> {
        lock(&self.published)
            .iter()
            .filter(|m| m.subject == subject)
            .cloned()
            .collect()
    }

    pub fn clear_published(&self) {
        lock(&self.published).clear();
    }

    /// Simulate losing the transport.
    pub fn disconnect(&self) {
        self.lost.send_replace(true);
    }

    /// Restore the transport after [`Self::disconnect`].
    pub fn reconnect(&self) {
        self.lost.send_replace(false);
    }

    fn deliver(&self, message: BusMessage) {
        let mut subscribers = lock(&self.subscribers);
        if let Some(senders) = subscribers.get_mut(&message.subject) {
            senders.retain(|tx| tx.send(message.clone()).is_ok());
        }
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if *self.lost.borrow() {
            return Err(BusError::Disconnected);
        }
        let message = BusMessage {
            subject: subject.to_string(),
            payload,
            reply_to: None,
        };
        lock(&self.published).push(message.clone());
        self.deliver(message);
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers)
            .entry(subject.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(subject, rx))
    }

    fn connection_lost(&self) -> watch::Receiver<bool> {
        self.lost.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber_and_is_recorded() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("dea.stop").await.unwrap();
        bus.publish("dea.stop", b"{}".to_vec()).await.unwrap();
        bus.publish("dea.other", b"{}".to_vec()).await.unwrap();

        let message = sub.next().await.unwrap();
        assert_eq!(message.subject, "dea.stop");
        assert_eq!(bus.published().len(), 2);
        assert_eq!(bus.published_on("dea.stop").len(), 1);
    }

    #[tokio::test]
    async fn test_inject_carries_reply_subject() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("dea.status").await.unwrap();
        bus.inject("dea.status", b"{}".to_vec(), Some("_INBOX.1"));
        let message = sub.next().await.unwrap();
        assert_eq!(message.reply_to.as_deref(), Some("_INBOX.1"));
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_fails_publish_and_signals() {
        let bus = LocalBus::new();
        let mut lost = bus.connection_lost();
        bus.disconnect();
        lost.changed().await.unwrap();
        assert!(*lost.borrow());
        assert!(matches!(
            bus.publish("x", vec![]).await,
            Err(BusError::Disconnected)
        ));
    }
}
