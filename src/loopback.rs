//! In-process channel transport.
//!
//! [`LoopbackHub`] is a minimal pub/sub broker: every frame broadcast on a
//! topic is delivered to the topic's other live subscribers. It lets two
//! negotiators in one process talk to each other, for demos and tests.

use crate::transport::{ChannelEvent, ChannelTransport, SubscriptionStatus};
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, trace};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

const SUBSCRIPTION_BUFFER: usize = 64;

#[derive(Default)]
struct HubInner {
    /// Topic to `(connection id, sender)` of each live subscription.
    topics: Mutex<HashMap<String, Vec<(u64, mpsc::Sender<ChannelEvent>)>>>,
    next_connection: AtomicU64,
    injected_failures: Mutex<VecDeque<SubscriptionStatus>>,
}

#[derive(Clone, Default)]
pub struct LoopbackHub {
    inner: Arc<HubInner>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new client connection to the hub.
    pub fn connect(&self) -> Arc<LoopbackTransport> {
        let id = self.inner.next_connection.fetch_add(1, Ordering::Relaxed);
        Arc::new(LoopbackTransport {
            id,
            hub: self.inner.clone(),
        })
    }

    /// Makes the next subscription on any connection settle with `status`
    /// instead of succeeding.
    pub fn fail_next_subscribe(&self, status: SubscriptionStatus) {
        self.inner.injected_failures.lock().unwrap().push_back(status);
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .lock()
            .unwrap()
            .get(topic)
            .map_or(0, |subscribers| subscribers.len())
    }
}

/// One client connection to a [`LoopbackHub`].
pub struct LoopbackTransport {
    id: u64,
    hub: Arc<HubInner>,
}

impl LoopbackTransport {
    fn remove_subscription(&self, topic: &str) {
        let mut topics = self.hub.topics.lock().unwrap();
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.retain(|(id, _)| *id != self.id);
            if subscribers.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

#[async_trait]
impl ChannelTransport for LoopbackTransport {
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<ChannelEvent>, anyhow::Error> {
        self.remove_subscription(topic);
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);

        let injected = self.hub.injected_failures.lock().unwrap().pop_front();
        if let Some(status) = injected {
            debug!(target: "Call/Loopback", "Connection {} failing subscribe to {topic}: {status:?}", self.id);
            tx.try_send(ChannelEvent::Status(status))?;
            return Ok(rx);
        }

        tx.try_send(ChannelEvent::Status(SubscriptionStatus::Subscribed))?;
        self.hub
            .topics
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_default()
            .push((self.id, tx));
        debug!(target: "Call/Loopback", "Connection {} subscribed to {topic}", self.id);
        Ok(rx)
    }

    async fn broadcast(&self, topic: &str, frame: Bytes) -> Result<(), anyhow::Error> {
        let peers: Vec<_> = {
            let mut topics = self.hub.topics.lock().unwrap();
            let subscribers = topics
                .get_mut(topic)
                .filter(|subscribers| subscribers.iter().any(|(id, _)| *id == self.id))
                .ok_or_else(|| anyhow::anyhow!("connection {} is not subscribed to {topic}", self.id))?;
            subscribers.retain(|(_, tx)| !tx.is_closed());
            subscribers
                .iter()
                .filter(|(id, _)| *id != self.id)
                .map(|(_, tx)| tx.clone())
                .collect()
        };

        trace!(target: "Call/Loopback", "Fan-out of {} bytes on {topic} to {} subscribers", frame.len(), peers.len());
        for tx in peers {
            // A subscriber that went away mid-broadcast is not an error.
            let _ = tx.send(ChannelEvent::Message(frame.clone())).await;
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) {
        self.remove_subscription(topic);
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        if let Ok(mut topics) = self.hub.topics.lock() {
            for subscribers in topics.values_mut() {
                subscribers.retain(|(id, _)| *id != self.id);
            }
            topics.retain(|_, subscribers| !subscribers.is_empty());
        }
    }
}
