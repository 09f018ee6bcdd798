//! Relay fan-out and per-topic bookkeeping.
//!
//! Uses one tokio broadcast channel for the whole relay: O(1) send, and
//! every connection gets an independent receiver that buffers up to
//! `capacity` deliveries. Each connection filters what it receives
//! against its own subscriptions (topic membership for broadcast and
//! presence frames, table + row filter for CDC changes).
//!
//! ```text
//!  Publish ──► Fanout::publish_change ──┐
//!  Broadcast / presence ──► Fanout::send_frame ──┤
//!                                       ▼
//!                           broadcast::Sender<Arc<Delivery>>
//!                          ┌────────────┼────────────┐
//!                          ▼            ▼            ▼
//!                       conn 1       conn 2       conn 3   (filter, encode, send)
//! ```

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

use crate::channel::DeliveryModes;
use crate::protocol::{PresenceMeta, ProtocolError, SyncMessage};

/// Relay-local connection id.
pub type ConnectionId = u64;

/// What a delivery carries.
#[derive(Debug, Clone)]
pub enum DeliveryPayload {
    /// A pre-encoded frame for one topic.
    Frame {
        topic: String,
        /// Delivery mode a subscriber needs to receive it.
        mode: FrameMode,
        bytes: Arc<Vec<u8>>,
    },
    /// A raw row change; each connection routes it by its own bindings.
    Change(Arc<Value>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    Broadcast,
    Presence,
}

impl FrameMode {
    pub fn enabled_in(self, modes: DeliveryModes) -> bool {
        match self {
            Self::Broadcast => modes.broadcast,
            Self::Presence => modes.presence,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Delivery {
    /// Sender to skip; `None` reaches everyone.
    pub origin: Option<ConnectionId>,
    pub payload: DeliveryPayload,
}

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutStats {
    pub changes_published: u64,
    pub frames_sent: u64,
    pub receivers: usize,
}

/// Relay-wide fan-out channel. Stats are atomics, so sending never locks.
pub struct Fanout {
    sender: broadcast::Sender<Arc<Delivery>>,
    capacity: usize,
    changes_published: AtomicU64,
    frames_sent: AtomicU64,
}

impl Fanout {
    /// `capacity` is how many deliveries a lagging connection may fall
    /// behind before it starts losing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            changes_published: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Delivery>> {
        self.sender.subscribe()
    }

    /// Returns the number of connections that will see the change.
    pub fn publish_change(&self, raw: Value) -> usize {
        self.changes_published.fetch_add(1, Ordering::Relaxed);
        let delivery = Delivery {
            origin: None,
            payload: DeliveryPayload::Change(Arc::new(raw)),
        };
        self.sender.send(Arc::new(delivery)).unwrap_or(0)
    }

    /// Encode once and fan out to every subscriber of `topic` except
    /// `origin`.
    pub fn send_frame(
        &self,
        topic: &str,
        mode: FrameMode,
        origin: Option<ConnectionId>,
        msg: &SyncMessage,
    ) -> Result<usize, ProtocolError> {
        let bytes = Arc::new(msg.encode()?);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        let delivery = Delivery {
            origin,
            payload: DeliveryPayload::Frame {
                topic: topic.to_string(),
                mode,
                bytes,
            },
        };
        Ok(self.sender.send(Arc::new(delivery)).unwrap_or(0))
    }

    pub fn stats(&self) -> FanoutStats {
        FanoutStats {
            changes_published: self.changes_published.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            receivers: self.sender.receiver_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("topic {topic} is full ({max} subscribers)")]
pub struct TopicFull {
    pub topic: String,
    pub max: usize,
}

#[derive(Debug, Default)]
struct TopicState {
    subscribers: HashSet<ConnectionId>,
    presences: HashMap<ConnectionId, PresenceMeta>,
}

/// Subscribers and tracked presences per topic. Empty topics are dropped.
pub struct TopicRegistry {
    topics: RwLock<HashMap<String, TopicState>>,
    max_subscribers: usize,
}

impl TopicRegistry {
    pub fn new(max_subscribers: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            max_subscribers,
        }
    }

    pub async fn join(&self, topic: &str, conn: ConnectionId) -> Result<(), TopicFull> {
        let mut topics = self.topics.write().await;
        let state = topics.entry(topic.to_string()).or_default();
        if !state.subscribers.contains(&conn) && state.subscribers.len() >= self.max_subscribers {
            if state.subscribers.is_empty() {
                topics.remove(topic);
            }
            return Err(TopicFull {
                topic: topic.to_string(),
                max: self.max_subscribers,
            });
        }
        state.subscribers.insert(conn);
        Ok(())
    }

    /// Remove a subscriber. Returns its presence if it had tracked one.
    pub async fn leave(&self, topic: &str, conn: ConnectionId) -> Option<PresenceMeta> {
        let mut topics = self.topics.write().await;
        let state = topics.get_mut(topic)?;
        state.subscribers.remove(&conn);
        let presence = state.presences.remove(&conn);
        if state.subscribers.is_empty() {
            topics.remove(topic);
        }
        presence
    }

    /// Record a subscriber's presence and return the topic's full snapshot.
    pub async fn track(
        &self,
        topic: &str,
        conn: ConnectionId,
        meta: PresenceMeta,
    ) -> Option<Vec<PresenceMeta>> {
        let mut topics = self.topics.write().await;
        let state = topics.get_mut(topic)?;
        if !state.subscribers.contains(&conn) {
            return None;
        }
        state.presences.insert(conn, meta);
        Some(snapshot(state))
    }

    pub async fn untrack(&self, topic: &str, conn: ConnectionId) -> Option<PresenceMeta> {
        let mut topics = self.topics.write().await;
        topics.get_mut(topic)?.presences.remove(&conn)
    }

    pub async fn presences(&self, topic: &str) -> Vec<PresenceMeta> {
        self.topics
            .read()
            .await
            .get(topic)
            .map(snapshot)
            .unwrap_or_default()
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map_or(0, |s| s.subscribers.len())
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }
}

fn snapshot(state: &TopicState) -> Vec<PresenceMeta> {
    let mut presences: Vec<PresenceMeta> = state.presences.values().cloned().collect();
    presences.sort_by(|a, b| a.user_id.cmp(&b.user_id));
    presences
}
