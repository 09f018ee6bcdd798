//! Realtime relay: the other end of the WebSocket transport.
//!
//! Architecture:
//! ```text
//! producer ── Publish ──┐
//!                       ▼
//! Client A ──┐      ┌────────┐      ┌── topic registry (subscribers, presence)
//!            ├──────│ relay  │──────┤
//! Client B ──┘      └────────┘      └── Fanout ──► every connection
//!                                                   (filters by its own
//!                                                    topics and bindings)
//! ```
//!
//! Per connection the relay keeps the topics it subscribed to, with their
//! delivery modes and CDC bindings. It:
//! - acks or refuses `Subscribe`, and drops the topic on `Unsubscribe`
//! - routes `Publish`ed row changes to every subscription whose binding
//!   matches the table and row filter
//! - fans `Broadcast` frames out to the topic's other subscribers
//! - tracks presence per topic: `Track` answers with a `PresenceState`
//!   snapshot and sends a `PresenceDiff` join to the others; leaving or
//!   disconnecting sends the leave
//! - answers `Ping` with `Pong`
//!
//! The relay keeps no history. Anything published while a client was away
//! is gone; clients resync from the persistence layer.

pub mod fanout;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::config::ConfigError;
use crate::normalize::{AFTER_FIELDS, BEFORE_FIELDS, TABLE_FIELD};
use crate::protocol::{
    MessageType, PresenceDiffPayload, PresenceMeta, PresenceStatePayload, ProtocolError,
    SubscribePayload, SyncMessage,
};
use fanout::{ConnectionId, Delivery, DeliveryPayload, Fanout, FrameMode, TopicRegistry};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Environment variable overriding [`ServerConfig::bind_addr`].
pub const ENV_BIND_ADDR: &str = "FLEET_RELAY_ADDR";
/// Environment variable overriding [`ServerConfig::broadcast_capacity`].
pub const ENV_CAPACITY: &str = "FLEET_RELAY_CAPACITY";

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum subscribers per topic
    pub max_subscribers_per_topic: usize,
    /// Fan-out buffer per connection
    pub broadcast_capacity: usize,
    /// Expected client ping interval in seconds (informational)
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_subscribers_per_topic: 1000,
            broadcast_capacity: 1024,
            heartbeat_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `FLEET_RELAY_ADDR` / `FLEET_RELAY_CAPACITY`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(addr) = lookup(ENV_BIND_ADDR) {
            config.bind_addr = addr;
        }
        if let Some(raw) = lookup(ENV_CAPACITY) {
            config.broadcast_capacity = raw
                .parse()
                .map_err(|_| ConfigError::invalid(ENV_CAPACITY, format!("`{raw}` is not a number")))?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::invalid(
                "bind_addr",
                format!("`{}` is not a socket address", self.bind_addr),
            ));
        }
        if self.broadcast_capacity == 0 {
            return Err(ConfigError::invalid("broadcast_capacity", "must be positive"));
        }
        if self.max_subscribers_per_topic == 0 {
            return Err(ConfigError::invalid(
                "max_subscribers_per_topic",
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_topics: usize,
    pub changes_published: u64,
    pub changes_delivered: u64,
    pub frames_fanned_out: u64,
}

struct Shared {
    config: ServerConfig,
    registry: TopicRegistry,
    fanout: Fanout,
    stats: RwLock<ServerStats>,
    changes_delivered: AtomicU64,
    next_connection: AtomicU64,
}

/// The relay server. Clones share one relay.
#[derive(Clone)]
pub struct RealtimeServer {
    shared: Arc<Shared>,
}

impl RealtimeServer {
    pub fn new(config: ServerConfig) -> Self {
        let shared = Shared {
            registry: TopicRegistry::new(config.max_subscribers_per_topic),
            fanout: Fanout::new(config.broadcast_capacity),
            stats: RwLock::new(ServerStats::default()),
            changes_delivered: AtomicU64::new(0),
            next_connection: AtomicU64::new(1),
            config,
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Accept connections until the listener fails. Call from an async
    /// runtime.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.shared.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = Connection::serve(shared, stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Publish a raw row change, as a producer connection would.
    pub fn publish(&self, raw: Value) -> usize {
        self.shared.fanout.publish_change(raw)
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.shared.stats.read().await.clone();
        let fanout = self.shared.fanout.stats();
        stats.active_topics = self.shared.registry.topic_count().await;
        stats.changes_published = fanout.changes_published;
        stats.frames_fanned_out = fanout.frames_sent;
        stats.changes_delivered = self.shared.changes_delivered.load(Ordering::Relaxed);
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }
}

/// One client connection's subscriptions.
struct Connection {
    id: ConnectionId,
    addr: SocketAddr,
    shared: Arc<Shared>,
    sender: WsSender,
    topics: HashMap<String, SubscribePayload>,
}

impl Connection {
    async fn serve(shared: Arc<Shared>, stream: TcpStream, addr: SocketAddr) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (sender, mut receiver) = ws_stream.split();
        let mut deliveries = shared.fanout.subscribe();
        let id = shared.next_connection.fetch_add(1, Ordering::Relaxed);
        log::info!("WebSocket connection {id} established from {addr}");

        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut conn = Connection {
            id,
            addr,
            shared,
            sender,
            topics: HashMap::new(),
        };

        let result = loop {
            tokio::select! {
                msg = receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        if let Err(e) = conn.handle_frame(&data).await {
                            break Err(e);
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = conn.sender.send(Message::Pong(data)).await {
                            break Err(e.into());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection {id} closed from {}", conn.addr);
                        break Ok(());
                    }
                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {}: {e}", conn.addr);
                        break Ok(());
                    }
                    Some(Ok(_)) => {}
                },
                delivery = deliveries.recv() => match delivery {
                    Ok(delivery) => {
                        if let Err(e) = conn.deliver(&delivery).await {
                            break Err(e);
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("Connection {id} lagged by {n} deliveries");
                    }
                    Err(RecvError::Closed) => break Ok(()),
                },
            }
        };

        conn.cleanup().await;
        result
    }

    async fn handle_frame(&mut self, data: &[u8]) -> Result<(), BoxError> {
        let msg = match SyncMessage::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Failed to decode frame from {}: {e}", self.addr);
                return Ok(());
            }
        };
        {
            let mut s = self.shared.stats.write().await;
            s.total_messages += 1;
            s.total_bytes += data.len() as u64;
        }

        match msg.msg_type {
            MessageType::Subscribe => self.subscribe(&msg).await?,
            MessageType::Unsubscribe => {
                if self.topics.remove(&msg.topic).is_some() {
                    let left = self.shared.registry.leave(&msg.topic, self.id).await;
                    self.announce_leave(&msg.topic, left)?;
                    log::debug!("Connection {} left {}", self.id, msg.topic);
                }
            }
            MessageType::Publish => match msg.raw_body() {
                Ok(raw) => {
                    let receivers = self.shared.fanout.publish_change(raw);
                    log::trace!("Change published to {receivers} connection(s)");
                }
                Err(e) => log::warn!("Dropping unparseable publish from {}: {e}", self.addr),
            },
            MessageType::Broadcast => {
                if self
                    .topics
                    .get(&msg.topic)
                    .is_some_and(|sub| sub.modes.broadcast)
                {
                    self.shared.fanout.send_frame(
                        &msg.topic,
                        FrameMode::Broadcast,
                        Some(self.id),
                        &msg,
                    )?;
                }
            }
            MessageType::Track => self.track(&msg).await?,
            MessageType::Untrack => {
                let left = self.shared.registry.untrack(&msg.topic, self.id).await;
                self.announce_leave(&msg.topic, left)?;
            }
            MessageType::Ping => self.send(&SyncMessage::pong()).await?,
            MessageType::Pong => {}
            other => log::debug!("Unhandled message type from {}: {other:?}", self.addr),
        }
        Ok(())
    }

    async fn subscribe(&mut self, msg: &SyncMessage) -> Result<(), BoxError> {
        let body = match msg.body::<SubscribePayload>() {
            Ok(body) => body,
            Err(e) => {
                let refusal = SyncMessage::subscribe_error(&msg.topic, msg.reference, e.to_string())?;
                return self.send(&refusal).await;
            }
        };
        if msg.topic.is_empty() {
            let refusal = SyncMessage::subscribe_error(&msg.topic, msg.reference, "empty topic")?;
            return self.send(&refusal).await;
        }
        if let Err(full) = self.shared.registry.join(&msg.topic, self.id).await {
            log::warn!("Refusing {} to connection {}: {full}", msg.topic, self.id);
            let refusal = SyncMessage::subscribe_error(&msg.topic, msg.reference, full.to_string())?;
            return self.send(&refusal).await;
        }

        let presence = body.modes.presence;
        self.topics.insert(msg.topic.clone(), body);
        self.send(&SyncMessage::subscribe_ack(&msg.topic, msg.reference))
            .await?;
        log::info!("Connection {} subscribed to {}", self.id, msg.topic);

        if presence {
            let body = PresenceStatePayload {
                presences: self.shared.registry.presences(&msg.topic).await,
            };
            self.send(&SyncMessage::presence_state(&msg.topic, &body)?)
                .await?;
        }
        Ok(())
    }

    async fn track(&mut self, msg: &SyncMessage) -> Result<(), BoxError> {
        if !self
            .topics
            .get(&msg.topic)
            .is_some_and(|sub| sub.modes.presence)
        {
            return Ok(());
        }
        let meta: PresenceMeta = match msg.body() {
            Ok(meta) => meta,
            Err(e) => {
                log::warn!("Dropping malformed track from {}: {e}", self.addr);
                return Ok(());
            }
        };
        let Some(presences) = self
            .shared
            .registry
            .track(&msg.topic, self.id, meta.clone())
            .await
        else {
            return Ok(());
        };
        log::info!("Presence: {} joined {}", meta.user_id, msg.topic);

        let state = PresenceStatePayload { presences };
        self.send(&SyncMessage::presence_state(&msg.topic, &state)?)
            .await?;
        let diff = PresenceDiffPayload {
            joins: vec![meta],
            leaves: Vec::new(),
        };
        self.shared.fanout.send_frame(
            &msg.topic,
            FrameMode::Presence,
            Some(self.id),
            &SyncMessage::presence_diff(&msg.topic, &diff)?,
        )?;
        Ok(())
    }

    fn announce_leave(&self, topic: &str, left: Option<PresenceMeta>) -> Result<(), ProtocolError> {
        let Some(meta) = left else {
            return Ok(());
        };
        log::info!("Presence: {} left {topic}", meta.user_id);
        let diff = PresenceDiffPayload {
            joins: Vec::new(),
            leaves: vec![meta],
        };
        self.shared.fanout.send_frame(
            topic,
            FrameMode::Presence,
            Some(self.id),
            &SyncMessage::presence_diff(topic, &diff)?,
        )?;
        Ok(())
    }

    async fn deliver(&mut self, delivery: &Delivery) -> Result<(), BoxError> {
        if delivery.origin == Some(self.id) {
            return Ok(());
        }
        match &delivery.payload {
            DeliveryPayload::Frame { topic, mode, bytes } => {
                let wanted = self
                    .topics
                    .get(topic)
                    .is_some_and(|sub| mode.enabled_in(sub.modes));
                if wanted {
                    self.sender
                        .send(Message::Binary(bytes.to_vec().into()))
                        .await?;
                }
            }
            DeliveryPayload::Change(raw) => {
                let topics = self.routes_for(raw);
                for topic in topics {
                    self.send(&SyncMessage::change(&topic, raw)?).await?;
                    self.shared.changes_delivered.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }

    /// Topics whose CDC bindings match a raw change. An update matches on
    /// either its new or its old row, so a row moving out of a filter is
    /// still seen by the subscriber it leaves.
    fn routes_for(&self, raw: &Value) -> Vec<String> {
        let Some(table) = raw.get(TABLE_FIELD).and_then(Value::as_str) else {
            log::debug!("Change without a table cannot be routed");
            return Vec::new();
        };
        let rows: Vec<&Value> = AFTER_FIELDS
            .iter()
            .chain(BEFORE_FIELDS)
            .filter_map(|field| raw.get(*field))
            .filter(|row| row.is_object())
            .collect();

        let mut topics: Vec<String> = self
            .topics
            .iter()
            .filter(|(_, sub)| sub.modes.cdc)
            .filter(|(_, sub)| {
                sub.bindings.iter().any(|binding| {
                    if rows.is_empty() {
                        binding.matches(table, None)
                    } else {
                        rows.iter().any(|row| binding.matches(table, Some(*row)))
                    }
                })
            })
            .map(|(topic, _)| topic.clone())
            .collect();
        topics.sort();
        topics
    }

    async fn send(&mut self, msg: &SyncMessage) -> Result<(), BoxError> {
        let encoded = msg.encode()?;
        self.sender.send(Message::Binary(encoded.into())).await?;
        Ok(())
    }

    async fn cleanup(&mut self) {
        let topics: Vec<String> = self.topics.drain().map(|(topic, _)| topic).collect();
        for topic in topics {
            let left = self.shared.registry.leave(&topic, self.id).await;
            if let Err(e) = self.announce_leave(&topic, left) {
                log::warn!("Could not announce leave on {topic}: {e}");
            }
        }
        let mut s = self.shared.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }
}
