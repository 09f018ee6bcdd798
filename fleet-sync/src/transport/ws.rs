//! WebSocket transport to the relay.
//!
//! Provides:
//! - Lazy connection: the socket is dialled when the first channel opens
//!   and again after it is lost
//! - Channel multiplexing by topic over one socket
//! - Subscribe acknowledgement with a join timeout
//! - Application heartbeat (`Ping` frames)
//!
//! ```text
//!  WsTransport ──TransportCommand──► connection task ──bincode frames──► relay
//!       ▲                                   │
//!       └──────── TransportEvent ◄──────────┘
//! ```
//!
//! A lost socket turns every open channel into `Error`; reopening them is
//! the reconnection controller's job, not this module's.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{HandleAllocator, Transport, TransportCommand, TransportEvent, TransportEventKind};
use crate::channel::{ChannelHandle, ChannelSpec, ChannelStatus};
use crate::config::SyncConfig;
use crate::protocol::{
    BroadcastPayload, ErrorPayload, MessageType, PresenceDiffPayload, PresenceMeta,
    PresenceStatePayload, ProtocolError, SubscribePayload, SyncMessage,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// Socket-level options.
#[derive(Debug, Clone, PartialEq)]
pub struct WsOptions {
    pub connect_timeout: Duration,
    /// How long a channel may stay `Connecting` before it is `TimedOut`.
    pub join_timeout: Duration,
    /// `Duration::ZERO` disables pings.
    pub heartbeat_interval: Duration,
    pub event_capacity: usize,
}

impl Default for WsOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            join_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(25),
            event_capacity: 1024,
        }
    }
}

impl From<&SyncConfig> for WsOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            join_timeout: Duration::from_millis(config.join_timeout_ms),
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            event_capacity: config.event_channel_capacity,
        }
    }
}

/// Front-end handed to the session. All calls enqueue a command for the
/// connection task and return immediately.
pub struct WsTransport {
    handles: HandleAllocator,
    commands: mpsc::UnboundedSender<TransportCommand>,
    event_rx: Option<mpsc::Receiver<TransportEvent>>,
}

impl WsTransport {
    /// Spawn the connection task. Must be called inside a tokio runtime.
    /// Nothing is dialled until the first channel opens.
    pub fn spawn(url: impl Into<String>, options: WsOptions) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(options.event_capacity.max(1));
        let connection = Connection::new(url.into(), options, event_tx);
        tokio::spawn(connection.run(command_rx));
        Self {
            handles: HandleAllocator::default(),
            commands,
            event_rx: Some(event_rx),
        }
    }

    fn enqueue(&self, command: TransportCommand) {
        if self.commands.send(command).is_err() {
            log::debug!("Connection task gone, command dropped");
        }
    }
}

impl Transport for WsTransport {
    fn open_channel(&mut self, spec: &ChannelSpec) -> ChannelHandle {
        let handle = self.handles.next();
        self.enqueue(TransportCommand::Open {
            handle,
            spec: spec.clone(),
        });
        handle
    }

    fn close_channel(&mut self, handle: ChannelHandle) {
        self.enqueue(TransportCommand::Close { handle });
    }

    fn send(&mut self, handle: ChannelHandle, event: &str, payload: Value) {
        self.enqueue(TransportCommand::Send {
            handle,
            event: event.to_string(),
            payload,
        });
    }

    fn track(&mut self, handle: ChannelHandle, meta: PresenceMeta) {
        self.enqueue(TransportCommand::Track { handle, meta });
    }

    fn take_event_rx(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.event_rx.take()
    }
}

struct OpenChannel {
    spec: ChannelSpec,
    status: ChannelStatus,
    joined_at: Instant,
}

/// State owned by the connection task.
struct Connection {
    url: String,
    options: WsOptions,
    events: mpsc::Sender<TransportEvent>,
    channels: HashMap<ChannelHandle, OpenChannel>,
    /// Topic to the handle currently holding it.
    topics: HashMap<String, ChannelHandle>,
    writer: Option<WsWriter>,
    reader: Option<WsReader>,
}

impl Connection {
    fn new(url: String, options: WsOptions, events: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            url,
            options,
            events,
            channels: HashMap::new(),
            topics: HashMap::new(),
            writer: None,
            reader: None,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<TransportCommand>) {
        let mut heartbeat = (!self.options.heartbeat_interval.is_zero()).then(|| {
            let mut interval = time::interval(self.options.heartbeat_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            let join_deadline = self.next_join_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                frame = next_frame(&mut self.reader), if self.reader.is_some() => match frame {
                    Some(Ok(Message::Binary(data))) => self.handle_frame(&data).await,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        self.socket_lost("relay closed the connection").await;
                    }
                    Some(Ok(_)) => {}
                },
                _ = tick(&mut heartbeat), if self.writer.is_some() => {
                    if self.write(&SyncMessage::ping()).await.is_err() {
                        self.socket_lost("heartbeat failed").await;
                    }
                },
                _ = sleep_until(join_deadline), if join_deadline.is_some() => {
                    self.expire_joins(Instant::now()).await;
                },
            }
        }

        if let Some(mut writer) = self.writer.take() {
            let _ = writer.close().await;
        }
        log::debug!("Connection task for {} stopped", self.url);
    }

    async fn handle_command(&mut self, command: TransportCommand) {
        match command {
            TransportCommand::Open { handle, spec } => self.open(handle, spec).await,
            TransportCommand::Close { handle } => {
                let Some(channel) = self.channels.remove(&handle) else {
                    return;
                };
                self.release_topic(&channel.spec, handle);
                if self.writer.is_some() {
                    let frame = SyncMessage::unsubscribe(channel.spec.name.as_str(), handle.0);
                    if self.write(&frame).await.is_err() {
                        self.socket_lost("write failed").await;
                    }
                }
            }
            TransportCommand::Send {
                handle,
                event,
                payload,
            } => {
                let Some(channel) = self.channels.get(&handle) else {
                    return;
                };
                if channel.status != ChannelStatus::Subscribed {
                    log::debug!("Broadcast `{event}` on {handle} dropped, channel not subscribed");
                    return;
                }
                match SyncMessage::broadcast(channel.spec.name.as_str(), &event, payload) {
                    Ok(frame) => self.write_or_drop(&frame).await,
                    Err(e) => log::warn!("Broadcast `{event}` not encodable: {e}"),
                }
            }
            TransportCommand::Track { handle, meta } => {
                let Some(channel) = self.channels.get(&handle) else {
                    return;
                };
                match SyncMessage::track(channel.spec.name.as_str(), &meta) {
                    Ok(frame) => self.write_or_drop(&frame).await,
                    Err(e) => log::warn!("Presence payload not encodable: {e}"),
                }
            }
        }
    }

    async fn open(&mut self, handle: ChannelHandle, spec: ChannelSpec) {
        self.emit(handle, TransportEventKind::Status(ChannelStatus::Connecting))
            .await;

        if self.writer.is_none() {
            if let Err(e) = self.connect().await {
                log::warn!("Cannot reach relay at {}: {e}", self.url);
                self.emit(handle, TransportEventKind::Status(ChannelStatus::Error))
                    .await;
                return;
            }
        }

        let body = SubscribePayload {
            modes: spec.modes,
            bindings: spec.bindings.clone(),
        };
        let frame = match SyncMessage::subscribe(spec.name.as_str(), handle.0, &body) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Subscribe for {} not encodable: {e}", spec.name);
                self.emit(handle, TransportEventKind::Status(ChannelStatus::Error))
                    .await;
                return;
            }
        };

        if let Some(previous) = self.topics.insert(spec.name.as_str().to_string(), handle) {
            // The relay keeps one subscription per topic and connection.
            self.channels.remove(&previous);
        }
        self.channels.insert(
            handle,
            OpenChannel {
                spec,
                status: ChannelStatus::Connecting,
                joined_at: Instant::now(),
            },
        );
        if self.write(&frame).await.is_err() {
            self.socket_lost("write failed").await;
        }
    }

    async fn connect(&mut self) -> Result<(), ProtocolError> {
        let attempt = tokio_tungstenite::connect_async(self.url.as_str());
        let (stream, _) = match time::timeout(self.options.connect_timeout, attempt).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(_)) => return Err(ProtocolError::ConnectionClosed),
            Err(_) => return Err(ProtocolError::Timeout),
        };
        let (writer, reader) = stream.split();
        self.writer = Some(writer);
        self.reader = Some(reader);
        log::info!("Connected to relay at {}", self.url);
        Ok(())
    }

    async fn handle_frame(&mut self, data: &[u8]) {
        let message = match SyncMessage::decode(data) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Undecodable frame from relay: {e}");
                return;
            }
        };

        match message.msg_type {
            MessageType::SubscribeAck => {
                let handle = ChannelHandle(message.reference);
                if let Some(channel) = self.channels.get_mut(&handle) {
                    if channel.status == ChannelStatus::Connecting {
                        channel.status = ChannelStatus::Subscribed;
                        self.emit(handle, TransportEventKind::Status(ChannelStatus::Subscribed))
                            .await;
                    }
                }
            }
            MessageType::SubscribeError => {
                let handle = ChannelHandle(message.reference);
                let reason = message
                    .body::<ErrorPayload>()
                    .map(|b| b.reason)
                    .unwrap_or_default();
                if let Some(channel) = self.channels.remove(&handle) {
                    log::warn!("Relay refused {}: {reason}", channel.spec.name);
                    self.release_topic(&channel.spec, handle);
                    self.emit(handle, TransportEventKind::Status(ChannelStatus::Error))
                        .await;
                }
            }
            MessageType::Change => {
                let Some(handle) = self.subscribed_handle(&message.topic) else {
                    return;
                };
                // The payload shape is the normalizer's business; a body
                // that is not even JSON still reaches it (as null) so the
                // collection gets invalidated.
                let raw = message.raw_body().unwrap_or(Value::Null);
                self.emit(handle, TransportEventKind::Change(raw)).await;
            }
            MessageType::Broadcast => {
                let Some(handle) = self.subscribed_handle(&message.topic) else {
                    return;
                };
                match message.body::<BroadcastPayload>() {
                    Ok(body) => {
                        self.emit(
                            handle,
                            TransportEventKind::Broadcast {
                                event: body.event,
                                payload: body.payload,
                            },
                        )
                        .await
                    }
                    Err(e) => log::debug!("Dropping malformed broadcast: {e}"),
                }
            }
            MessageType::PresenceState => {
                let Some(handle) = self.subscribed_handle(&message.topic) else {
                    return;
                };
                match message.body::<PresenceStatePayload>() {
                    Ok(body) => {
                        self.emit(handle, TransportEventKind::PresenceSync(body.presences))
                            .await
                    }
                    Err(e) => log::warn!("Dropping malformed presence state: {e}"),
                }
            }
            MessageType::PresenceDiff => {
                let Some(handle) = self.subscribed_handle(&message.topic) else {
                    return;
                };
                match message.body::<PresenceDiffPayload>() {
                    Ok(body) => {
                        self.emit(
                            handle,
                            TransportEventKind::PresenceDiff {
                                joins: body.joins,
                                leaves: body.leaves,
                            },
                        )
                        .await
                    }
                    Err(e) => log::warn!("Dropping malformed presence diff: {e}"),
                }
            }
            MessageType::Ping => self.write_or_drop(&SyncMessage::pong()).await,
            MessageType::Pong => log::trace!("Pong from relay"),
            other => log::debug!("Ignoring unexpected {other:?} from relay"),
        }
    }

    fn subscribed_handle(&self, topic: &str) -> Option<ChannelHandle> {
        let handle = *self.topics.get(topic)?;
        let channel = self.channels.get(&handle)?;
        (channel.status == ChannelStatus::Subscribed).then_some(handle)
    }

    fn release_topic(&mut self, spec: &ChannelSpec, handle: ChannelHandle) {
        if self.topics.get(spec.name.as_str()) == Some(&handle) {
            self.topics.remove(spec.name.as_str());
        }
    }

    fn next_join_deadline(&self) -> Option<Instant> {
        self.channels
            .values()
            .filter(|c| c.status == ChannelStatus::Connecting)
            .map(|c| c.joined_at + self.options.join_timeout)
            .min()
    }

    async fn expire_joins(&mut self, now: Instant) {
        let expired: Vec<ChannelHandle> = self
            .channels
            .iter()
            .filter(|(_, c)| {
                c.status == ChannelStatus::Connecting
                    && now >= c.joined_at + self.options.join_timeout
            })
            .map(|(handle, _)| *handle)
            .collect();

        for handle in expired {
            if let Some(channel) = self.channels.remove(&handle) {
                log::warn!("Join of {} timed out", channel.spec.name);
                self.release_topic(&channel.spec, handle);
                if self.writer.is_some() {
                    let frame = SyncMessage::unsubscribe(channel.spec.name.as_str(), handle.0);
                    self.write_or_drop(&frame).await;
                }
                self.emit(handle, TransportEventKind::Status(ChannelStatus::TimedOut))
                    .await;
            }
        }
    }

    async fn socket_lost(&mut self, reason: &str) {
        self.writer = None;
        self.reader = None;
        self.topics.clear();
        let failed: Vec<ChannelHandle> = self.channels.drain().map(|(handle, _)| handle).collect();
        log::warn!(
            "Lost relay connection ({reason}), failing {} channel(s)",
            failed.len()
        );
        for handle in failed {
            self.emit(handle, TransportEventKind::Status(ChannelStatus::Error))
                .await;
        }
    }

    async fn write(&mut self, message: &SyncMessage) -> Result<(), ProtocolError> {
        let encoded = message.encode()?;
        let writer = self.writer.as_mut().ok_or(ProtocolError::ConnectionClosed)?;
        writer
            .send(Message::Binary(encoded.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    async fn write_or_drop(&mut self, message: &SyncMessage) {
        if self.writer.is_none() {
            return;
        }
        if self.write(message).await.is_err() {
            self.socket_lost("write failed").await;
        }
    }

    async fn emit(&self, handle: ChannelHandle, kind: TransportEventKind) {
        if self.events.send(TransportEvent::new(handle, kind)).await.is_err() {
            log::trace!("Event receiver gone");
        }
    }
}

async fn next_frame(
    reader: &mut Option<WsReader>,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
    match reader {
        Some(reader) => reader.next().await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::DeliveryModes;

    #[test]
    fn test_options_from_config() {
        let config = SyncConfig::new("u1")
            .with_join_timeout_ms(2_000)
            .with_heartbeat_interval_ms(0);
        let options = WsOptions::from(&config);
        assert_eq!(options.join_timeout, Duration::from_secs(2));
        assert!(options.heartbeat_interval.is_zero());
        assert_eq!(options.event_capacity, 1024);
    }

    #[tokio::test]
    async fn test_take_event_rx_once() {
        let mut transport = WsTransport::spawn("ws://127.0.0.1:9", WsOptions::default());
        assert!(transport.take_event_rx().is_some());
        assert!(transport.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_relay_fails_channel() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let options = WsOptions {
            connect_timeout: Duration::from_secs(2),
            ..WsOptions::default()
        };
        let mut transport = WsTransport::spawn(format!("ws://127.0.0.1:{port}"), options);
        let mut rx = transport.take_event_rx().unwrap();

        let handle = transport.open_channel(&ChannelSpec::new("room:a", DeliveryModes::ALL));
        assert_eq!(
            rx.recv().await.unwrap(),
            TransportEvent::status(handle, ChannelStatus::Connecting)
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            TransportEvent::status(handle, ChannelStatus::Error)
        );
    }

    #[tokio::test]
    async fn test_handles_are_unique() {
        let mut transport = WsTransport::spawn("ws://127.0.0.1:9", WsOptions::default());
        let spec = ChannelSpec::new("room:a", DeliveryModes::ALL);
        let a = transport.open_channel(&spec);
        let b = transport.open_channel(&spec);
        assert!(b > a);
    }
}
