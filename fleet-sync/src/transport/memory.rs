//! In-process transport.
//!
//! [`MemoryTransport`] records every command instead of talking to a relay,
//! and a paired [`MemoryRemote`] plays the relay's part: it inspects what
//! was opened and injects acks, failures, CDC payloads, broadcasts and
//! presence into the event stream. Used for embedding and for driving the
//! engine deterministically in tests.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use super::{HandleAllocator, Transport, TransportCommand, TransportEvent, TransportEventKind};
use crate::channel::{ChannelHandle, ChannelSpec, ChannelStatus};
use crate::protocol::PresenceMeta;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct Shared {
    commands: Vec<TransportCommand>,
    open: BTreeMap<ChannelHandle, ChannelSpec>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MemoryTransport {
    handles: HandleAllocator,
    shared: Arc<Mutex<Shared>>,
    events: mpsc::Sender<TransportEvent>,
    event_rx: Option<mpsc::Receiver<TransportEvent>>,
    auto_ack: bool,
}

impl MemoryTransport {
    /// Transport whose channels are acknowledged as soon as they are
    /// opened.
    pub fn new() -> (Self, MemoryRemote) {
        Self::build(true, DEFAULT_CAPACITY)
    }

    /// Transport that leaves every channel `Connecting` until the remote
    /// acks or fails it.
    pub fn manual() -> (Self, MemoryRemote) {
        Self::build(false, DEFAULT_CAPACITY)
    }

    fn build(auto_ack: bool, capacity: usize) -> (Self, MemoryRemote) {
        let (events, event_rx) = mpsc::channel(capacity);
        let shared = Arc::new(Mutex::new(Shared::default()));
        let remote = MemoryRemote {
            shared: shared.clone(),
            events: events.clone(),
        };
        let transport = Self {
            handles: HandleAllocator::default(),
            shared,
            events,
            event_rx: Some(event_rx),
            auto_ack,
        };
        (transport, remote)
    }

    fn emit(&self, event: TransportEvent) {
        if let Err(e) = self.events.try_send(event) {
            log::warn!("Memory transport dropped event: {e}");
        }
    }
}

impl Transport for MemoryTransport {
    fn open_channel(&mut self, spec: &ChannelSpec) -> ChannelHandle {
        let handle = self.handles.next();
        {
            let mut shared = lock(&self.shared);
            shared.commands.push(TransportCommand::Open {
                handle,
                spec: spec.clone(),
            });
            shared.open.insert(handle, spec.clone());
        }
        self.emit(TransportEvent::status(handle, ChannelStatus::Connecting));
        if self.auto_ack {
            self.emit(TransportEvent::status(handle, ChannelStatus::Subscribed));
        }
        handle
    }

    fn close_channel(&mut self, handle: ChannelHandle) {
        let mut shared = lock(&self.shared);
        shared.commands.push(TransportCommand::Close { handle });
        shared.open.remove(&handle);
    }

    fn send(&mut self, handle: ChannelHandle, event: &str, payload: Value) {
        lock(&self.shared).commands.push(TransportCommand::Send {
            handle,
            event: event.to_string(),
            payload,
        });
    }

    fn track(&mut self, handle: ChannelHandle, meta: PresenceMeta) {
        lock(&self.shared)
            .commands
            .push(TransportCommand::Track { handle, meta });
    }

    fn take_event_rx(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.event_rx.take()
    }
}

/// The relay side of a [`MemoryTransport`].
#[derive(Clone)]
pub struct MemoryRemote {
    shared: Arc<Mutex<Shared>>,
    events: mpsc::Sender<TransportEvent>,
}

impl MemoryRemote {
    /// Every command issued so far, in order.
    pub fn commands(&self) -> Vec<TransportCommand> {
        lock(&self.shared).commands.clone()
    }

    /// Forget the command log (open channels are kept).
    pub fn clear_commands(&self) {
        lock(&self.shared).commands.clear();
    }

    /// Currently open channels by handle.
    pub fn open_channels(&self) -> BTreeMap<ChannelHandle, ChannelSpec> {
        lock(&self.shared).open.clone()
    }

    /// Newest open handle for a channel name.
    pub fn handle_for(&self, name: &str) -> Option<ChannelHandle> {
        lock(&self.shared)
            .open
            .iter()
            .rev()
            .find(|(_, spec)| spec.name.as_str() == name)
            .map(|(handle, _)| *handle)
    }

    /// How many times a channel was opened.
    pub fn open_count(&self, name: &str) -> usize {
        lock(&self.shared)
            .commands
            .iter()
            .filter(|cmd| matches!(cmd, TransportCommand::Open { spec, .. } if spec.name.as_str() == name))
            .count()
    }

    pub fn is_open(&self, handle: ChannelHandle) -> bool {
        lock(&self.shared).open.contains_key(&handle)
    }

    /// Inject an event. Returns `false` if the stream is full or gone.
    pub fn push(&self, handle: ChannelHandle, kind: TransportEventKind) -> bool {
        self.events.try_send(TransportEvent::new(handle, kind)).is_ok()
    }

    pub fn ack(&self, handle: ChannelHandle) -> bool {
        self.push(handle, TransportEventKind::Status(ChannelStatus::Subscribed))
    }

    /// Fail a channel the way a dropped socket would.
    pub fn fail(&self, handle: ChannelHandle, status: ChannelStatus) -> bool {
        lock(&self.shared).open.remove(&handle);
        self.push(handle, TransportEventKind::Status(status))
    }

    pub fn change(&self, handle: ChannelHandle, raw: Value) -> bool {
        self.push(handle, TransportEventKind::Change(raw))
    }

    pub fn broadcast(&self, handle: ChannelHandle, event: &str, payload: Value) -> bool {
        self.push(
            handle,
            TransportEventKind::Broadcast {
                event: event.to_string(),
                payload,
            },
        )
    }

    pub fn presence_sync(&self, handle: ChannelHandle, presences: Vec<PresenceMeta>) -> bool {
        self.push(handle, TransportEventKind::PresenceSync(presences))
    }

    pub fn presence_diff(
        &self,
        handle: ChannelHandle,
        joins: Vec<PresenceMeta>,
        leaves: Vec<PresenceMeta>,
    ) -> bool {
        self.push(handle, TransportEventKind::PresenceDiff { joins, leaves })
    }
}
