//! Transport client: named channels over one realtime connection.
//!
//! ```text
//!  SyncSession ──open/close/send/track──► Transport ──► relay
//!       ▲                                     │
//!       └──────── TransportEvent stream ◄─────┘
//!            (status, change, broadcast, presence)
//! ```
//!
//! Every method is enqueue-only and never fails. Connection problems come
//! back as [`ChannelStatus::Error`] / [`ChannelStatus::TimedOut`] events on
//! the affected channels, so callers observe failure instead of handling
//! it at the call site.

pub mod memory;
pub mod ws;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::channel::{ChannelHandle, ChannelSpec, ChannelStatus};
use crate::protocol::PresenceMeta;

pub use memory::{MemoryRemote, MemoryTransport};
pub use ws::{WsOptions, WsTransport};

/// A realtime connection multiplexing named channels.
pub trait Transport: Send {
    /// Start joining a channel. The returned handle identifies this opening
    /// only; its first status event follows asynchronously.
    fn open_channel(&mut self, spec: &ChannelSpec) -> ChannelHandle;

    /// Leave a channel. No further events are delivered for the handle.
    fn close_channel(&mut self, handle: ChannelHandle);

    /// Best-effort broadcast to the channel's other members.
    fn send(&mut self, handle: ChannelHandle, event: &str, payload: Value);

    /// Announce the local user's presence on the channel.
    fn track(&mut self, handle: ChannelHandle, meta: PresenceMeta);

    /// Take the inbound event stream (can only be called once).
    fn take_event_rx(&mut self) -> Option<mpsc::Receiver<TransportEvent>>;
}

/// Inbound traffic for one channel opening.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub handle: ChannelHandle,
    pub kind: TransportEventKind,
}

impl TransportEvent {
    pub fn new(handle: ChannelHandle, kind: TransportEventKind) -> Self {
        Self { handle, kind }
    }

    pub fn status(handle: ChannelHandle, status: ChannelStatus) -> Self {
        Self::new(handle, TransportEventKind::Status(status))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEventKind {
    Status(ChannelStatus),
    /// Raw CDC payload, not yet validated.
    Change(Value),
    Broadcast { event: String, payload: Value },
    /// Full presence snapshot for the channel.
    PresenceSync(Vec<PresenceMeta>),
    PresenceDiff {
        joins: Vec<PresenceMeta>,
        leaves: Vec<PresenceMeta>,
    },
}

/// Outbound request queued by a transport front-end.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCommand {
    Open {
        handle: ChannelHandle,
        spec: ChannelSpec,
    },
    Close {
        handle: ChannelHandle,
    },
    Send {
        handle: ChannelHandle,
        event: String,
        payload: Value,
    },
    Track {
        handle: ChannelHandle,
        meta: PresenceMeta,
    },
}

impl TransportCommand {
    pub fn handle(&self) -> ChannelHandle {
        match self {
            Self::Open { handle, .. }
            | Self::Close { handle }
            | Self::Send { handle, .. }
            | Self::Track { handle, .. } => *handle,
        }
    }
}

/// Monotonic handle source. Handles are never reused within a transport.
#[derive(Debug, Default)]
pub(crate) struct HandleAllocator {
    last: u64,
}

impl HandleAllocator {
    pub(crate) fn next(&mut self) -> ChannelHandle {
        self.last += 1;
        ChannelHandle(self.last)
    }
}
