//! Presence tracking: who is online, per channel.
//!
//! ## Architecture
//!
//! ```text
//! relay PresenceState ──► handle_sync()   (authoritative snapshot)
//! relay PresenceDiff  ──► handle_join() / handle_leave()   (deltas)
//!                               │
//!                               ▼
//!             channel ─► user ─► PresenceState { online, last_seen }
//!                               │
//!                               ▼
//!                        PresenceDelta (who came, who went)
//! ```
//!
//! A user is `unknown` until first seen, then `online`, then `offline`.
//! Offline users stay in the table with their `last_seen`, so "last seen 5
//! minutes ago" survives a leave. Presence never touches the entity cache.
//!
//! The local user only shows up to peers after it tracks itself on each
//! presence channel; [`PresenceTracker::needs_self_track`] tells the session
//! when to do that.

use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

use crate::channel::{ChannelName, DeliveryModes};
use crate::protocol::PresenceMeta;

/// One user's presence on one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceState {
    pub user_id: String,
    pub is_online: bool,
    /// Last time this user was heard from (join, sync, or leave).
    pub last_seen: Instant,
    pub metadata: Value,
    /// Wall-clock time the user came online, as reported by the peer.
    pub online_at: u64,
}

impl PresenceState {
    fn online(meta: PresenceMeta, now: Instant) -> Self {
        Self {
            user_id: meta.user_id,
            is_online: true,
            last_seen: now,
            metadata: meta.metadata,
            online_at: meta.online_at,
        }
    }
}

/// Users whose online status changed on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceDelta {
    pub channel: ChannelName,
    pub joined: Vec<String>,
    pub left: Vec<String>,
}

impl PresenceDelta {
    fn new(channel: &ChannelName) -> Self {
        Self {
            channel: channel.clone(),
            joined: Vec::new(),
            left: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty()
    }
}

/// Per-channel presence tables for every channel carrying presence.
#[derive(Debug)]
pub struct PresenceTracker {
    local_user_id: String,
    channels: HashMap<ChannelName, HashMap<String, PresenceState>>,
    self_tracked: HashSet<ChannelName>,
}

impl PresenceTracker {
    pub fn new(local_user_id: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            channels: HashMap::new(),
            self_tracked: HashSet::new(),
        }
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    /// Replace the channel's table with a full snapshot. Users missing from
    /// it go offline, whether or not a leave was seen for them.
    pub fn handle_sync(
        &mut self,
        channel: &ChannelName,
        presences: Vec<PresenceMeta>,
        now: Instant,
    ) -> PresenceDelta {
        let mut delta = PresenceDelta::new(channel);
        let table = self.channels.entry(channel.clone()).or_default();
        let listed: HashSet<String> = presences.iter().map(|p| p.user_id.clone()).collect();

        for state in table.values_mut() {
            if state.is_online && !listed.contains(&state.user_id) {
                state.is_online = false;
                delta.left.push(state.user_id.clone());
            }
        }

        for meta in presences {
            if meta.user_id.is_empty() {
                continue;
            }
            let was_online = table.get(&meta.user_id).is_some_and(|s| s.is_online);
            if !was_online {
                delta.joined.push(meta.user_id.clone());
            }
            table.insert(meta.user_id.clone(), PresenceState::online(meta, now));
        }

        delta.joined.sort();
        delta.left.sort();
        log::debug!(
            "Presence sync on {channel}: {} online, {} joined, {} left",
            table.values().filter(|s| s.is_online).count(),
            delta.joined.len(),
            delta.left.len()
        );
        delta
    }

    pub fn handle_join(
        &mut self,
        channel: &ChannelName,
        joins: Vec<PresenceMeta>,
        now: Instant,
    ) -> PresenceDelta {
        let mut delta = PresenceDelta::new(channel);
        let table = self.channels.entry(channel.clone()).or_default();
        for meta in joins {
            if meta.user_id.is_empty() {
                continue;
            }
            if !table.get(&meta.user_id).is_some_and(|s| s.is_online) {
                delta.joined.push(meta.user_id.clone());
            }
            table.insert(meta.user_id.clone(), PresenceState::online(meta, now));
        }
        delta
    }

    /// Leaves for users never seen on the channel are ignored.
    pub fn handle_leave(
        &mut self,
        channel: &ChannelName,
        leaves: Vec<PresenceMeta>,
        now: Instant,
    ) -> PresenceDelta {
        let mut delta = PresenceDelta::new(channel);
        let Some(table) = self.channels.get_mut(channel) else {
            return delta;
        };
        for meta in leaves {
            if let Some(state) = table.get_mut(&meta.user_id) {
                if state.is_online {
                    state.is_online = false;
                    state.last_seen = now;
                    delta.left.push(meta.user_id);
                }
            }
        }
        delta
    }

    /// Online on any channel.
    pub fn is_online(&self, user_id: &str) -> bool {
        self.channels
            .values()
            .any(|table| table.get(user_id).is_some_and(|s| s.is_online))
    }

    pub fn is_online_in(&self, channel: &str, user_id: &str) -> bool {
        self.state(channel, user_id).is_some_and(|s| s.is_online)
    }

    /// Online users of a channel, sorted.
    pub fn online_users(&self, channel: &str) -> Vec<&str> {
        let mut users: Vec<&str> = self
            .channels
            .get(channel)
            .into_iter()
            .flat_map(|table| table.values())
            .filter(|s| s.is_online)
            .map(|s| s.user_id.as_str())
            .collect();
        users.sort_unstable();
        users
    }

    /// Online users across all channels.
    pub fn all_online(&self) -> BTreeSet<&str> {
        self.channels
            .values()
            .flat_map(|table| table.values())
            .filter(|s| s.is_online)
            .map(|s| s.user_id.as_str())
            .collect()
    }

    pub fn state(&self, channel: &str, user_id: &str) -> Option<&PresenceState> {
        self.channels.get(channel)?.get(user_id)
    }

    /// Most recent sighting of a user on any channel.
    pub fn last_seen(&self, user_id: &str) -> Option<Instant> {
        self.channels
            .values()
            .filter_map(|table| table.get(user_id))
            .map(|s| s.last_seen)
            .max()
    }

    /// Whether the local user still has to announce itself on a channel
    /// with these modes.
    pub fn needs_self_track(&self, channel: &str, modes: DeliveryModes) -> bool {
        modes.presence && !self.self_tracked.contains(channel)
    }

    pub fn mark_self_tracked(&mut self, channel: &ChannelName) {
        self.self_tracked.insert(channel.clone());
    }

    pub fn is_self_tracked(&self, channel: &str) -> bool {
        self.self_tracked.contains(channel)
    }

    /// A new opening of the channel must track again.
    pub fn clear_self_tracked(&mut self, channel: &str) {
        self.self_tracked.remove(channel);
    }

    /// The local user's presence payload.
    pub fn local_payload(&self, metadata: &Value) -> PresenceMeta {
        PresenceMeta {
            user_id: self.local_user_id.clone(),
            metadata: metadata.clone(),
            online_at: unix_millis(),
        }
    }

    /// Mark peers not heard from within `window` offline. The local user is
    /// never swept.
    pub fn sweep_stale(&mut self, now: Instant, window: Duration) -> Vec<PresenceDelta> {
        let mut deltas = Vec::new();
        for (channel, table) in &mut self.channels {
            let mut delta = PresenceDelta::new(channel);
            for state in table.values_mut() {
                if state.is_online
                    && state.user_id != self.local_user_id
                    && now.saturating_duration_since(state.last_seen) >= window
                {
                    state.is_online = false;
                    delta.left.push(state.user_id.clone());
                }
            }
            if !delta.is_empty() {
                delta.left.sort();
                log::info!(
                    "Presence on {channel}: {} peer(s) went stale",
                    delta.left.len()
                );
                deltas.push(delta);
            }
        }
        deltas.sort_by(|a, b| a.channel.cmp(&b.channel));
        deltas
    }

    /// Drop everything known about a channel (it was closed).
    pub fn forget_channel(&mut self, channel: &str) {
        self.channels.remove(channel);
        self.self_tracked.remove(channel);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
