//! Ephemeral peer events: best-effort send, handler dispatch at receipt,
//! and self-expiring typing indicators.
//!
//! Nothing here is persisted or enters the entity cache. There is no
//! ordering, delivery guarantee or retry, so any state derived from
//! broadcasts must expire on its own.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::channel::ChannelName;
use crate::handlers::{HandlerId, HandlerTable};
use crate::subscription::SubscriptionManager;
use crate::transport::Transport;

/// Broadcast event name for typing indicators.
pub const TYPING_EVENT: &str = "typing";

/// A received broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastEvent {
    pub channel: ChannelName,
    pub event: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub sent: u64,
    pub dropped: u64,
    pub received: u64,
}

#[derive(Debug, Default)]
pub struct BroadcastMessenger {
    handlers: HandlerTable<(ChannelName, String), BroadcastEvent>,
    stats: BroadcastStats,
}

impl BroadcastMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send to the channel's other members. Dropped (returns `false`) if
    /// the channel is not subscribed right now.
    pub fn send(
        &mut self,
        subscriptions: &SubscriptionManager,
        transport: &mut dyn Transport,
        channel: &str,
        event: &str,
        payload: Value,
    ) -> bool {
        let Some(handle) = subscriptions.subscribed_handle(channel) else {
            log::debug!("Broadcast `{event}` to {channel} dropped: not subscribed");
            self.stats.dropped += 1;
            return false;
        };
        transport.send(handle, event, payload);
        self.stats.sent += 1;
        true
    }

    pub fn on_event<F>(&mut self, channel: impl Into<ChannelName>, event: &str, handler: F) -> HandlerId
    where
        F: Fn(&BroadcastEvent) + Send + 'static,
    {
        self.handlers
            .insert((channel.into(), event.to_string()), handler)
    }

    pub fn off(&mut self, id: HandlerId) -> bool {
        self.handlers.remove(id)
    }

    /// Run the handlers registered for this channel and event name.
    pub fn dispatch(&mut self, event: &BroadcastEvent) -> usize {
        self.stats.received += 1;
        let key = (event.channel.clone(), event.event.clone());
        let called = self.handlers.dispatch(&key, event);
        log::trace!(
            "Broadcast `{}` on {} reached {called} handler(s)",
            event.event,
            event.channel
        );
        called
    }

    pub fn stats(&self) -> BroadcastStats {
        self.stats
    }
}

/// Typing broadcast body: `{"userId": "...", "isTyping": true}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub user_id: String,
    #[serde(default = "default_is_typing")]
    pub is_typing: bool,
}

fn default_is_typing() -> bool {
    true
}

impl TypingPayload {
    pub fn new(user_id: impl Into<String>, is_typing: bool) -> Self {
        Self {
            user_id: user_id.into(),
            is_typing,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A typing indicator that changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingChange {
    pub channel: ChannelName,
    pub user_id: String,
    pub is_typing: bool,
}

/// Who is typing where. Each flag clears itself `timeout` after its last
/// refresh, so a lost "stopped typing" cannot leave it set forever.
#[derive(Debug)]
pub struct TypingIndicators {
    timeout: Duration,
    expiries: HashMap<ChannelName, HashMap<String, Instant>>,
}

impl TypingIndicators {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            expiries: HashMap::new(),
        }
    }

    /// Feed a typing broadcast. Returns a change only if the user's flag
    /// flipped; a refresh just pushes the expiry out.
    pub fn observe(
        &mut self,
        channel: &ChannelName,
        payload: &Value,
        now: Instant,
    ) -> Option<TypingChange> {
        let typing: TypingPayload = match serde_json::from_value(payload.clone()) {
            Ok(typing) => typing,
            Err(e) => {
                log::debug!("Ignoring malformed typing payload on {channel}: {e}");
                return None;
            }
        };
        if typing.user_id.is_empty() {
            return None;
        }

        let users = self.expiries.entry(channel.clone()).or_default();
        let was_typing = if typing.is_typing {
            users
                .insert(typing.user_id.clone(), now + self.timeout)
                .is_some()
        } else {
            users.remove(&typing.user_id).is_some()
        };
        if users.is_empty() {
            self.expiries.remove(channel);
        }

        (was_typing != typing.is_typing).then(|| TypingChange {
            channel: channel.clone(),
            user_id: typing.user_id,
            is_typing: typing.is_typing,
        })
    }

    /// Users currently typing on a channel, sorted. Flags past their
    /// expiry are left out even before a sweep removes them.
    pub fn typing_users(&self, channel: &str) -> Vec<&str> {
        let now = Instant::now();
        let mut users: Vec<&str> = self
            .expiries
            .get(channel)
            .into_iter()
            .flat_map(|users| users.iter())
            .filter(|(_, expiry)| **expiry > now)
            .map(|(user_id, _)| user_id.as_str())
            .collect();
        users.sort_unstable();
        users
    }

    pub fn is_typing(&self, channel: &str, user_id: &str) -> bool {
        let now = Instant::now();
        self.expiries
            .get(channel)
            .and_then(|users| users.get(user_id))
            .is_some_and(|expiry| *expiry > now)
    }

    /// Clear flags whose expiry has passed.
    pub fn sweep(&mut self, now: Instant) -> Vec<TypingChange> {
        let mut expired = Vec::new();
        self.expiries.retain(|channel, users| {
            users.retain(|user_id, expiry| {
                if *expiry <= now {
                    expired.push(TypingChange {
                        channel: channel.clone(),
                        user_id: user_id.clone(),
                        is_typing: false,
                    });
                    false
                } else {
                    true
                }
            });
            !users.is_empty()
        });
        expired.sort_by(|a, b| (&a.channel, &a.user_id).cmp(&(&b.channel, &b.user_id)));
        expired
    }

    /// Earliest expiry among the set flags.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.expiries
            .values()
            .flat_map(|users| users.values())
            .min()
            .copied()
    }

    pub fn forget_channel(&mut self, channel: &str) {
        self.expiries.remove(channel);
    }
}
