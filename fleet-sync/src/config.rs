//! Session configuration.
//!
//! Every field has a serde default, so a config file only needs to name
//! what it changes:
//!
//! ```json
//! { "user_id": "u-42", "relay_url": "ws://relay:9090", "typing_timeout_ms": 5000 }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::channel::{CdcBinding, ChannelSpec, DeliveryModes};
use crate::reconnect::BackoffPolicy;

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid value for `{field}`: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Where the local user's memberships live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipBinding {
    /// Membership relation, e.g. `room_members`.
    pub table: String,
    /// Column holding the member's user id.
    pub user_field: String,
    /// Column holding the key of the entity the user belongs to.
    pub key_field: String,
}

impl Default for MembershipBinding {
    fn default() -> Self {
        Self {
            table: "room_members".into(),
            user_field: "user_id".into(),
            key_field: "room_id".into(),
        }
    }
}

/// A table bound to every per-membership channel, narrowed to rows whose
/// `scope_field` equals the membership key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopedBinding {
    pub table: String,
    pub scope_field: String,
}

impl ScopedBinding {
    pub fn new(table: impl Into<String>, scope_field: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            scope_field: scope_field.into(),
        }
    }
}

fn default_relay_url() -> String {
    "ws://127.0.0.1:9090".into()
}

fn default_room_channel_prefix() -> String {
    "room".into()
}

fn default_room_bindings() -> Vec<ScopedBinding> {
    vec![
        ScopedBinding::new("messages", "room_id"),
        ScopedBinding::new("rooms", "id"),
    ]
}

fn default_room_modes() -> DeliveryModes {
    DeliveryModes::ALL
}

fn default_static_channels() -> Vec<ChannelSpec> {
    vec![
        ChannelSpec::new("presence:global", DeliveryModes::PRESENCE),
        ChannelSpec::new("fleet", DeliveryModes::CDC)
            .with_binding(CdcBinding::table("equipment"))
            .with_binding(CdcBinding::table("vehicles")),
    ]
}

fn default_presence_metadata() -> Value {
    Value::Object(Default::default())
}

fn default_typing_timeout_ms() -> u64 {
    3_000
}

fn default_pending_timeout_ms() -> u64 {
    30_000
}

fn default_resync_interval_ms() -> Option<u64> {
    Some(300_000)
}

fn default_maintenance_interval_ms() -> u64 {
    1_000
}

fn default_join_timeout_ms() -> u64 {
    10_000
}

fn default_heartbeat_interval_ms() -> u64 {
    25_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_event_channel_capacity() -> usize {
    1024
}

/// Configuration for one [`SyncSession`](crate::session::SyncSession).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// The local user. Scopes the membership channel and presence tracking.
    pub user_id: String,

    #[serde(default = "default_relay_url")]
    pub relay_url: String,

    #[serde(default)]
    pub membership: MembershipBinding,

    /// Room channels are named `{prefix}:{membership key}`.
    #[serde(default = "default_room_channel_prefix")]
    pub room_channel_prefix: String,

    #[serde(default = "default_room_bindings")]
    pub room_bindings: Vec<ScopedBinding>,

    #[serde(default = "default_room_modes")]
    pub room_modes: DeliveryModes,

    /// Channels held open for the whole session regardless of membership.
    #[serde(default = "default_static_channels")]
    pub static_channels: Vec<ChannelSpec>,

    /// Metadata published with the local user's presence.
    #[serde(default = "default_presence_metadata")]
    pub presence_metadata: Value,

    #[serde(default)]
    pub backoff: BackoffPolicy,

    /// A typing indicator clears itself after this long without a refresh.
    #[serde(default = "default_typing_timeout_ms")]
    pub typing_timeout_ms: u64,

    /// Optimistic entries awaiting CDC confirmation longer than this are
    /// cleared (the optimistic value stays).
    #[serde(default = "default_pending_timeout_ms")]
    pub pending_timeout_ms: u64,

    /// Periodic full resync of every cached collection. `None` disables it.
    #[serde(default = "default_resync_interval_ms")]
    pub resync_interval_ms: Option<u64>,

    /// Presence entries not heard from within this window go offline.
    #[serde(default)]
    pub presence_stale_after_ms: Option<u64>,

    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,

    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,

    /// Application ping interval on the relay socket. `0` disables pings.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl SyncConfig {
    /// Defaults for everything but the local user.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            relay_url: default_relay_url(),
            membership: MembershipBinding::default(),
            room_channel_prefix: default_room_channel_prefix(),
            room_bindings: default_room_bindings(),
            room_modes: default_room_modes(),
            static_channels: default_static_channels(),
            presence_metadata: default_presence_metadata(),
            backoff: BackoffPolicy::default(),
            typing_timeout_ms: default_typing_timeout_ms(),
            pending_timeout_ms: default_pending_timeout_ms(),
            resync_interval_ms: default_resync_interval_ms(),
            presence_stale_after_ms: None,
            maintenance_interval_ms: default_maintenance_interval_ms(),
            join_timeout_ms: default_join_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }

    /// Parse and validate a JSON config.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_relay_url(mut self, url: impl Into<String>) -> Self {
        self.relay_url = url.into();
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_static_channels(mut self, channels: Vec<ChannelSpec>) -> Self {
        self.static_channels = channels;
        self
    }

    pub fn with_room_bindings(mut self, bindings: Vec<ScopedBinding>) -> Self {
        self.room_bindings = bindings;
        self
    }

    pub fn with_presence_metadata(mut self, metadata: Value) -> Self {
        self.presence_metadata = metadata;
        self
    }

    pub fn with_typing_timeout_ms(mut self, ms: u64) -> Self {
        self.typing_timeout_ms = ms;
        self
    }

    pub fn with_pending_timeout_ms(mut self, ms: u64) -> Self {
        self.pending_timeout_ms = ms;
        self
    }

    pub fn with_resync_interval_ms(mut self, ms: Option<u64>) -> Self {
        self.resync_interval_ms = ms;
        self
    }

    pub fn with_presence_stale_after_ms(mut self, ms: Option<u64>) -> Self {
        self.presence_stale_after_ms = ms;
        self
    }

    pub fn with_join_timeout_ms(mut self, ms: u64) -> Self {
        self.join_timeout_ms = ms;
        self
    }

    pub fn with_heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms)
    }

    pub fn pending_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_timeout_ms)
    }

    pub fn resync_interval(&self) -> Option<Duration> {
        self.resync_interval_ms.map(Duration::from_millis)
    }

    pub fn presence_stale_after(&self) -> Option<Duration> {
        self.presence_stale_after_ms.map(Duration::from_millis)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user_id.is_empty() {
            return Err(ConfigError::invalid("user_id", "must not be empty"));
        }
        if !(self.relay_url.starts_with("ws://") || self.relay_url.starts_with("wss://")) {
            return Err(ConfigError::invalid(
                "relay_url",
                "must be a ws:// or wss:// URL",
            ));
        }
        if self.membership.table.is_empty()
            || self.membership.user_field.is_empty()
            || self.membership.key_field.is_empty()
        {
            return Err(ConfigError::invalid(
                "membership",
                "table, user_field and key_field are required",
            ));
        }
        if self.room_channel_prefix.is_empty() || self.room_channel_prefix.contains(':') {
            return Err(ConfigError::invalid(
                "room_channel_prefix",
                "must be non-empty and contain no `:`",
            ));
        }
        for (field, value) in [
            ("typing_timeout_ms", self.typing_timeout_ms),
            ("pending_timeout_ms", self.pending_timeout_ms),
            ("maintenance_interval_ms", self.maintenance_interval_ms),
            ("join_timeout_ms", self.join_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be > 0"));
            }
        }
        if self.resync_interval_ms == Some(0) {
            return Err(ConfigError::invalid("resync_interval_ms", "must be > 0"));
        }
        if self.presence_stale_after_ms == Some(0) {
            return Err(ConfigError::invalid("presence_stale_after_ms", "must be > 0"));
        }
        if self.event_channel_capacity == 0 {
            return Err(ConfigError::invalid("event_channel_capacity", "must be > 0"));
        }
        self.backoff.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_json_gets_defaults() {
        let config = SyncConfig::from_json_str(r#"{"user_id": "u1"}"#).unwrap();
        assert_eq!(config, SyncConfig::new("u1"));
        assert_eq!(config.relay_url, "ws://127.0.0.1:9090");
        assert_eq!(config.membership.table, "room_members");
        assert_eq!(config.typing_timeout(), Duration::from_secs(3));
        assert_eq!(config.static_channels.len(), 2);
    }

    #[test]
    fn test_json_overrides() {
        let config = SyncConfig::from_json_str(
            r#"{
                "user_id": "u1",
                "relay_url": "wss://relay.example:443",
                "typing_timeout_ms": 5000,
                "resync_interval_ms": null,
                "backoff": {"initial_delay_ms": 3000, "max_delay_ms": 3000, "multiplier": 1.0, "jitter_ratio": 0.0}
            }"#,
        )
        .unwrap();
        assert_eq!(config.typing_timeout_ms, 5_000);
        assert_eq!(config.resync_interval(), None);
        assert_eq!(config.backoff, BackoffPolicy::flat(3_000));
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            SyncConfig::from_json_str("{not json"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            SyncConfig::from_json_str("{}"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let err = SyncConfig::new("").validate().unwrap_err();
        assert_eq!(err, ConfigError::invalid("user_id", "must not be empty"));

        let err = SyncConfig::new("u1")
            .with_relay_url("http://x")
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "relay_url"));

        let err = SyncConfig::new("u1")
            .with_typing_timeout_ms(0)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("typing_timeout_ms"));

        let err = SyncConfig::new("u1")
            .with_resync_interval_ms(Some(0))
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("resync_interval_ms"));

        let err = SyncConfig::new("u1")
            .with_backoff(BackoffPolicy::flat(0))
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("backoff.initial_delay_ms"));
    }

    #[test]
    fn test_builders() {
        let config = SyncConfig::new("u1")
            .with_relay_url("ws://10.0.0.2:9000")
            .with_pending_timeout_ms(1_000)
            .with_static_channels(Vec::new());
        assert!(config.validate().is_ok());
        assert_eq!(config.pending_timeout(), Duration::from_secs(1));
        assert!(config.static_channels.is_empty());
    }
}
