//! Reconnection controller: one place that decides when a failed channel
//! is resubscribed.
//!
//! ```text
//!   Error / TimedOut ──► schedule(attempt n, delay(n)) ──► due() ──► resubscribe
//!          ▲                                                             │
//!          └──────────────────── failure again ◄─────────────────────────┤
//!                                                                        ▼
//!   Closed (deliberate) ──► cancel, never scheduled          Subscribed ──► reset
//! ```
//!
//! Delays are capped exponential with a random jitter drawn per client, so
//! a fleet of clients losing the same relay does not reconnect in
//! lockstep.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::channel::{ChannelName, ChannelStatus};
use crate::config::ConfigError;

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter_ratio() -> f64 {
    0.2
}

/// Retry delay policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound for any single delay, jitter included.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Fraction of the delay used as a +/- jitter window, in `[0, 1]`.
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,

    /// Give up after this many consecutive failures. `None` retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter_ratio: default_jitter_ratio(),
            max_attempts: None,
        }
    }
}

impl BackoffPolicy {
    /// Constant delay with no jitter.
    pub fn flat(delay_ms: u64) -> Self {
        Self {
            initial_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            multiplier: 1.0,
            jitter_ratio: 0.0,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let raw = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(raw.min(self.max_delay_ms as f64).max(0.0) as u64)
    }

    /// Delay before retry number `attempt` with a jitter offset drawn from
    /// `rng`, never above `max_delay_ms` and never zero.
    pub fn delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base_delay(attempt).as_millis() as u64;
        let span = (base_ms as f64 * self.jitter_ratio) as i64;
        if span == 0 {
            return Duration::from_millis(base_ms);
        }

        let offset = rng.gen_range(-span..=span);
        let jittered_ms = if offset >= 0 {
            base_ms.saturating_add(offset as u64)
        } else {
            base_ms.saturating_sub(offset.unsigned_abs()).max(1)
        };
        Duration::from_millis(jittered_ms.min(self.max_delay_ms))
    }

    /// Whether `attempt` is past the configured limit.
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt > max)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_delay_ms == 0 {
            return Err(ConfigError::invalid("backoff.initial_delay_ms", "must be > 0"));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(ConfigError::invalid(
                "backoff.max_delay_ms",
                "must be >= initial_delay_ms",
            ));
        }
        if !(self.multiplier >= 1.0) {
            return Err(ConfigError::invalid("backoff.multiplier", "must be >= 1.0"));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(ConfigError::invalid(
                "backoff.jitter_ratio",
                "must be within [0, 1]",
            ));
        }
        Ok(())
    }
}

/// What the controller did with a status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// A resubscription is due after `delay`.
    Scheduled { attempt: u32, delay: Duration },
    /// A retry was already pending; nothing new scheduled.
    AlreadyScheduled,
    /// Retry limit reached; the channel stays down.
    GaveUp { attempts: u32 },
    /// Channel recovered; attempt counter cleared.
    Reset { attempts: u32 },
    /// Deliberate teardown dropped a pending retry.
    Cancelled,
    Ignored,
}

#[derive(Debug, Default)]
struct RetryState {
    attempts: u32,
    deadline: Option<Instant>,
    gave_up: bool,
}

/// Tracks retry state for every channel that has failed and not yet
/// recovered.
#[derive(Debug)]
pub struct ReconnectController {
    policy: BackoffPolicy,
    retries: HashMap<ChannelName, RetryState>,
    rng: StdRng,
}

impl ReconnectController {
    /// Controller with jitter seeded from OS entropy.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self::with_rng(policy, StdRng::from_entropy())
    }

    /// Controller drawing jitter from a caller-supplied generator.
    pub fn with_rng(policy: BackoffPolicy, rng: StdRng) -> Self {
        Self {
            policy,
            retries: HashMap::new(),
            rng,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Feed one status transition.
    pub fn on_status(
        &mut self,
        channel: &ChannelName,
        status: ChannelStatus,
        now: Instant,
    ) -> ReconnectDecision {
        match status {
            ChannelStatus::Error | ChannelStatus::TimedOut => self.schedule(channel, now),
            ChannelStatus::Subscribed => match self.retries.remove(channel) {
                Some(state) => {
                    log::info!(
                        "Channel {channel} recovered after {} attempt(s)",
                        state.attempts
                    );
                    ReconnectDecision::Reset {
                        attempts: state.attempts,
                    }
                }
                None => ReconnectDecision::Ignored,
            },
            ChannelStatus::Closed => {
                if self.cancel(channel) {
                    ReconnectDecision::Cancelled
                } else {
                    ReconnectDecision::Ignored
                }
            }
            ChannelStatus::Idle | ChannelStatus::Connecting => ReconnectDecision::Ignored,
        }
    }

    fn schedule(&mut self, channel: &ChannelName, now: Instant) -> ReconnectDecision {
        let state = self.retries.entry(channel.clone()).or_default();
        if state.deadline.is_some() {
            return ReconnectDecision::AlreadyScheduled;
        }
        if state.gave_up {
            return ReconnectDecision::Ignored;
        }

        state.attempts += 1;
        if self.policy.exhausted(state.attempts) {
            state.gave_up = true;
            log::warn!(
                "Giving up on channel {channel} after {} failed attempt(s)",
                state.attempts - 1
            );
            return ReconnectDecision::GaveUp {
                attempts: state.attempts - 1,
            };
        }

        let delay = self.policy.delay(state.attempts, &mut self.rng);
        state.deadline = Some(now + delay);
        log::info!(
            "Channel {channel} failed, resubscribing in {}ms (attempt {})",
            delay.as_millis(),
            state.attempts
        );
        ReconnectDecision::Scheduled {
            attempt: state.attempts,
            delay,
        }
    }

    /// Drop all retry state for a channel. Returns whether a retry was
    /// pending.
    pub fn cancel(&mut self, channel: &ChannelName) -> bool {
        self.retries
            .remove(channel)
            .is_some_and(|state| state.deadline.is_some())
    }

    /// Channels whose retry deadline has passed, earliest first. Each is
    /// returned once; the attempt counter survives until the channel
    /// reports `Subscribed`.
    pub fn due(&mut self, now: Instant) -> Vec<ChannelName> {
        let mut due: Vec<(Instant, ChannelName)> = self
            .retries
            .iter_mut()
            .filter_map(|(name, state)| match state.deadline {
                Some(deadline) if deadline <= now => {
                    state.deadline = None;
                    Some((deadline, name.clone()))
                }
                _ => None,
            })
            .collect();
        due.sort();
        due.into_iter().map(|(_, name)| name).collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.retries.values().filter_map(|s| s.deadline).min()
    }

    /// True while any channel is failed and not yet recovered.
    pub fn is_degraded(&self) -> bool {
        !self.retries.is_empty()
    }

    pub fn attempts(&self, channel: &ChannelName) -> u32 {
        self.retries.get(channel).map_or(0, |s| s.attempts)
    }

    pub fn is_scheduled(&self, channel: &ChannelName) -> bool {
        self.retries
            .get(channel)
            .is_some_and(|s| s.deadline.is_some())
    }
}
