//! Outgoing status rate limiting
//!
//! Non-critical updates are held to one broadcast per `min_interval`. Inside
//! the window an update is either dropped or kept as the single pending
//! resend, depending on [`CoalescePolicy`]. Critical updates always go out
//! immediately.

use std::time::Duration;

use livetrack_core::config::{CoalescePolicy, PresenceConfig};
use tokio::time::Instant;
use tracing::debug;

use super::events::StatusMessage;

/// Decision for one outgoing update
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Send now
    Send(StatusMessage),
    /// Held as the pending resend, due at `deliver_at`
    Coalesced { deliver_at: Instant },
    Dropped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThrottleStats {
    pub sent: u64,
    pub coalesced: u64,
    pub dropped: u64,
    pub failed: u64,
}

#[derive(Debug)]
pub struct BroadcastThrottler {
    min_interval: Duration,
    policy: CoalescePolicy,
    last_sent_at: Option<Instant>,
    pending: Option<StatusMessage>,
    pending_at: Option<Instant>,
    stats: ThrottleStats,
}

impl BroadcastThrottler {
    #[must_use]
    pub const fn new(min_interval: Duration, policy: CoalescePolicy) -> Self {
        Self {
            min_interval,
            policy,
            last_sent_at: None,
            pending: None,
            pending_at: None,
            stats: ThrottleStats {
                sent: 0,
                coalesced: 0,
                dropped: 0,
                failed: 0,
            },
        }
    }

    #[must_use]
    pub const fn from_config(config: &PresenceConfig) -> Self {
        Self::new(config.min_broadcast_interval(), config.coalesce_policy)
    }

    pub fn admit(&mut self, message: StatusMessage, now: Instant) -> Admission {
        if message.is_critical() {
            self.supersede_pending(&message);
            return Admission::Send(message);
        }

        let window_end = match self.last_sent_at {
            Some(last) if now < last + self.min_interval => last + self.min_interval,
            _ => {
                self.supersede_pending(&message);
                return Admission::Send(message);
            }
        };

        match self.policy {
            CoalescePolicy::Drop => {
                self.stats.dropped += 1;
                debug!(
                    tracker_id = %message.tracker_id,
                    status = %message.status,
                    "Dropped status update inside throttle window"
                );
                Admission::Dropped
            }
            CoalescePolicy::ResendLatest => {
                self.stats.coalesced += 1;
                if let Some(replaced) = self.pending.replace(message) {
                    debug!(
                        tracker_id = %replaced.tracker_id,
                        "Replaced pending status update"
                    );
                }
                let deliver_at = *self.pending_at.get_or_insert(window_end);
                Admission::Coalesced { deliver_at }
            }
        }
    }

    /// The transport acknowledged a send at `now`
    pub fn record_sent(&mut self, now: Instant) {
        self.stats.sent += 1;
        self.last_sent_at = Some(now);
        if self.pending.is_some() {
            self.pending_at = Some(now + self.min_interval);
        }
    }

    pub fn record_failed(&mut self) {
        self.stats.failed += 1;
    }

    /// Take the pending resend if its deadline has passed
    pub fn take_due(&mut self, now: Instant) -> Option<StatusMessage> {
        match self.pending_at {
            Some(at) if at <= now => {
                self.pending_at = None;
                self.pending.take()
            }
            _ => None,
        }
    }

    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.pending_at
    }

    #[must_use]
    pub const fn pending(&self) -> Option<&StatusMessage> {
        self.pending.as_ref()
    }

    #[must_use]
    pub const fn last_sent_at(&self) -> Option<Instant> {
        self.last_sent_at
    }

    #[must_use]
    pub const fn stats(&self) -> ThrottleStats {
        self.stats
    }

    /// A newer send for the same tracker makes an older pending resend obsolete
    fn supersede_pending(&mut self, message: &StatusMessage) {
        let obsolete = self.pending.as_ref().is_some_and(|pending| {
            pending.tracker_id == message.tracker_id && pending.timestamp <= message.timestamp
        });
        if obsolete {
            self.pending = None;
            self.pending_at = None;
            debug!(tracker_id = %message.tracker_id, "Pending status update superseded");
        }
    }
}
