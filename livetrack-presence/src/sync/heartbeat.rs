//! Heartbeat check for silent disconnects
//!
//! A session can drop without pushing an error or close event. While the
//! coordinator believes it is `Connected`, the monitor periodically asks the
//! session for its self-reported state; anything other than `Joined` is
//! treated as a transport failure.

use std::time::Duration;

use tokio::time::Instant;

use super::lifecycle::ConnectionState;
use super::transport::SessionState;

/// Result of one heartbeat check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    Healthy,
    /// The session stopped reporting `Joined`; `None` means there is no session
    Silent(Option<SessionState>),
    /// Nothing to check: the coordinator is not connected
    Idle,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatStats {
    pub checks: u64,
    pub silent_failures: u64,
}

/// Passive heartbeat timer, polled by the coordinator's driver
#[derive(Debug)]
pub struct HeartbeatMonitor {
    interval: Duration,
    next_check: Option<Instant>,
    stats: HeartbeatStats,
}

impl HeartbeatMonitor {
    /// A zero interval disables the monitor
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_check: None,
            stats: HeartbeatStats {
                checks: 0,
                silent_failures: 0,
            },
        }
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    /// Schedule the next check one interval from `now`
    pub fn arm(&mut self, now: Instant) {
        if self.is_enabled() {
            self.next_check = Some(now + self.interval);
        }
    }

    pub fn disarm(&mut self) {
        self.next_check = None;
    }

    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.next_check
    }

    #[must_use]
    pub fn is_due(&self, now: Instant) -> bool {
        self.next_check.is_some_and(|at| at <= now)
    }

    /// Run one check. Healthy checks re-arm; anything else leaves the monitor
    /// disarmed until the next successful connection.
    pub fn check(
        &mut self,
        connection: ConnectionState,
        session: Option<SessionState>,
        now: Instant,
    ) -> HeartbeatVerdict {
        self.next_check = None;

        if connection != ConnectionState::Connected {
            return HeartbeatVerdict::Idle;
        }

        self.stats.checks += 1;
        if session == Some(SessionState::Joined) {
            self.arm(now);
            HeartbeatVerdict::Healthy
        } else {
            self.stats.silent_failures += 1;
            tracing::warn!(
                session_state = ?session,
                "Heartbeat found session no longer joined"
            );
            HeartbeatVerdict::Silent(session)
        }
    }

    #[must_use]
    pub const fn stats(&self) -> HeartbeatStats {
        self.stats
    }
}
