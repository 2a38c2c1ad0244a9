//! Channel lifecycle: connection state machine and bounded reconnection
//!
//! The manager owns the single live [`ChannelSession`] of a coordinator and
//! the authoritative [`ConnectionState`]. Transitions are checked against an
//! explicit table:
//!
//! ```text
//! Disconnected ─► Connecting ─► Connected ─► Degraded
//!                     ▲  │          │           │
//!                     │  └──────────┼──► Degraded
//!                     └─────────────┴───────────┘   (retry / forced reconnect)
//! any non-Closed state ─► Closed
//! ```
//!
//! Reconnection is driven by [`RetryState`]: each transport failure bumps a
//! consecutive-failure counter and, while under budget, arms one retry
//! deadline. The coordinator's driver loop is the only scheduler.

use std::sync::Arc;
use std::time::Duration;

use livetrack_core::config::PresenceConfig;
use livetrack_core::EventId;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use super::transport::{ChannelConfig, ChannelSession, PubSubTransport, SessionEvent, SessionState};
use crate::{Error, Result};

/// Connection state of a coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
    Closed,
}

impl ConnectionState {
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Disconnected, Self::Connecting)
                | (Self::Connecting, Self::Connected | Self::Degraded)
                | (Self::Connected, Self::Degraded | Self::Connecting)
                | (Self::Degraded, Self::Connecting)
                | (
                    Self::Disconnected | Self::Connecting | Self::Connected | Self::Degraded,
                    Self::Closed
                )
        )
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reconnection budget and delays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failures after which retrying stops
    pub max_retries: u32,
    pub base_delay: Duration,
    pub cap_delay: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub const fn from_config(config: &PresenceConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay(),
            cap_delay: config.retry_cap_delay(),
        }
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.cap_delay)
    }
}

/// What a transport failure led to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    RetryScheduled { attempt: u32, delay: Duration },
    /// Budget spent; the session stays degraded until a forced reconnect
    Exhausted { failures: u32 },
    /// The failure did not apply to the current state
    Ignored,
}

/// Consecutive-failure counter plus the single pending retry deadline
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    failures: u32,
    next_attempt_at: Option<Instant>,
    exhausted: bool,
}

impl RetryState {
    pub fn record_failure(&mut self, policy: &RetryPolicy, now: Instant) -> FailureOutcome {
        if self.exhausted {
            return FailureOutcome::Ignored;
        }

        self.failures = self.failures.saturating_add(1);
        if self.failures >= policy.max_retries {
            self.exhausted = true;
            self.next_attempt_at = None;
            return FailureOutcome::Exhausted {
                failures: self.failures,
            };
        }

        let delay = policy.delay_for(self.failures);
        self.next_attempt_at = Some(now + delay);
        FailureOutcome::RetryScheduled {
            attempt: self.failures,
            delay,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Clear the pending deadline if it has passed; returns whether it had
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.next_attempt_at {
            Some(at) if at <= now => {
                self.next_attempt_at = None;
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }

    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    #[must_use]
    pub const fn next_attempt_at(&self) -> Option<Instant> {
        self.next_attempt_at
    }
}

/// Which lifecycle deadline fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleTimer {
    Retry,
    ConnectTimeout,
}

/// Owner of the coordinator's channel session and connection state
pub struct ChannelLifecycleManager {
    transport: Arc<dyn PubSubTransport>,
    channel_name: String,
    channel_config: ChannelConfig,
    policy: RetryPolicy,
    connect_timeout: Duration,
    retry: RetryState,
    connect_deadline: Option<Instant>,
    session: Option<Box<dyn ChannelSession>>,
    events: Option<mpsc::Receiver<SessionEvent>>,
    state: watch::Sender<ConnectionState>,
}

impl ChannelLifecycleManager {
    #[must_use]
    pub fn new(
        transport: Arc<dyn PubSubTransport>,
        event_id: &EventId,
        channel_config: ChannelConfig,
        policy: RetryPolicy,
        connect_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            channel_name: Self::channel_name_for(event_id),
            channel_config,
            policy,
            connect_timeout,
            retry: RetryState::default(),
            connect_deadline: None,
            session: None,
            events: None,
            state,
        }
    }

    /// Channel naming: `event:{event_id}`
    #[must_use]
    pub fn channel_name_for(event_id: &EventId) -> String {
        format!("event:{}", event_id.as_str())
    }

    #[must_use]
    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    #[must_use]
    pub const fn retry_state(&self) -> &RetryState {
        &self.retry
    }

    #[must_use]
    pub fn session(&self) -> Option<&dyn ChannelSession> {
        self.session.as_deref()
    }

    /// The session's self-reported state, if a session exists
    #[must_use]
    pub fn session_state(&self) -> Option<SessionState> {
        self.session.as_ref().map(|session| session.state())
    }

    pub fn events_mut(&mut self) -> &mut Option<mpsc::Receiver<SessionEvent>> {
        &mut self.events
    }

    /// Forget the event stream after it ended
    pub fn drop_events(&mut self) {
        self.events = None;
    }

    fn transition(&mut self, next: ConnectionState) -> bool {
        let current = self.state();
        if current == next {
            return true;
        }
        if !current.can_transition_to(next) {
            warn!(
                channel = %self.channel_name,
                from = %current,
                to = %next,
                "Rejected connection state transition"
            );
            return false;
        }

        self.state.send_replace(next);
        info!(
            channel = %self.channel_name,
            from = %current,
            to = %next,
            "Connection state changed"
        );
        true
    }

    /// Open a fresh session and subscribe to it.
    ///
    /// Any previous session is released first. On `Err` the state is left at
    /// `Connecting`; the caller reports the failure through
    /// [`Self::on_transport_failure`].
    pub async fn start(&mut self) -> Result<()> {
        if self.state() == ConnectionState::Closed {
            return Err(Error::Released);
        }

        self.release_session().await;
        self.retry.next_attempt_at = None;

        if !self.transition(ConnectionState::Connecting) {
            return Err(Error::Transport(format!(
                "cannot connect from {} state",
                self.state()
            )));
        }
        self.connect_deadline = Some(Instant::now() + self.connect_timeout);

        let opened = timeout(
            self.connect_timeout,
            self.transport
                .channel(&self.channel_name, self.channel_config.clone()),
        )
        .await;

        let mut session = match opened {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(Error::Timeout(format!(
                    "opening channel {}",
                    self.channel_name
                )))
            }
        };

        let events = match timeout(self.connect_timeout, session.subscribe()).await {
            Ok(Ok(events)) => events,
            Ok(Err(e)) => {
                session.close().await;
                return Err(e);
            }
            Err(_) => {
                session.close().await;
                return Err(Error::Timeout(format!(
                    "subscribing to channel {}",
                    self.channel_name
                )));
            }
        };

        self.session = Some(session);
        self.events = Some(events);
        debug!(
            channel = %self.channel_name,
            "Channel session created, awaiting subscription acknowledgement"
        );
        Ok(())
    }

    /// Subscription acknowledged. Returns `true` if this moved us to `Connected`.
    pub fn on_subscribed(&mut self) -> bool {
        if self.state() != ConnectionState::Connecting {
            debug!(
                channel = %self.channel_name,
                state = %self.state(),
                "Ignoring subscription acknowledgement"
            );
            return false;
        }

        self.connect_deadline = None;
        self.retry.reset();
        self.transition(ConnectionState::Connected)
    }

    /// A transport error, timeout, or silent disconnect.
    ///
    /// Only failures of a live or in-progress connection count. Once degraded,
    /// further callbacks from the same session are no-ops.
    pub fn on_transport_failure(&mut self, reason: &str, now: Instant) -> FailureOutcome {
        match self.state() {
            ConnectionState::Connecting | ConnectionState::Connected => {}
            state => {
                debug!(
                    channel = %self.channel_name,
                    state = %state,
                    reason,
                    "Ignoring transport failure"
                );
                return FailureOutcome::Ignored;
            }
        }

        self.connect_deadline = None;
        self.transition(ConnectionState::Degraded);

        let outcome = self.retry.record_failure(&self.policy, now);
        match outcome {
            FailureOutcome::RetryScheduled { attempt, delay } => {
                warn!(
                    channel = %self.channel_name,
                    reason,
                    attempt,
                    max_retries = self.policy.max_retries,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Channel degraded, reconnect scheduled"
                );
            }
            FailureOutcome::Exhausted { failures } => {
                error!(
                    channel = %self.channel_name,
                    reason,
                    failures,
                    "Channel degraded, retry budget exhausted"
                );
            }
            FailureOutcome::Ignored => {}
        }
        outcome
    }

    /// Earliest pending lifecycle deadline
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        match (self.connect_deadline, self.retry.next_attempt_at()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn take_due_timer(&mut self, now: Instant) -> Option<LifecycleTimer> {
        if self.connect_deadline.is_some_and(|at| at <= now) {
            self.connect_deadline = None;
            return Some(LifecycleTimer::ConnectTimeout);
        }
        if self.retry.take_due(now) {
            return Some(LifecycleTimer::Retry);
        }
        None
    }

    /// Start a new retry budget (forced reconnect)
    pub fn reset_retries(&mut self) {
        self.retry.reset();
    }

    /// Release the session unconditionally and close
    pub async fn stop(&mut self) {
        self.release_session().await;
        self.retry.reset();
        self.connect_deadline = None;
        self.transition(ConnectionState::Closed);
    }

    async fn release_session(&mut self) {
        self.events = None;
        if let Some(mut session) = self.session.take() {
            session.close().await;
            debug!(channel = %self.channel_name, "Released channel session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::events::StatusMessage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct StubTransport {
        fail_open: AtomicBool,
        opened: AtomicUsize,
        closed: Arc<AtomicUsize>,
    }

    impl StubTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fail_open: AtomicBool::new(false),
                opened: AtomicUsize::new(0),
                closed: Arc::new(AtomicUsize::new(0)),
            })
        }
    }

    struct StubSession {
        closed: Arc<AtomicUsize>,
        _events: Option<mpsc::Sender<SessionEvent>>,
    }

    #[async_trait]
    impl PubSubTransport for StubTransport {
        async fn channel(&self, _name: &str, _config: ChannelConfig) -> Result<Box<dyn ChannelSession>> {
            if self.fail_open.load(Ordering::SeqCst) {
                return Err(Error::Transport("unavailable".to_string()));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(StubSession {
                closed: self.closed.clone(),
                _events: None,
            }))
        }
    }

    #[async_trait]
    impl ChannelSession for StubSession {
        async fn subscribe(&mut self) -> Result<mpsc::Receiver<SessionEvent>> {
            let (tx, rx) = mpsc::channel(8);
            self._events = Some(tx);
            Ok(rx)
        }

        async fn send(&self, _message: &StatusMessage) -> Result<()> {
            Ok(())
        }

        fn state(&self) -> SessionState {
            SessionState::Joining
        }

        async fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_secs(1),
            cap_delay: Duration::from_secs(5),
        }
    }

    fn manager(transport: Arc<StubTransport>, max_retries: u32) -> ChannelLifecycleManager {
        ChannelLifecycleManager::new(
            transport,
            &EventId::from("M1"),
            ChannelConfig {
                suppress_echo: true,
                presence_key: "T1".to_string(),
            },
            policy(max_retries),
            Duration::from_secs(10),
        )
    }

    #[test]
    fn test_transition_table() {
        use ConnectionState::*;

        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connecting.can_transition_to(Degraded));
        assert!(Connected.can_transition_to(Degraded));
        assert!(Degraded.can_transition_to(Connecting));
        assert!(Connected.can_transition_to(Closed));

        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Degraded.can_transition_to(Connected));
        assert!(!Closed.can_transition_to(Connecting));
        assert!(!Closed.can_transition_to(Closed));
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = policy(10);
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40), Duration::from_secs(5));
    }

    #[test]
    fn test_retry_state_exhausts_after_budget() {
        let policy = policy(3);
        let now = Instant::now();
        let mut retry = RetryState::default();

        assert!(matches!(
            retry.record_failure(&policy, now),
            FailureOutcome::RetryScheduled { attempt: 1, .. }
        ));
        assert!(matches!(
            retry.record_failure(&policy, now),
            FailureOutcome::RetryScheduled { attempt: 2, .. }
        ));
        assert_eq!(
            retry.record_failure(&policy, now),
            FailureOutcome::Exhausted { failures: 3 }
        );
        assert!(retry.next_attempt_at().is_none());
        assert_eq!(retry.record_failure(&policy, now), FailureOutcome::Ignored);

        retry.reset();
        assert_eq!(retry.failures(), 0);
        assert!(!retry.is_exhausted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_then_ack_connects_and_resets_budget() {
        let transport = StubTransport::new();
        let mut lifecycle = manager(transport.clone(), 3);

        lifecycle.start().await.unwrap();
        assert_eq!(lifecycle.state(), ConnectionState::Connecting);
        assert!(lifecycle.deadline().is_some());

        lifecycle.on_transport_failure("boom", Instant::now());
        assert_eq!(lifecycle.retry_state().failures(), 1);

        lifecycle.start().await.unwrap();
        assert!(lifecycle.on_subscribed());
        assert_eq!(lifecycle.state(), ConnectionState::Connected);
        assert_eq!(lifecycle.retry_state().failures(), 0);
        assert!(lifecycle.deadline().is_none());

        // Release-then-create: the first session was closed before the second opened
        assert_eq!(transport.opened.load(Ordering::SeqCst), 2);
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_while_degraded_is_ignored() {
        let transport = StubTransport::new();
        let mut lifecycle = manager(transport, 3);

        lifecycle.start().await.unwrap();
        let first = lifecycle.on_transport_failure("error", Instant::now());
        assert!(matches!(first, FailureOutcome::RetryScheduled { attempt: 1, .. }));

        // Same session reports Closed right after Error: one failure, not two
        let second = lifecycle.on_transport_failure("closed", Instant::now());
        assert_eq!(second, FailureOutcome::Ignored);
        assert_eq!(lifecycle.retry_state().failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_is_reported_to_caller() {
        let transport = StubTransport::new();
        transport.fail_open.store(true, Ordering::SeqCst);
        let mut lifecycle = manager(transport, 3);

        assert!(lifecycle.start().await.is_err());
        assert_eq!(lifecycle.state(), ConnectionState::Connecting);

        let outcome = lifecycle.on_transport_failure("unavailable", Instant::now());
        assert!(matches!(outcome, FailureOutcome::RetryScheduled { .. }));
        assert_eq!(lifecycle.state(), ConnectionState::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_timer_fires_once() {
        let transport = StubTransport::new();
        let mut lifecycle = manager(transport, 3);

        lifecycle.start().await.unwrap();
        let now = Instant::now();
        lifecycle.on_transport_failure("error", now);

        assert_eq!(lifecycle.take_due_timer(now), None);
        let later = now + Duration::from_secs(1);
        assert_eq!(lifecycle.take_due_timer(later), Some(LifecycleTimer::Retry));
        assert_eq!(lifecycle.take_due_timer(later), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_terminal() {
        let transport = StubTransport::new();
        let mut lifecycle = manager(transport.clone(), 3);

        lifecycle.start().await.unwrap();
        lifecycle.stop().await;

        assert_eq!(lifecycle.state(), ConnectionState::Closed);
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
        assert!(matches!(lifecycle.start().await, Err(Error::Released)));
        assert_eq!(
            lifecycle.on_transport_failure("late", Instant::now()),
            FailureOutcome::Ignored
        );
    }
}
