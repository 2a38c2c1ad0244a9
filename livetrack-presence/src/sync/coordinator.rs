//! Presence coordinator: handle and driver task
//!
//! All coordinator state lives in a single driver task that owns the lifecycle
//! manager, heartbeat monitor, throttler and the write side of the roster.
//! The [`PresenceCoordinator`] handle talks to it over a command channel and
//! reads connection state, roster and last error directly.
//!
//! Releasing is idempotent. The first of `release()` or `Drop` cancels the
//! driver, which then runs its teardown exactly once: a best-effort
//! `inactive` broadcast followed by closing the session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use livetrack_core::config::PresenceConfig;
use livetrack_core::models::generate_id;
use livetrack_core::{EventId, RosterRepository, TrackerId};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{StatusMessage, TrackerStatus, CONNECTED_ACTION, DISCONNECTED_ACTION};
use super::heartbeat::{HeartbeatMonitor, HeartbeatStats, HeartbeatVerdict};
use super::lifecycle::{
    ChannelLifecycleManager, ConnectionState, FailureOutcome, LifecycleTimer, RetryPolicy,
};
use super::roster::{PresenceReconciler, TrackerRecord};
use super::throttle::{Admission, BroadcastThrottler, ThrottleStats};
use super::transport::{ChannelConfig, PubSubTransport, SessionEvent};
use crate::{Error, Result};

/// What happened to a status update handed to [`PresenceCoordinator::send`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Acknowledged by the transport
    Sent,
    /// Held back; the latest held update goes out when the throttle window ends
    Coalesced,
    /// Discarded by the throttle window
    Dropped,
    NotConnected,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub connection_state: ConnectionState,
    pub throttle: ThrottleStats,
    pub heartbeat: HeartbeatStats,
    /// Consecutive transport failures in the current retry budget
    pub retry_failures: u32,
    pub connect_attempts: u64,
    pub messages_received: u64,
    pub roster_size: usize,
}

enum Command {
    Send {
        message: StatusMessage,
        reply: oneshot::Sender<SendOutcome>,
    },
    ForceReconnect {
        reply: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<CoordinatorStats>,
    },
}

/// Why the driver loop woke up
enum Wake {
    Cancelled,
    Command(Command),
    Session(Option<SessionEvent>),
    Timer,
}

/// Handle to a running presence coordinator for one event
pub struct PresenceCoordinator {
    event_id: EventId,
    self_id: Option<TrackerId>,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    roster: PresenceReconciler,
    last_error: Arc<RwLock<Option<String>>>,
    cancel_token: CancellationToken,
    released: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceCoordinator {
    /// Load the initial roster, spawn the driver and start connecting.
    ///
    /// Pass `self_id` when this process is a tracker; without it the
    /// coordinator only observes. A failed roster load is recorded in
    /// [`Self::last_error`] and does not prevent connecting.
    pub async fn start(
        transport: Arc<dyn PubSubTransport>,
        repository: &dyn RosterRepository,
        config: &PresenceConfig,
        event_id: EventId,
        self_id: Option<TrackerId>,
    ) -> Self {
        let roster = PresenceReconciler::new();
        let last_error = Arc::new(RwLock::new(None));

        if let Err(e) = roster.load_initial_roster(repository, &event_id).await {
            warn!(event_id = %event_id, error = %e, "Failed to load initial roster");
            *last_error.write() = Some(format!("Failed to load initial roster: {e}"));
        }

        let presence_key = self_id
            .as_ref()
            .map_or_else(generate_id, ToString::to_string);
        let lifecycle = ChannelLifecycleManager::new(
            transport,
            &event_id,
            ChannelConfig {
                suppress_echo: true,
                presence_key,
            },
            RetryPolicy::from_config(config),
            config.connect_timeout(),
        );
        let state = lifecycle.subscribe_state();

        let (commands, command_rx) = mpsc::channel(config.command_buffer.max(1));
        let cancel_token = CancellationToken::new();

        let driver = Driver {
            event_id: event_id.clone(),
            self_id: self_id.clone(),
            lifecycle,
            heartbeat: HeartbeatMonitor::new(config.heartbeat_interval()),
            throttler: BroadcastThrottler::from_config(config),
            roster: roster.clone(),
            last_error: last_error.clone(),
            send_timeout: config.send_timeout(),
            cancel_token: cancel_token.clone(),
            connect_attempts: 0,
            messages_received: 0,
        };

        info!(
            event_id = %event_id,
            tracker_id = ?self_id.as_ref().map(TrackerId::as_str),
            "Starting presence coordinator"
        );
        let handle = tokio::spawn(driver.run(command_rx));

        Self {
            event_id,
            self_id,
            commands,
            state,
            roster,
            last_error,
            cancel_token,
            released: AtomicBool::new(false),
            driver: Mutex::new(Some(handle)),
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.released.load(Ordering::Acquire) {
            return Err(Error::Released);
        }
        Ok(())
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        self.ensure_live()?;
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| Error::DriverGone)?;
        rx.await.map_err(|_| Error::DriverGone)
    }

    /// Broadcast a status update, subject to throttling.
    ///
    /// Transport trouble is reported through the outcome, never as `Err`.
    pub async fn send(&self, message: StatusMessage) -> Result<SendOutcome> {
        self.request(|reply| Command::Send { message, reply }).await
    }

    /// Broadcast a fresh status for this tracker
    pub async fn update_status(
        &self,
        status: TrackerStatus,
        action: Option<String>,
    ) -> Result<SendOutcome> {
        let tracker_id = self.self_id.clone().ok_or(Error::NotATracker)?;
        let mut message = StatusMessage::new(tracker_id, status);
        if let Some(action) = action {
            message = message.with_action(action);
        }
        self.send(message).await
    }

    /// Start a new retry budget and make one connection attempt now
    pub async fn force_reconnect(&self) -> Result<()> {
        self.request(|reply| Command::ForceReconnect { reply }).await
    }

    pub async fn stats(&self) -> Result<CoordinatorStats> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Stop the coordinator and wait for its teardown. Safe to call repeatedly.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel_token.cancel();

        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                warn!(event_id = %self.event_id, error = %e, "Presence driver task failed");
            }
        }
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Current roster, sorted by tracker id
    #[must_use]
    pub fn roster(&self) -> Vec<TrackerRecord> {
        self.roster.snapshot()
    }

    #[must_use]
    pub fn tracker(&self, tracker_id: &TrackerId) -> Option<TrackerRecord> {
        self.roster.get(tracker_id)
    }

    #[must_use]
    pub fn subscribe_roster(&self) -> broadcast::Receiver<TrackerRecord> {
        self.roster.subscribe()
    }

    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    #[must_use]
    pub const fn event_id(&self) -> &EventId {
        &self.event_id
    }

    #[must_use]
    pub const fn self_id(&self) -> Option<&TrackerId> {
        self.self_id.as_ref()
    }
}

impl Drop for PresenceCoordinator {
    fn drop(&mut self) {
        // The driver keeps running just long enough to tear down
        if !self.released.swap(true, Ordering::AcqRel) {
            self.cancel_token.cancel();
        }
    }
}

struct Driver {
    event_id: EventId,
    self_id: Option<TrackerId>,
    lifecycle: ChannelLifecycleManager,
    heartbeat: HeartbeatMonitor,
    throttler: BroadcastThrottler,
    roster: PresenceReconciler,
    last_error: Arc<RwLock<Option<String>>>,
    send_timeout: Duration,
    cancel_token: CancellationToken,
    connect_attempts: u64,
    messages_received: u64,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        self.connect().await;

        loop {
            let deadline = self.next_deadline();
            let wake = tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => Wake::Cancelled,
                command = commands.recv() => match command {
                    Some(command) => Wake::Command(command),
                    None => Wake::Cancelled,
                },
                event = recv_event(self.lifecycle.events_mut()) => Wake::Session(event),
                () = sleep_until_opt(deadline) => Wake::Timer,
            };

            match wake {
                Wake::Cancelled => break,
                Wake::Command(command) => self.handle_command(command).await,
                Wake::Session(Some(event)) => self.handle_session_event(event).await,
                Wake::Session(None) => {
                    self.lifecycle.drop_events();
                    self.handle_failure("Channel event stream ended");
                }
                Wake::Timer => self.run_timers().await,
            }
        }

        self.teardown().await;
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.lifecycle.deadline(),
            self.heartbeat.deadline(),
            self.throttler.deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    async fn connect(&mut self) {
        self.heartbeat.disarm();
        self.connect_attempts += 1;
        debug!(
            event_id = %self.event_id,
            attempt = self.connect_attempts,
            "Opening presence channel"
        );

        // Opening can take up to two connect timeouts; release must not wait on it
        let started = tokio::select! {
            biased;
            () = self.cancel_token.cancelled() => {
                debug!(event_id = %self.event_id, "Abandoning channel open on release");
                return;
            }
            started = self.lifecycle.start() => started,
        };

        match started {
            Ok(()) | Err(Error::Released) => {}
            Err(e) => self.handle_failure(&format!("Failed to open channel: {e}")),
        }
    }

    fn handle_failure(&mut self, reason: &str) {
        let outcome = self.lifecycle.on_transport_failure(reason, Instant::now());
        if outcome != FailureOutcome::Ignored {
            self.heartbeat.disarm();
            self.set_last_error(reason.to_string());
        }
    }

    fn set_last_error(&self, error: String) {
        *self.last_error.write() = Some(error);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send { message, reply } => {
                let outcome = self.dispatch(message).await;
                let _ = reply.send(outcome);
            }
            Command::ForceReconnect { reply } => {
                info!(event_id = %self.event_id, "Forced reconnect requested");
                self.lifecycle.reset_retries();
                self.connect().await;
                let _ = reply.send(());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Subscribed => {
                if self.lifecycle.on_subscribed() {
                    self.heartbeat.arm(Instant::now());
                    self.announce().await;
                }
            }
            SessionEvent::Error(reason) => {
                self.handle_failure(&format!("Channel error: {reason}"));
            }
            SessionEvent::TimedOut => self.handle_failure("Channel timed out"),
            SessionEvent::Closed => self.handle_failure("Channel closed"),
            SessionEvent::Message(message) => {
                if self.lifecycle.state() != ConnectionState::Connected {
                    debug!(
                        tracker_id = %message.tracker_id,
                        "Ignoring inbound status while not connected"
                    );
                    return;
                }
                self.messages_received += 1;
                self.roster.merge(&message);
            }
        }
    }

    async fn announce(&mut self) {
        let Some(tracker_id) = self.self_id.clone() else {
            return;
        };
        let message =
            StatusMessage::new(tracker_id, TrackerStatus::Active).with_action(CONNECTED_ACTION);
        let outcome = self.dispatch(message).await;
        debug!(event_id = %self.event_id, outcome = ?outcome, "Announced presence");
    }

    async fn dispatch(&mut self, message: StatusMessage) -> SendOutcome {
        if self.lifecycle.state() != ConnectionState::Connected {
            debug!(
                tracker_id = %message.tracker_id,
                state = %self.lifecycle.state(),
                "Not connected, status update not sent"
            );
            return SendOutcome::NotConnected;
        }

        match self.throttler.admit(message, Instant::now()) {
            Admission::Send(message) => self.deliver(message).await,
            Admission::Coalesced { .. } => SendOutcome::Coalesced,
            Admission::Dropped => SendOutcome::Dropped,
        }
    }

    async fn deliver(&mut self, message: StatusMessage) -> SendOutcome {
        let Some(session) = self.lifecycle.session() else {
            return SendOutcome::NotConnected;
        };

        let error = match timeout(self.send_timeout, session.send(&message)).await {
            Ok(Ok(())) => {
                self.throttler.record_sent(Instant::now());
                // Optimistic: visible locally before any remote echo
                self.roster.merge(&message);
                return SendOutcome::Sent;
            }
            Ok(Err(e)) => format!("Failed to send status: {e}"),
            Err(_) => "Timed out sending status".to_string(),
        };

        self.throttler.record_failed();
        warn!(
            event_id = %self.event_id,
            tracker_id = %message.tracker_id,
            error = %error,
            "Status broadcast failed"
        );
        self.set_last_error(error.clone());
        SendOutcome::Failed(error)
    }

    async fn run_timers(&mut self) {
        let now = Instant::now();

        match self.lifecycle.take_due_timer(now) {
            Some(LifecycleTimer::Retry) => self.connect().await,
            Some(LifecycleTimer::ConnectTimeout) => {
                self.handle_failure("Subscription was not acknowledged in time");
            }
            None => {}
        }

        if self.heartbeat.is_due(now) {
            let verdict =
                self.heartbeat
                    .check(self.lifecycle.state(), self.lifecycle.session_state(), now);
            if let HeartbeatVerdict::Silent(session_state) = verdict {
                self.handle_failure(&format!(
                    "Heartbeat found session {session_state:?} while connected"
                ));
            }
        }

        if let Some(message) = self.throttler.take_due(now) {
            if self.lifecycle.state() == ConnectionState::Connected {
                let outcome = self.deliver(message).await;
                debug!(outcome = ?outcome, "Flushed coalesced status update");
            } else {
                debug!(
                    tracker_id = %message.tracker_id,
                    "Discarding coalesced status update while not connected"
                );
            }
        }
    }

    fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            connection_state: self.lifecycle.state(),
            throttle: self.throttler.stats(),
            heartbeat: self.heartbeat.stats(),
            retry_failures: self.lifecycle.retry_state().failures(),
            connect_attempts: self.connect_attempts,
            messages_received: self.messages_received,
            roster_size: self.roster.len(),
        }
    }

    async fn teardown(&mut self) {
        self.heartbeat.disarm();

        if let (Some(tracker_id), ConnectionState::Connected) =
            (self.self_id.clone(), self.lifecycle.state())
        {
            if let Some(session) = self.lifecycle.session() {
                let message = StatusMessage::new(tracker_id, TrackerStatus::Inactive)
                    .with_action(DISCONNECTED_ACTION);
                match timeout(self.send_timeout, session.send(&message)).await {
                    Ok(Ok(())) => {
                        self.roster.merge(&message);
                        debug!(event_id = %self.event_id, "Announced departure");
                    }
                    Ok(Err(e)) => {
                        debug!(event_id = %self.event_id, error = %e, "Departure broadcast failed");
                    }
                    Err(_) => {
                        debug!(event_id = %self.event_id, "Departure broadcast timed out");
                    }
                }
            }
        }

        self.lifecycle.stop().await;
        info!(event_id = %self.event_id, "Presence coordinator released");
    }
}

async fn recv_event(events: &mut Option<mpsc::Receiver<SessionEvent>>) -> Option<SessionEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
