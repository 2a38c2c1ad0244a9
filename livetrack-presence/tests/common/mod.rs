//! Scriptable in-memory transport shared by the integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use livetrack_core::config::PresenceConfig;
use livetrack_core::repository::StaticRoster;
use livetrack_core::{EventId, TrackerAssignment, TrackerId};
use livetrack_presence::sync::{
    ChannelConfig, ChannelSession, PubSubTransport, SessionEvent, SessionState, StatusMessage,
};
use livetrack_presence::{Error, PresenceCoordinator, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;

struct LiveSession {
    id: usize,
    events: mpsc::Sender<SessionEvent>,
    state: Arc<Mutex<SessionState>>,
}

#[derive(Default)]
struct Inner {
    manual_ack: AtomicBool,
    fail_channel: AtomicBool,
    hang_channel: AtomicBool,
    fail_send: AtomicBool,
    channels_opened: AtomicUsize,
    sessions_closed: AtomicUsize,
    sent: Mutex<Vec<StatusMessage>>,
    configs: Mutex<Vec<(String, ChannelConfig)>>,
    current: Mutex<Option<LiveSession>>,
}

/// Transport whose sessions are driven from the test body
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Inner>,
}

impl MockTransport {
    /// Sessions acknowledge their subscription immediately
    pub fn new() -> Self {
        Self::default()
    }

    /// Sessions wait for [`Self::ack`]
    pub fn manual() -> Self {
        let transport = Self::default();
        transport.inner.manual_ack.store(true, Ordering::SeqCst);
        transport
    }

    pub fn set_fail_channel(&self, fail: bool) {
        self.inner.fail_channel.store(fail, Ordering::SeqCst);
    }

    /// Opening a channel never completes
    pub fn set_hang_channel(&self, hang: bool) {
        self.inner.hang_channel.store(hang, Ordering::SeqCst);
    }

    pub fn set_fail_send(&self, fail: bool) {
        self.inner.fail_send.store(fail, Ordering::SeqCst);
    }

    /// Push an event to the current session; false if there is none
    pub fn emit(&self, event: SessionEvent) -> bool {
        let current = self.inner.current.lock();
        current
            .as_ref()
            .is_some_and(|session| session.events.try_send(event).is_ok())
    }

    pub fn ack(&self) -> bool {
        self.set_session_state(SessionState::Joined);
        self.emit(SessionEvent::Subscribed)
    }

    /// Change what the current session reports about itself, without any event
    pub fn set_session_state(&self, state: SessionState) {
        if let Some(session) = self.inner.current.lock().as_ref() {
            *session.state.lock() = state;
        }
    }

    pub fn channels_opened(&self) -> usize {
        self.inner.channels_opened.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> usize {
        self.inner.sessions_closed.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<StatusMessage> {
        self.inner.sent.lock().clone()
    }

    pub fn channel_configs(&self) -> Vec<(String, ChannelConfig)> {
        self.inner.configs.lock().clone()
    }
}

#[async_trait]
impl PubSubTransport for MockTransport {
    async fn channel(&self, name: &str, config: ChannelConfig) -> Result<Box<dyn ChannelSession>> {
        if self.inner.fail_channel.load(Ordering::SeqCst) {
            return Err(Error::Transport("channel unavailable".to_string()));
        }
        if self.inner.hang_channel.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let id = self.inner.channels_opened.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.configs.lock().push((name.to_string(), config));

        Ok(Box::new(MockSession {
            id,
            inner: self.inner.clone(),
            state: Arc::new(Mutex::new(SessionState::Idle)),
            closed: false,
        }))
    }
}

struct MockSession {
    id: usize,
    inner: Arc<Inner>,
    state: Arc<Mutex<SessionState>>,
    closed: bool,
}

#[async_trait]
impl ChannelSession for MockSession {
    async fn subscribe(&mut self) -> Result<mpsc::Receiver<SessionEvent>> {
        let (events, rx) = mpsc::channel(64);
        *self.state.lock() = SessionState::Joining;

        if !self.inner.manual_ack.load(Ordering::SeqCst) {
            *self.state.lock() = SessionState::Joined;
            let _ = events.try_send(SessionEvent::Subscribed);
        }

        *self.inner.current.lock() = Some(LiveSession {
            id: self.id,
            events,
            state: self.state.clone(),
        });
        Ok(rx)
    }

    async fn send(&self, message: &StatusMessage) -> Result<()> {
        if self.inner.fail_send.load(Ordering::SeqCst) {
            return Err(Error::Transport("send rejected".to_string()));
        }
        self.inner.sent.lock().push(message.clone());
        Ok(())
    }

    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        *self.state.lock() = SessionState::Closed;
        self.inner.sessions_closed.fetch_add(1, Ordering::SeqCst);

        let mut current = self.inner.current.lock();
        if current.as_ref().is_some_and(|session| session.id == self.id) {
            *current = None;
        }
    }
}

pub fn event_id() -> EventId {
    EventId::from("M1")
}

pub fn assignments() -> StaticRoster {
    StaticRoster::new().with_event(
        event_id(),
        vec![
            TrackerAssignment::new("T1", Some("Alice".to_string())),
            TrackerAssignment::new("T2", Some("Bruno".to_string())),
        ],
    )
}

/// Short retry delays, everything else default
pub fn test_config() -> PresenceConfig {
    PresenceConfig {
        max_retries: 3,
        retry_base_delay_ms: 1_000,
        retry_cap_delay_ms: 4_000,
        ..PresenceConfig::default()
    }
}

pub async fn start_tracker(transport: &MockTransport, config: &PresenceConfig) -> PresenceCoordinator {
    PresenceCoordinator::start(
        Arc::new(transport.clone()),
        &assignments(),
        config,
        event_id(),
        Some(TrackerId::from("T1")),
    )
    .await
}

pub async fn start_observer(transport: &MockTransport, config: &PresenceConfig) -> PresenceCoordinator {
    PresenceCoordinator::start(
        Arc::new(transport.clone()),
        &assignments(),
        config,
        event_id(),
        None,
    )
    .await
}

/// Let the driver process whatever is queued. Under a paused clock this
/// also advances time by `ms`.
pub async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}
