//! Publish/subscribe transport seam
//!
//! The coordinator depends only on this contract: open a named channel,
//! subscribe to its event stream, publish status messages, ask the session how
//! it thinks it is doing, and close it. Delivery is at-most-once and
//! unordered; nothing here promises more.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::events::StatusMessage;
use crate::Result;

/// Buffer size for a session's event stream
pub const SESSION_EVENT_BUFFER: usize = 256;

/// State a session reports about itself, independent of pushed events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Joining,
    Joined,
    Errored,
    Closed,
}

/// Everything a session pushes to its subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The subscription was acknowledged
    Subscribed,
    Error(String),
    TimedOut,
    Closed,
    Message(StatusMessage),
}

/// Per-channel options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Do not deliver this session's own publishes back to it
    pub suppress_echo: bool,
    /// Identity of this participant on the channel
    pub presence_key: String,
}

/// A pub/sub backend able to open channels
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    async fn channel(&self, name: &str, config: ChannelConfig) -> Result<Box<dyn ChannelSession>>;
}

/// One subscription on one channel
#[async_trait]
pub trait ChannelSession: Send + Sync {
    /// Start the subscription. Acknowledgement, failures, and inbound
    /// messages all arrive on the returned receiver.
    async fn subscribe(&mut self) -> Result<mpsc::Receiver<SessionEvent>>;

    /// Publish a status message; `Ok` means the transport acknowledged it.
    async fn send(&self, message: &StatusMessage) -> Result<()>;

    fn state(&self) -> SessionState;

    async fn close(&mut self);
}
