use futures::stream::StreamExt;
use livetrack_core::config::RedisConfig;
use parking_lot::RwLock;
use redis::{AsyncCommands, Client as RedisClient};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::StatusMessage;
use super::transport::{
    ChannelConfig, ChannelSession, PubSubTransport, SessionEvent, SessionState,
    SESSION_EVENT_BUFFER,
};
use crate::{Error, Result};

/// Wire wrapper around a status message.
///
/// The presence key lets a subscriber recognise (and skip) its own publishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEnvelope {
    pub presence_key: String,
    pub status: StatusMessage,
}

/// Redis Pub/Sub transport
///
/// Channel naming: `{channel_prefix}{name}`, e.g. `livetrack:event:M1`.
/// Every Redis round trip is bounded by the configured operation timeout.
pub struct RedisTransport {
    redis_client: RedisClient,
    channel_prefix: String,
    operation_timeout: Duration,
}

impl RedisTransport {
    pub fn new(config: &RedisConfig) -> Result<Self> {
        let redis_client = RedisClient::open(config.url.as_str())?;

        Ok(Self {
            redis_client,
            channel_prefix: config.channel_prefix.clone(),
            operation_timeout: config.operation_timeout(),
        })
    }

    #[must_use]
    pub fn redis_channel(&self, name: &str) -> String {
        format!("{}{}", self.channel_prefix, name)
    }
}

#[async_trait::async_trait]
impl PubSubTransport for RedisTransport {
    async fn channel(&self, name: &str, config: ChannelConfig) -> Result<Box<dyn ChannelSession>> {
        Ok(Box::new(RedisChannelSession {
            redis_client: self.redis_client.clone(),
            channel: self.redis_channel(name),
            config,
            operation_timeout: self.operation_timeout,
            state: Arc::new(RwLock::new(SessionState::Idle)),
            publisher: Mutex::new(None),
            cancel_token: CancellationToken::new(),
            subscriber: None,
        }))
    }
}

/// One Redis channel subscription plus a lazily opened publish connection
pub struct RedisChannelSession {
    redis_client: RedisClient,
    channel: String,
    config: ChannelConfig,
    operation_timeout: Duration,
    state: Arc<RwLock<SessionState>>,
    publisher: Mutex<Option<redis::aio::MultiplexedConnection>>,
    cancel_token: CancellationToken,
    subscriber: Option<JoinHandle<()>>,
}

#[async_trait::async_trait]
impl ChannelSession for RedisChannelSession {
    async fn subscribe(&mut self) -> Result<mpsc::Receiver<SessionEvent>> {
        if self.subscriber.is_some() {
            return Err(Error::Transport(format!(
                "{} is already subscribed",
                self.channel
            )));
        }

        let (events_tx, events_rx) = mpsc::channel(SESSION_EVENT_BUFFER);
        *self.state.write() = SessionState::Joining;

        let task = SubscriberTask {
            redis_client: self.redis_client.clone(),
            channel: self.channel.clone(),
            config: self.config.clone(),
            operation_timeout: self.operation_timeout,
            state: self.state.clone(),
            events: events_tx,
        };
        let cancel = self.cancel_token.clone();

        self.subscriber = Some(tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!(channel = %task.channel, "Redis subscriber task cancelled");
                }
                () = task.run() => {}
            }
        }));

        Ok(events_rx)
    }

    async fn send(&self, message: &StatusMessage) -> Result<()> {
        let envelope = StatusEnvelope {
            presence_key: self.config.presence_key.clone(),
            status: message.clone(),
        };
        let payload = serde_json::to_string(&envelope)?;

        let mut publisher = self.publisher.lock().await;
        if publisher.is_none() {
            let conn = timeout(
                self.operation_timeout,
                self.redis_client.get_multiplexed_async_connection(),
            )
            .await
            .map_err(|_| Error::Timeout("getting Redis connection for publishing".to_string()))??;
            *publisher = Some(conn);
        }
        let Some(conn) = publisher.as_mut() else {
            return Err(Error::Transport("publish connection unavailable".to_string()));
        };

        let result = timeout(
            self.operation_timeout,
            conn.publish::<_, _, usize>(&self.channel, &payload),
        )
        .await;

        match result {
            Ok(Ok(receivers)) => {
                debug!(
                    channel = %self.channel,
                    tracker_id = %message.tracker_id,
                    receivers,
                    "Published status message"
                );
                Ok(())
            }
            Ok(Err(e)) => {
                // Reconnect on next send
                *publisher = None;
                Err(e.into())
            }
            Err(_) => {
                *publisher = None;
                Err(Error::Timeout(format!("publishing to {}", self.channel)))
            }
        }
    }

    fn state(&self) -> SessionState {
        *self.state.read()
    }

    async fn close(&mut self) {
        self.cancel_token.cancel();
        if let Some(task) = self.subscriber.take() {
            if let Err(e) = task.await {
                warn!(channel = %self.channel, error = %e, "Redis subscriber task failed");
            }
        }
        *self.publisher.lock().await = None;
        *self.state.write() = SessionState::Closed;
        debug!(channel = %self.channel, "Closed Redis channel session");
    }
}

impl Drop for RedisChannelSession {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

struct SubscriberTask {
    redis_client: RedisClient,
    channel: String,
    config: ChannelConfig,
    operation_timeout: Duration,
    state: Arc<RwLock<SessionState>>,
    events: mpsc::Sender<SessionEvent>,
}

impl SubscriberTask {
    async fn run(&self) {
        let mut pubsub = match timeout(self.operation_timeout, self.redis_client.get_async_pubsub()).await {
            Ok(Ok(pubsub)) => pubsub,
            Ok(Err(e)) => {
                self.fail(SessionEvent::Error(format!(
                    "Failed to get Redis Pub/Sub connection: {e}"
                )))
                .await;
                return;
            }
            Err(_) => {
                self.fail(SessionEvent::TimedOut).await;
                return;
            }
        };

        match timeout(self.operation_timeout, pubsub.subscribe(&self.channel)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.fail(SessionEvent::Error(format!(
                    "Failed to subscribe to {}: {e}",
                    self.channel
                )))
                .await;
                return;
            }
            Err(_) => {
                self.fail(SessionEvent::TimedOut).await;
                return;
            }
        }

        *self.state.write() = SessionState::Joined;
        info!(channel = %self.channel, "Redis subscriber joined channel");
        if self.events.send(SessionEvent::Subscribed).await.is_err() {
            return;
        }

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, channel = %self.channel, "Invalid payload");
                    continue;
                }
            };

            let envelope = match serde_json::from_str::<StatusEnvelope>(&payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(
                        error = %e,
                        channel = %self.channel,
                        "Failed to deserialize status envelope"
                    );
                    continue;
                }
            };

            if self.config.suppress_echo && envelope.presence_key == self.config.presence_key {
                continue;
            }

            if self
                .events
                .send(SessionEvent::Message(envelope.status))
                .await
                .is_err()
            {
                // Consumer went away
                return;
            }
        }

        // Stream ended: the Redis connection was lost
        *self.state.write() = SessionState::Closed;
        warn!(channel = %self.channel, "Redis subscriber stream ended");
        let _ = self.events.send(SessionEvent::Closed).await;
    }

    async fn fail(&self, event: SessionEvent) {
        *self.state.write() = SessionState::Errored;
        warn!(channel = %self.channel, event = ?event, "Redis subscription failed");
        let _ = self.events.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::events::TrackerStatus;
    use livetrack_core::TrackerId;

    fn config(key: &str) -> ChannelConfig {
        ChannelConfig {
            suppress_echo: true,
            presence_key: key.to_string(),
        }
    }

    #[test]
    fn test_envelope_wire_format() {
        let envelope = StatusEnvelope {
            presence_key: "T1".to_string(),
            status: StatusMessage::new(TrackerId::from("T1"), TrackerStatus::Active),
        };

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["presenceKey"], "T1");
        assert_eq!(json["status"]["trackerId"], "T1");
        assert_eq!(json["status"]["status"], "active");
    }

    #[test]
    fn test_channel_prefix() {
        let transport = RedisTransport::new(&RedisConfig::default()).unwrap();
        assert_eq!(transport.redis_channel("event:M1"), "livetrack:event:M1");
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_publish_reaches_other_session_but_not_sender() {
        let transport = RedisTransport::new(&RedisConfig::default()).unwrap();

        let mut observer = transport.channel("event:test", config("observer")).await.unwrap();
        let mut tracker = transport.channel("event:test", config("T1")).await.unwrap();
        let mut observer_events = observer.subscribe().await.unwrap();
        let mut tracker_events = tracker.subscribe().await.unwrap();

        assert_eq!(observer_events.recv().await, Some(SessionEvent::Subscribed));
        assert_eq!(tracker_events.recv().await, Some(SessionEvent::Subscribed));
        assert_eq!(tracker.state(), SessionState::Joined);

        let message = StatusMessage::new(TrackerId::from("T1"), TrackerStatus::Recording);
        tracker.send(&message).await.unwrap();

        let received = timeout(Duration::from_secs(2), observer_events.recv())
            .await
            .unwrap();
        assert_eq!(received, Some(SessionEvent::Message(message)));
        assert!(timeout(Duration::from_millis(300), tracker_events.recv())
            .await
            .is_err());

        tracker.close().await;
        observer.close().await;
        assert_eq!(tracker.state(), SessionState::Closed);
    }
}
