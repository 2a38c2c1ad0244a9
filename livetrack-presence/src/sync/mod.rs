//! Realtime presence for one live event
//!
//! A [`PresenceCoordinator`] joins the event's pub/sub channel, announces this
//! tracker, rate-limits its status broadcasts, and keeps a roster of every
//! tracker on the event reconciled by last-write-wins.

pub mod coordinator;
pub mod events;
pub mod heartbeat;
pub mod lifecycle;
pub mod redis_pubsub;
pub mod roster;
pub mod throttle;
pub mod transport;

pub use coordinator::{CoordinatorStats, PresenceCoordinator, SendOutcome};
pub use events::{
    is_lifecycle_action, NetworkQuality, StatusMessage, TrackerStatus, CONNECTED_ACTION,
    DISCONNECTED_ACTION,
};
pub use heartbeat::{HeartbeatMonitor, HeartbeatStats, HeartbeatVerdict};
pub use lifecycle::{ChannelLifecycleManager, ConnectionState, FailureOutcome, RetryPolicy, RetryState};
pub use redis_pubsub::{RedisChannelSession, RedisTransport, StatusEnvelope};
pub use roster::{MergeOutcome, PresenceReconciler, TrackerRecord};
pub use throttle::{Admission, BroadcastThrottler, ThrottleStats};
pub use transport::{ChannelConfig, ChannelSession, PubSubTransport, SessionEvent, SessionState};
