pub mod error;
pub mod sync;

pub use error::{Error, Result};
pub use sync::{
    ConnectionState, CoordinatorStats, PresenceCoordinator, RedisTransport, SendOutcome,
    StatusMessage, TrackerRecord, TrackerStatus,
};
