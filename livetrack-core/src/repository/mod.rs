pub mod assignment;
pub mod pool;

pub use assignment::{AssignmentRepository, StaticRoster};
pub use pool::connect;

use async_trait::async_trait;

use crate::models::{EventId, TrackerAssignment};
use crate::Result;

/// Source of the tracker assignments for a live event.
///
/// The presence coordinator queries this once at startup to seed its roster.
#[async_trait]
pub trait RosterRepository: Send + Sync {
    async fn assigned_trackers(&self, event_id: &EventId) -> Result<Vec<TrackerAssignment>>;
}
