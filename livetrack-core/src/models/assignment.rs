use serde::{Deserialize, Serialize};

use super::id::TrackerId;

/// A tracker assigned to a live event, as recorded by the planning side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerAssignment {
    pub tracker_id: TrackerId,
    /// Human-facing name shown in dashboards
    pub display_identity: Option<String>,
}

impl TrackerAssignment {
    #[must_use]
    pub fn new(tracker_id: impl Into<TrackerId>, display_identity: Option<String>) -> Self {
        Self {
            tracker_id: tracker_id.into(),
            display_identity,
        }
    }
}
