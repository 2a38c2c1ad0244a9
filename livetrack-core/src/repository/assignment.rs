use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, Row};
use std::collections::HashMap;

use super::RosterRepository;
use crate::{
    models::{EventId, TrackerAssignment, TrackerId},
    Result,
};

/// Tracker assignment repository backed by Postgres
#[derive(Clone)]
pub struct AssignmentRepository {
    pool: PgPool,
}

impl AssignmentRepository {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_assignment(row: &PgRow) -> Result<TrackerAssignment> {
        Ok(TrackerAssignment {
            tracker_id: TrackerId::from_string(row.try_get("tracker_id")?),
            display_identity: row.try_get("display_name")?,
        })
    }
}

#[async_trait]
impl RosterRepository for AssignmentRepository {
    async fn assigned_trackers(&self, event_id: &EventId) -> Result<Vec<TrackerAssignment>> {
        let rows = sqlx::query(
            "SELECT DISTINCT ON (tracker_id) tracker_id, display_name
             FROM tracker_assignments
             WHERE event_id = $1
             ORDER BY tracker_id, assigned_at DESC",
        )
        .bind(event_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_assignment).collect()
    }
}

/// Fixed assignment lists keyed by event, for hosts that already hold the
/// roster (observer dashboards fed from an API response, local sessions).
#[derive(Debug, Clone, Default)]
pub struct StaticRoster {
    events: HashMap<EventId, Vec<TrackerAssignment>>,
}

impl StaticRoster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_event(mut self, event_id: EventId, assignments: Vec<TrackerAssignment>) -> Self {
        self.events.insert(event_id, assignments);
        self
    }
}

#[async_trait]
impl RosterRepository for StaticRoster {
    async fn assigned_trackers(&self, event_id: &EventId) -> Result<Vec<TrackerAssignment>> {
        Ok(self.events.get(event_id).cloned().unwrap_or_default())
    }
}
