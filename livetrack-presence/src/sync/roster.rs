use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use livetrack_core::{EventId, RosterRepository, TrackerAssignment, TrackerId};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::events::{is_lifecycle_action, NetworkQuality, StatusMessage, TrackerStatus};
use crate::Result;

/// Buffer for roster change notifications; slow observers see `Lagged`
pub const ROSTER_CHANGE_BUFFER: usize = 256;

/// One tracker as currently known to this process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerRecord {
    pub tracker_id: TrackerId,
    pub display_identity: Option<String>,
    pub status: TrackerStatus,
    /// Timestamp of the newest applied message; `None` until first heard from
    pub last_activity: Option<DateTime<Utc>>,
    pub current_action: Option<String>,
    pub battery_level: Option<u8>,
    pub network_quality: Option<NetworkQuality>,
    /// Reported actions by name. The coordinator's own `connected` and
    /// `disconnected` markers are not counted; any other action string is.
    pub event_counts: BTreeMap<String, u64>,
}

impl TrackerRecord {
    fn seeded(assignment: TrackerAssignment) -> Self {
        Self {
            tracker_id: assignment.tracker_id,
            display_identity: assignment.display_identity,
            status: TrackerStatus::Inactive,
            last_activity: None,
            current_action: None,
            battery_level: None,
            network_quality: None,
            event_counts: BTreeMap::new(),
        }
    }

    fn from_message(message: &StatusMessage) -> Self {
        let mut record = Self::seeded(TrackerAssignment::new(message.tracker_id.clone(), None));
        record.apply(message, true);
        record
    }

    fn apply(&mut self, message: &StatusMessage, newer: bool) {
        self.status = message.status;
        self.last_activity = Some(message.timestamp);
        self.current_action.clone_from(&message.action);
        self.battery_level = message.battery_level;
        self.network_quality = message.network_quality;

        if newer {
            let counted = message
                .action
                .as_deref()
                .filter(|action| !is_lifecycle_action(action));
            if let Some(action) = counted {
                *self.event_counts.entry(action.to_string()).or_insert(0) += 1;
            }
        }
    }
}

/// How a merge was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated,
    /// Older than what we already have; ignored
    Stale,
}

/// Roster of trackers for one event, reconciled by last-write-wins on the
/// message timestamp.
///
/// Cloning is cheap and shares the roster; the driver writes, handles read.
#[derive(Clone)]
pub struct PresenceReconciler {
    records: Arc<DashMap<TrackerId, TrackerRecord>>,
    changes: broadcast::Sender<TrackerRecord>,
}

impl PresenceReconciler {
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(ROSTER_CHANGE_BUFFER);
        Self {
            records: Arc::new(DashMap::new()),
            changes,
        }
    }

    /// Merge a status message, local or remote.
    ///
    /// Equal timestamps re-apply the fields (duplicate delivery) but do not
    /// count the action again.
    pub fn merge(&self, message: &StatusMessage) -> MergeOutcome {
        let (outcome, record) = match self.records.entry(message.tracker_id.clone()) {
            Entry::Vacant(entry) => {
                let record = TrackerRecord::from_message(message);
                entry.insert(record.clone());
                (MergeOutcome::Inserted, record)
            }
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                if record
                    .last_activity
                    .is_some_and(|last| message.timestamp < last)
                {
                    debug!(
                        tracker_id = %message.tracker_id,
                        timestamp = %message.timestamp,
                        "Ignoring stale status message"
                    );
                    return MergeOutcome::Stale;
                }

                let newer = record
                    .last_activity
                    .is_none_or(|last| message.timestamp > last);
                record.apply(message, newer);
                (MergeOutcome::Updated, record.clone())
            }
        };

        debug!(
            tracker_id = %record.tracker_id,
            status = %record.status,
            outcome = ?outcome,
            "Merged status message"
        );
        // No observers is fine
        let _ = self.changes.send(record);
        outcome
    }

    /// Add an `inactive` record for an assignment unless the tracker is
    /// already known. Returns whether a record was inserted.
    pub fn seed(&self, assignment: TrackerAssignment) -> bool {
        match self.records.entry(assignment.tracker_id.clone()) {
            Entry::Vacant(entry) => {
                let record = TrackerRecord::seeded(assignment);
                entry.insert(record.clone());
                let _ = self.changes.send(record);
                true
            }
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                if record.display_identity.is_none() {
                    record.display_identity = assignment.display_identity;
                }
                false
            }
        }
    }

    /// Seed the roster from the event's assignments
    pub async fn load_initial_roster(
        &self,
        repository: &dyn RosterRepository,
        event_id: &EventId,
    ) -> Result<usize> {
        let assignments = repository.assigned_trackers(event_id).await?;
        let total = assignments.len();
        let seeded = assignments
            .into_iter()
            .map(|assignment| self.seed(assignment))
            .filter(|inserted| *inserted)
            .count();

        info!(
            event_id = %event_id,
            assignments = total,
            seeded,
            "Loaded initial roster"
        );
        Ok(seeded)
    }

    #[must_use]
    pub fn get(&self, tracker_id: &TrackerId) -> Option<TrackerRecord> {
        self.records.get(tracker_id).map(|r| r.value().clone())
    }

    /// All records, sorted by tracker id
    #[must_use]
    pub fn snapshot(&self) -> Vec<TrackerRecord> {
        let mut records: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.tracker_id.cmp(&b.tracker_id));
        records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn count_by_status(&self) -> HashMap<TrackerStatus, usize> {
        let mut counts = HashMap::new();
        for record in self.records.iter() {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        counts
    }

    /// Receive every record change after this call
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TrackerRecord> {
        self.changes.subscribe()
    }
}

impl Default for PresenceReconciler {
    fn default() -> Self {
        Self::new()
    }
}
