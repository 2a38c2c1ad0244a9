use chrono::{DateTime, Utc};
use livetrack_core::TrackerId;
use serde::{Deserialize, Serialize};

/// Words in an action that mark a freshly established or ready connection.
const CRITICAL_ACTION_WORDS: &[&str] = &["connected", "ready", "joined"];

/// Action carried by the announcement sent once a subscription is acknowledged
pub const CONNECTED_ACTION: &str = "connected";
/// Action carried by the departure broadcast on release
pub const DISCONNECTED_ACTION: &str = "disconnected";

/// Whether `action` is one the coordinator emits on its own around a session,
/// as opposed to something the tracker reported.
#[must_use]
pub fn is_lifecycle_action(action: &str) -> bool {
    action == CONNECTED_ACTION || action == DISCONNECTED_ACTION
}

/// Tracker status as shown to other trackers and observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerStatus {
    Active,
    Inactive,
    Recording,
}

impl TrackerStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Recording => "recording",
        }
    }
}

impl std::fmt::Display for TrackerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-reported link quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    Excellent,
    Good,
    Poor,
}

/// One status broadcast from a tracker.
///
/// Built fresh for every broadcast; the builder methods consume `self`.
/// Serialized with camelCase keys so browser clients on the same channel can
/// read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    pub tracker_id: TrackerId,
    pub status: TrackerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Battery percentage, 0-100
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_quality: Option<NetworkQuality>,
}

impl StatusMessage {
    /// Create a status message stamped with the current time
    #[must_use]
    pub fn new(tracker_id: TrackerId, status: TrackerStatus) -> Self {
        Self {
            tracker_id,
            status,
            action: None,
            timestamp: Utc::now(),
            battery_level: None,
            network_quality: None,
        }
    }

    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    #[must_use]
    pub fn with_battery_level(mut self, level: u8) -> Self {
        self.battery_level = Some(level.min(100));
        self
    }

    #[must_use]
    pub fn with_network_quality(mut self, quality: NetworkQuality) -> Self {
        self.network_quality = Some(quality);
        self
    }

    /// Override the timestamp (replayed or externally clocked updates)
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Critical updates skip broadcast throttling.
    ///
    /// `recording` is always critical, as is any action naming a fresh or
    /// ready connection. Matching is per word, so `disconnected` does not
    /// count as `connected`.
    #[must_use]
    pub fn is_critical(&self) -> bool {
        if self.status == TrackerStatus::Recording {
            return true;
        }

        self.action.as_deref().is_some_and(|action| {
            action
                .split(|c: char| !c.is_ascii_alphanumeric())
                .any(|word| {
                    CRITICAL_ACTION_WORDS
                        .iter()
                        .any(|critical| word.eq_ignore_ascii_case(critical))
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(status: TrackerStatus) -> StatusMessage {
        StatusMessage::new(TrackerId::from("T1"), status)
    }

    #[test]
    fn test_status_message_wire_format() {
        let msg = message(TrackerStatus::Active)
            .with_action("pass_short")
            .with_battery_level(87)
            .with_network_quality(NetworkQuality::Good);

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"trackerId\":\"T1\""));
        assert!(json.contains("\"status\":\"active\""));
        assert!(json.contains("\"batteryLevel\":87"));
        assert!(json.contains("\"networkQuality\":\"good\""));

        let back: StatusMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_optional_fields_may_be_absent() {
        let json = r#"{"trackerId":"T9","status":"inactive","timestamp":"2024-05-01T12:00:00Z"}"#;
        let msg: StatusMessage = serde_json::from_str(json).unwrap();

        assert_eq!(msg.tracker_id.as_str(), "T9");
        assert_eq!(msg.status, TrackerStatus::Inactive);
        assert!(msg.action.is_none());
        assert!(msg.battery_level.is_none());
    }

    #[test]
    fn test_battery_level_is_clamped() {
        let msg = message(TrackerStatus::Active).with_battery_level(250);
        assert_eq!(msg.battery_level, Some(100));
    }

    #[test]
    fn test_recording_is_critical() {
        assert!(message(TrackerStatus::Recording).is_critical());
        assert!(!message(TrackerStatus::Active).is_critical());
    }

    #[test]
    fn test_connection_actions_are_critical() {
        assert!(message(TrackerStatus::Active).with_action("connected").is_critical());
        assert!(message(TrackerStatus::Active).with_action("tracker_ready").is_critical());
        assert!(message(TrackerStatus::Active).with_action("Joined match").is_critical());
        assert!(!message(TrackerStatus::Inactive).with_action("disconnected").is_critical());
        assert!(!message(TrackerStatus::Active).with_action("shot_on_target").is_critical());
    }
}
