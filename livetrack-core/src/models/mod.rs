pub mod assignment;
pub mod id;

pub use assignment::TrackerAssignment;
pub use id::{generate_id, EventId, TrackerId};
