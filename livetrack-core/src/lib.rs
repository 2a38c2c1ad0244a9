//! Configuration, logging, models and persistence shared by LiveTrack services
//!
//! A host process wires these up before starting a presence coordinator:
//!
//! ```no_run
//! use livetrack_core::{logging, repository, AssignmentRepository, Config};
//!
//! # async fn bootstrap() -> anyhow::Result<()> {
//! let config = Config::load(Some("livetrack.toml"))?;
//! logging::init_logging(&config.logging)?;
//!
//! let pool = repository::connect(&config.database).await?;
//! let assignments = AssignmentRepository::new(pool);
//! # drop(assignments);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod repository;

pub use config::Config;
pub use error::{Error, Result};
pub use models::{EventId, TrackerAssignment, TrackerId};
pub use repository::{AssignmentRepository, RosterRepository};
