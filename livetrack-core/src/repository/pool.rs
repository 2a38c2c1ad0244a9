use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{error, info};

use crate::config::DatabaseConfig;
use crate::Result;

/// Open the Postgres pool behind [`AssignmentRepository`](super::AssignmentRepository)
///
/// Schema migrations are the host's job; this only connects.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool> {
    info!(
        max_connections = config.max_connections,
        "Connecting to assignment database"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.connect_timeout())
        .connect(&config.url)
        .await
        .inspect_err(|e| error!(error = %e, "Failed to connect to assignment database"))?;

    info!("Assignment database connected");
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{AssignmentRepository, RosterRepository};
    use crate::{Error, EventId};

    #[tokio::test]
    async fn test_malformed_url_is_a_database_error() {
        let config = DatabaseConfig {
            url: "not a database url".to_string(),
            ..DatabaseConfig::default()
        };

        assert!(matches!(connect(&config).await, Err(Error::Database(_))));
    }

    #[tokio::test]
    #[ignore = "Requires PostgreSQL"]
    async fn test_connect_and_query_assignments() {
        let pool = connect(&DatabaseConfig::default()).await.unwrap();
        let repository = AssignmentRepository::new(pool);

        let assignments = repository
            .assigned_trackers(&EventId::from("missing-event"))
            .await
            .unwrap();
        assert!(assignments.is_empty());
    }
}
