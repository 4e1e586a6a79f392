use crate::error::Result;
use crate::model::BranchDescriptor;

#[cfg(feature = "postgres")]
pub type Pool = sqlx::PgPool;

/// Uninhabited without a driver: `connect_pool` can only fail
#[cfg(not(feature = "postgres"))]
#[derive(Debug)]
pub enum Pool {}

/// Open a small connection pool against a branch
#[cfg(feature = "postgres")]
pub async fn connect_pool(branch: &BranchDescriptor) -> Result<Pool> {
    use crate::error::{BranchError, RemoteErrorKind};
    use sqlx::postgres::PgPoolOptions;
    use std::time::Duration;

    PgPoolOptions::new()
        .max_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&branch.connection_uri)
        .await
        .map_err(|e| BranchError::Remote {
            operation: format!("connect to branch {}", branch.branch_id),
            kind: RemoteErrorKind::Network,
            status: None,
            message: e.to_string(),
        })
}

#[cfg(not(feature = "postgres"))]
pub async fn connect_pool(_branch: &BranchDescriptor) -> Result<Pool> {
    Err(driver_missing("connect_pool"))
}

#[cfg(not(feature = "postgres"))]
pub(crate) fn driver_missing(helper: &str) -> crate::error::BranchError {
    crate::error::BranchError::DriverMissing {
        helper: helper.to_string(),
        guidance: "Enable the `postgres` cargo feature of neon-test-branches.".to_string(),
    }
}

#[cfg(all(test, not(feature = "postgres")))]
mod tests {
    use super::*;
    use crate::error::BranchError;

    #[tokio::test]
    async fn test_without_driver() {
        let branch: BranchDescriptor = serde_json::from_value(serde_json::json!({
            "branch_id": "br-1",
            "project_id": "p",
            "parent_id": null,
            "connection_string": "postgresql://u:p@h/db",
            "host": "h",
            "created_at": "2026-01-01T00:00:00Z"
        }))
        .unwrap();

        let err = connect_pool(&branch).await.unwrap_err();
        assert!(matches!(err, BranchError::DriverMissing { .. }));
        assert!(err.to_string().contains("postgres"));
    }
}
