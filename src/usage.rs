use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::Error as SqlxError;
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

// -----------------------------------------------------------------------------
// Models & DTOs
// -----------------------------------------------------------------------------

#[derive(Debug)]
pub enum UsageError {
    SqlxError(SqlxError),
    Unavailable(String),
}

impl From<SqlxError> for UsageError {
    fn from(err: SqlxError) -> Self {
        match err {
            SqlxError::PoolTimedOut | SqlxError::PoolClosed | SqlxError::Io(_) => {
                UsageError::Unavailable(err.to_string())
            }
            err => UsageError::SqlxError(err),
        }
    }
}

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UsageError::SqlxError(err) => err.fmt(f),
            UsageError::Unavailable(reason) => write!(f, "Usage store unavailable: {}", reason),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Usage {
    pub uuid: String,
    pub cloud_name: String,
    pub cloud_type: String,
    pub image_id: String,
    pub instance_type: String,
    pub user_id: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateUsage {
    pub cloud_name: String,
    pub cloud_type: String,
    pub image_id: String,
    pub instance_type: String,
    /// Requester identity; the access key the launch was made with.
    pub user_id: String,
}

/// Outcome of a write nobody waits on.
#[derive(Debug, Clone, PartialEq)]
pub enum BestEffort {
    Recorded,
    Skipped(String),
}

// -----------------------------------------------------------------------------
// Repository
// -----------------------------------------------------------------------------

#[async_trait]
pub trait UsageLog: Send + Sync {
    async fn record(&self, usage: CreateUsage) -> Result<(), UsageError>;
}

#[derive(Clone)]
pub struct UsageRepository {
    pub pool: PgPool,
}

impl UsageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, usage: CreateUsage) -> Result<Usage, UsageError> {
        let uuid = Uuid::new_v4().to_string();
        let usage = sqlx::query_as::<_, Usage>(
            "
            INSERT INTO usages (uuid, cloud_name, cloud_type, image_id, instance_type, user_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING uuid, cloud_name, cloud_type, image_id, instance_type, user_id, created_at
            ",
        )
        .bind(uuid)
        .bind(usage.cloud_name)
        .bind(usage.cloud_type)
        .bind(usage.image_id)
        .bind(usage.instance_type)
        .bind(usage.user_id)
        .bind(chrono::Utc::now().naive_utc())
        .fetch_one(&self.pool)
        .await?;

        Ok(usage)
    }

    #[cfg(test)]
    pub async fn get_one(&self, uuid: &str) -> Result<Option<Usage>, UsageError> {
        let usage = sqlx::query_as::<_, Usage>("SELECT * FROM usages WHERE uuid = $1")
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?;

        Ok(usage)
    }
}

#[async_trait]
impl UsageLog for UsageRepository {
    async fn record(&self, usage: CreateUsage) -> Result<(), UsageError> {
        self.create(usage).await.map(|_| ())
    }
}

// -----------------------------------------------------------------------------
// Functions
// -----------------------------------------------------------------------------

/// Appends a usage event; failures are logged and never reach the caller.
pub async fn record_usage(usage_log: &dyn UsageLog, usage: CreateUsage) -> BestEffort {
    match usage_log.record(usage).await {
        Ok(()) => BestEffort::Recorded,
        Err(err) => {
            log::debug!("Trouble saving Usage data: {}", err);
            BestEffort::Skipped(err.to_string())
        }
    }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::{FailingUsageLog, MemoryUsageLog};

    fn usage() -> CreateUsage {
        CreateUsage {
            cloud_name: "Amazon EC2".to_string(),
            cloud_type: "ec2".to_string(),
            image_id: "ami-default".to_string(),
            instance_type: "m1.large".to_string(),
            user_id: "AKIDEXAMPLE".to_string(),
        }
    }

    #[tokio::test]
    async fn test_record_usage() {
        let usage_log = MemoryUsageLog::default();

        let outcome = record_usage(&usage_log, usage()).await;

        assert_eq!(outcome, BestEffort::Recorded);
        assert_eq!(usage_log.recorded(), vec![usage()]);
    }

    #[tokio::test]
    async fn test_record_usage_swallows_failure() {
        let outcome = record_usage(&FailingUsageLog, usage()).await;

        match outcome {
            BestEffort::Skipped(reason) => assert!(reason.contains("unavailable")),
            BestEffort::Recorded => panic!("failing store reported success"),
        }
    }

    #[test]
    fn test_pool_failures_are_unavailable() {
        let err = UsageError::from(SqlxError::PoolTimedOut);
        assert!(matches!(err, UsageError::Unavailable(_)));
        assert!(err.to_string().starts_with("Usage store unavailable: "));

        let err = UsageError::from(SqlxError::RowNotFound);
        assert!(matches!(err, UsageError::SqlxError(_)));
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL with the catalog migrations applied"]
    async fn test_create_and_get_usage() {
        dotenvy::dotenv().ok();
        let db_url = dotenvy::var("DATABASE_URL").expect("DATABASE_URL must be set to run tests");
        let pool = PgPool::connect(&db_url).await.expect("Failed to create test pool");
        sqlx::migrate!("./migrations").run(&pool).await.expect("migrations failed");

        let repo = UsageRepository::new(pool);
        let created = repo.create(usage()).await.expect("Failed to create usage");
        let fetched = repo
            .get_one(&created.uuid)
            .await
            .expect("query failed")
            .expect("usage missing");

        assert_eq!(fetched.cloud_name, "Amazon EC2");
        assert_eq!(fetched.user_id, "AKIDEXAMPLE");
    }
}
