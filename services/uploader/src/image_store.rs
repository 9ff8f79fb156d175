use crate::config::DatabaseConfig;
use crate::record::{ImageRecord, ImageStatus, ParseStatusError};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::FromRow;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Errors returned by image store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("image {0} already exists")]
    DuplicateId(Uuid),

    #[error("image {0} not found")]
    NotFound(Uuid),

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: ImageStatus, to: ImageStatus },

    #[error("corrupt image record: {0}")]
    InvalidStatus(#[from] ParseStatusError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Row layout of the `images` table
#[derive(Debug, FromRow)]
struct ImageRow {
    id: Uuid,
    local_path: String,
    display_name: String,
    captured_at: DateTime<Utc>,
    status: String,
}

impl TryFrom<ImageRow> for ImageRecord {
    type Error = StoreError;

    fn try_from(row: ImageRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            local_path: PathBuf::from(row.local_path),
            display_name: row.display_name,
            captured_at: row.captured_at,
            status: row.status.parse()?,
        })
    }
}

/// Number of records in each status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub uploading: i64,
    pub completed: i64,
    pub failed: i64,
    pub file_missing: i64,
}

impl StatusCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.uploading + self.completed + self.failed + self.file_missing
    }

    fn slot(&mut self, status: ImageStatus) -> &mut i64 {
        match status {
            ImageStatus::Pending => &mut self.pending,
            ImageStatus::Uploading => &mut self.uploading,
            ImageStatus::Completed => &mut self.completed,
            ImageStatus::Failed => &mut self.failed,
            ImageStatus::FileMissing => &mut self.file_missing,
        }
    }
}

const SELECT_IMAGES: &str = r#"
    SELECT id, local_path, display_name, captured_at, status
    FROM images
"#;

/// Durable catalog of captured images backed by SQLite
#[derive(Clone)]
pub struct ImageStore {
    pool: SqlitePool,
}

impl ImageStore {
    /// Open (creating if needed) the database named by the config
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let parent = database_path(&config.url).and_then(|p| p.parent().map(PathBuf::from));
        if let Some(parent) = parent {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(&parent).with_context(|| {
                    format!("Failed to create database directory {}", parent.display())
                })?;
            }
        }

        let options = SqliteConnectOptions::from_str(&config.url)
            .with_context(|| format!("Invalid database URL {}", config.url))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout())
            .connect_with(options)
            .await
            .context("Failed to open SQLite database")?;

        info!(url = %config.url, "Connected to image database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations").run(&self.pool).await?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Add a new record; fails if the id is taken
    #[instrument(skip(self, record), fields(id = %record.id, status = %record.status))]
    pub async fn insert(&self, record: &ImageRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO images (id, local_path, display_name, captured_at, status)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id)
        .bind(record.local_path.to_string_lossy().into_owned())
        .bind(&record.display_name)
        .bind(record.captured_at)
        .bind(record.status.as_str())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!("Image record inserted");
                Ok(())
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::DuplicateId(record.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Snapshot of every record, in insertion order
    pub async fn get_all(&self) -> Result<Vec<ImageRecord>, StoreError> {
        let rows = sqlx::query_as::<_, ImageRow>(&format!("{SELECT_IMAGES} ORDER BY rowid"))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(ImageRecord::try_from).collect()
    }

    /// Snapshot of records currently in `status`, in insertion order
    pub async fn get_by_status(&self, status: ImageStatus) -> Result<Vec<ImageRecord>, StoreError> {
        let rows = sqlx::query_as::<_, ImageRow>(&format!(
            "{SELECT_IMAGES} WHERE status = ? ORDER BY rowid"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ImageRecord::try_from).collect()
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<ImageRecord, StoreError> {
        let row = sqlx::query_as::<_, ImageRow>(&format!("{SELECT_IMAGES} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.ok_or(StoreError::NotFound(id))?.try_into()
    }

    /// Overwrite the status unconditionally (last writer wins)
    #[instrument(skip(self))]
    pub async fn update_status(&self, id: Uuid, status: ImageStatus) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE images SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }

        Ok(())
    }

    /// Move to `next` only if the current status is one of `expected`.
    ///
    /// Returns `Ok(false)` when the record exists but was in another state.
    /// Every `expected -> next` pair must be an edge of the state machine.
    #[instrument(skip(self))]
    pub async fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: &[ImageStatus],
        next: ImageStatus,
    ) -> Result<bool, StoreError> {
        if let Some(&from) = expected.iter().find(|s| !s.can_transition_to(next)) {
            return Err(StoreError::InvalidTransition { from, to: next });
        }
        if expected.is_empty() {
            return Ok(false);
        }

        let placeholders = vec!["?"; expected.len()].join(", ");
        let sql =
            format!("UPDATE images SET status = ? WHERE id = ? AND status IN ({placeholders})");

        let mut query = sqlx::query(&sql).bind(next.as_str()).bind(id);
        for status in expected {
            query = query.bind(status.as_str());
        }

        let result = query.execute(&self.pool).await?;
        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let exists = sqlx::query("SELECT 1 FROM images WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .is_some();

        if exists {
            Ok(false)
        } else {
            Err(StoreError::NotFound(id))
        }
    }

    pub async fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM images GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            *counts.slot(status.parse()?) += count;
        }

        Ok(counts)
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// File path inside a `sqlite:` URL, `None` for in-memory databases
fn database_path(url: &str) -> Option<PathBuf> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or_default();

    if path.is_empty() || path == ":memory:" {
        None
    } else {
        Some(PathBuf::from(path))
    }
}
