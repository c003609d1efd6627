//! SQLite-backed job store.
//!
//! Uses WAL journal mode and a busy timeout so concurrent workers never see
//! `SQLITE_BUSY` as silent corruption; a blocked writer surfaces a store
//! error once the timeout elapses. Timestamps are persisted as RFC 3339
//! strings at nanosecond precision, always UTC.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use tracing::warn;

use super::model::{Job, JobStore, Metadata, Stage};
use crate::{Error, Result};

const BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);
const POOL_SIZE: u32 = 5;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    image_path TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    target_name TEXT NOT NULL,
    callback_url TEXT,
    title TEXT,
    metadata_json TEXT,
    stage TEXT NOT NULL,
    error_message TEXT,
    target_location TEXT,
    target_commit TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
);
"#;

/// SQLite implementation of [`JobStore`].
pub struct SqliteJobStore {
    pool: Pool<Sqlite>,
}

impl SqliteJobStore {
    /// Open (creating if missing) the database at `path` and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(POOL_SIZE)
            .connect_with(options)
            .await?;

        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }
}

/// Database row shape for a job.
#[derive(Debug, FromRow)]
struct JobRow {
    id: String,
    image_path: String,
    mime_type: String,
    target_name: String,
    callback_url: Option<String>,
    title: Option<String>,
    metadata_json: Option<String>,
    stage: String,
    error_message: Option<String>,
    target_location: Option<String>,
    target_commit: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn row_to_job(row: JobRow) -> Job {
    // A corrupt metadata document degrades to no metadata instead of failing
    // the lookup.
    let metadata = row.metadata_json.as_deref().and_then(|raw| {
        if raw.is_empty() {
            return None;
        }
        match serde_json::from_str::<Metadata>(raw) {
            Ok(m) => Some(m),
            Err(e) => {
                warn!(job_id = %row.id, error = %e, "ignoring corrupt job metadata");
                None
            }
        }
    });

    Job {
        stage: Stage::parse(&row.stage).unwrap_or(Stage::Queued),
        created_at: parse_ts(&row.created_at).unwrap_or_else(Utc::now),
        started_at: row.started_at.as_deref().and_then(parse_ts),
        completed_at: row.completed_at.as_deref().and_then(parse_ts),
        id: row.id,
        image_path: row.image_path,
        mime_type: row.mime_type,
        target_name: row.target_name,
        callback_url: row.callback_url,
        title: row.title,
        metadata,
        error_message: row.error_message,
        target_location: row.target_location,
        target_commit: row.target_commit,
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create_job(&self, job: &Job) -> Result<()> {
        if job.id.is_empty() {
            return Err(Error::validation("job id is required"));
        }

        let metadata_json = match &job.metadata {
            Some(m) => Some(serde_json::to_string(m)?),
            None => None,
        };
        // Empty optionals normalize to NULL.
        let callback_url = job.callback_url.as_deref().filter(|s| !s.is_empty());
        let title = job.title.as_deref().filter(|s| !s.is_empty());

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, image_path, mime_type, target_name,
                callback_url, title, metadata_json, stage, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.image_path)
        .bind(&job.mime_type)
        .bind(&job.target_name)
        .bind(callback_url)
        .bind(title)
        .bind(metadata_json)
        .bind(job.stage.as_str())
        .bind(format_ts(job.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_stage(
        &self,
        id: &str,
        stage: Stage,
        started_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        match started_at {
            Some(started) => {
                sqlx::query("UPDATE jobs SET stage = ?, started_at = ? WHERE id = ?")
                    .bind(stage.as_str())
                    .bind(format_ts(started))
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
            }
            None => {
                sqlx::query("UPDATE jobs SET stage = ? WHERE id = ?")
                    .bind(stage.as_str())
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn save_result(
        &self,
        id: &str,
        location: &str,
        commit: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET target_location = ?, target_commit = ?, stage = ?,
                error_message = NULL, completed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(location)
        .bind(commit)
        .bind(Stage::Completed.as_str())
        .bind(format_ts(completed_at))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_error(
        &self,
        id: &str,
        message: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET error_message = ?, stage = ?, completed_at = ? WHERE id = ?",
        )
        .bind(message)
        .bind(Stage::Failed.as_str())
        .bind(format_ts(completed_at))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(row_to_job))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
