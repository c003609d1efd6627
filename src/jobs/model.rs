//! Job model and persistence contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::CleanupHandle;
use crate::Result;

/// Free-form job metadata: a JSON object keyed by strings.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Lifecycle stage of a transcription job.
///
/// `Queued` is the only legal initial stage; `Completed` and `Failed` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Queued,
    Transcribing,
    Posting,
    Completed,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Queued => "queued",
            Stage::Transcribing => "transcribing",
            Stage::Posting => "posting",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Stage::Queued),
            "transcribing" => Some(Stage::Transcribing),
            "posting" => Some(Stage::Posting),
            "completed" => Some(Stage::Completed),
            "failed" => Some(Stage::Failed),
            _ => None,
        }
    }

    /// Terminal stages admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single transcription and posting request.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    /// Absolute path to the staged upload; valid only while the file exists.
    pub image_path: String,
    pub mime_type: String,
    /// Logical name of the configured destination.
    pub target_name: String,
    pub callback_url: Option<String>,
    pub title: Option<String>,
    pub metadata: Option<Metadata>,
    pub stage: Stage,
    /// Present iff `stage == Failed`.
    pub error_message: Option<String>,
    /// Present iff `stage == Completed`.
    pub target_location: Option<String>,
    pub target_commit: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a freshly queued job.
    pub fn new(
        id: impl Into<String>,
        image_path: impl Into<String>,
        mime_type: impl Into<String>,
        target_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            image_path: image_path.into(),
            mime_type: mime_type.into(),
            target_name: target_name.into(),
            callback_url: None,
            title: None,
            metadata: None,
            stage: Stage::Queued,
            error_message: None,
            target_location: None,
            target_commit: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// A job plus the deferred-deletion handle over its staged image.
///
/// Ownership of the handle transfers from the HTTP handler to the worker on
/// successful enqueue; the worker invokes it exactly once after processing.
#[derive(Debug)]
pub struct WorkItem {
    pub job: Job,
    pub cleanup: Option<CleanupHandle>,
}

impl WorkItem {
    pub fn new(job: Job, cleanup: Option<CleanupHandle>) -> Self {
        Self { job, cleanup }
    }
}

/// Persistence for jobs and their lifecycle.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job record. The identifier must be non-empty.
    async fn create_job(&self, job: &Job) -> Result<()>;

    /// Transition the stage; sets `started_at` only when provided.
    /// Unknown identifiers are a no-op.
    async fn update_stage(
        &self,
        id: &str,
        stage: Stage,
        started_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Finalize as `Completed` with the target result, clearing any prior error.
    async fn save_result(
        &self,
        id: &str,
        location: &str,
        commit: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Finalize as `Failed` with the error message.
    async fn save_error(&self, id: &str, message: &str, completed_at: DateTime<Utc>)
        -> Result<()>;

    /// Fetch the current record, or `None` when unknown.
    async fn get_job(&self, id: &str) -> Result<Option<Job>>;

    /// Release underlying resources.
    async fn close(&self);
}
