//! Transcription job creation and status routes.

use axum::{
    extract::{Multipart, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use url::Url;

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::jobs::model::{Job, Metadata, WorkItem};
use crate::util::new_id;
use crate::Error;

/// Base path for transcription routes.
pub const TRANSCRIPTIONS_PATH: &str = "/v1/transcriptions";

const PREFER_HEADER: &str = "prefer";
const PREFER_RESPOND_ASYNC: &str = "respond-async";

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("^[a-f0-9-]+$").expect("static pattern"))
}

#[derive(Debug, Serialize)]
struct CreateResponse {
    job_id: String,
    status_url: String,
}

#[derive(Default)]
struct CreateForm {
    file: Option<(String, String, Vec<u8>)>,
    callback_url: Option<String>,
    title: Option<String>,
    metadata: Option<Metadata>,
}

async fn read_form(multipart: &mut Multipart) -> ApiResult<CreateForm> {
    let mut form = CreateForm::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("invalid form: {e}")))?
    {
        match field.name().unwrap_or_default() {
            "file" => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let declared_mime = field.content_type().unwrap_or_default().to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("read file: {e}")))?;
                form.file = Some((filename, declared_mime, bytes.to_vec()));
            }
            "callback_url" => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("read callback_url: {e}")))?;
                let trimmed = raw.trim();
                if !trimmed.is_empty() {
                    Url::parse(trimmed)
                        .map_err(|_| ApiError::bad_request("invalid callback_url"))?;
                    form.callback_url = Some(trimmed.to_string());
                }
            }
            "title" => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("read title: {e}")))?;
                let trimmed = raw.trim();
                if !trimmed.is_empty() {
                    form.title = Some(trimmed.to_string());
                }
            }
            "metadata" => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("read metadata: {e}")))?;
                let trimmed = raw.trim();
                if !trimmed.is_empty() {
                    let parsed: Metadata = serde_json::from_str(trimmed)
                        .map_err(|_| ApiError::bad_request("invalid metadata json"))?;
                    form.metadata = Some(parsed);
                }
            }
            _ => {}
        }
    }
    Ok(form)
}

/// `POST /v1/transcriptions` — create a job, then process inline or enqueue.
pub async fn create_transcription(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<Response> {
    let form = read_form(&mut multipart).await?;
    let (filename, declared_mime, data) = form
        .file
        .ok_or_else(|| ApiError::bad_request("file is required"))?;

    // Stage the upload; the cleanup handle owns deletion from here on.
    let (image_path, cleanup, mime) = state
        .uploader
        .save_image(
            &filename,
            &declared_mime,
            &data,
            state.max_upload_size,
        )
        .map_err(|e| ApiError::bad_request(format!("upload failed: {e}")))?;

    let mut job = Job::new(
        new_id(),
        image_path.to_string_lossy().into_owned(),
        mime,
        state.target_name.clone(),
    );
    job.callback_url = form.callback_url;
    job.title = form.title;
    job.metadata = form.metadata;

    if let Err(e) = state.store.create_job(&job).await {
        error!(error = %e, "failed to persist job");
        return Err(ApiError::internal());
    }
    info!(job_id = %job.id, target = %job.target_name, "job created");

    let wants_async = headers
        .get(PREFER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains(PREFER_RESPOND_ASYNC))
        .unwrap_or(false);

    if wants_async {
        let job_id = job.id.clone();
        // Ownership of the cleanup handle transfers to the worker here; on
        // enqueue failure the dropped item releases the staged file.
        match state.queue.enqueue(WorkItem::new(job, Some(cleanup))) {
            Ok(()) => {
                info!(%job_id, "job enqueued");
                let body = CreateResponse {
                    status_url: format!("{TRANSCRIPTIONS_PATH}/{job_id}"),
                    job_id,
                };
                Ok((StatusCode::ACCEPTED, Json(body)).into_response())
            }
            Err(Error::QueueFull) => Err(ApiError::queue_full()),
            Err(e) => {
                error!(%job_id, error = %e, "enqueue failed");
                Err(ApiError::internal())
            }
        }
    } else {
        // Sync path: the handler retains the cleanup handle; it is released
        // when `cleanup` drops at the end of this scope.
        let _cleanup = cleanup;
        let job_id = job.id.clone();
        let item = WorkItem::new(job, None);
        let cancel = CancellationToken::new();
        if let Err(e) = state.processor.process(&cancel, &item).await {
            error!(%job_id, error = %e, "processing failed");
            return Err(ApiError::internal());
        }
        info!(%job_id, "job processed (sync)");
        Ok(StatusCode::OK.into_response())
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    job_id: String,
    stage: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_result: Option<TargetResultOut>,
}

#[derive(Debug, Serialize)]
struct TargetResultOut {
    target: String,
    location: String,
    commit: String,
}

/// `GET /v1/transcriptions/{id}` — current job state projection.
pub async fn get_transcription(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StatusResponse>> {
    if !id_pattern().is_match(&id) {
        return Err(ApiError::not_found());
    }

    let job = state
        .store
        .get_job(&id)
        .await
        .map_err(|e| {
            error!(error = %e, "job lookup failed");
            ApiError::internal()
        })?
        .ok_or_else(ApiError::not_found)?;

    Ok(Json(project(job)))
}

fn project(job: Job) -> StatusResponse {
    // Recorded error text may carry provider detail; the surface only ever
    // says "internal error".
    let error = job
        .error_message
        .as_deref()
        .filter(|m| !m.is_empty())
        .map(|_| "internal error");

    let target_result = if job.target_location.is_some() || job.target_commit.is_some() {
        Some(TargetResultOut {
            target: job.target_name.clone(),
            location: job.target_location.clone().unwrap_or_default(),
            commit: job.target_commit.clone().unwrap_or_default(),
        })
    } else {
        None
    };

    StatusResponse {
        job_id: job.id,
        stage: job.stage.as_str().to_string(),
        created_at: job.created_at,
        started_at: job.started_at,
        completed_at: job.completed_at,
        error,
        target_result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::Stage;

    #[test]
    fn id_pattern_accepts_uuid_and_rejects_junk() {
        assert!(id_pattern().is_match("123e4567-e89b-42d3-a456-426614174000"));
        assert!(id_pattern().is_match("deadbeef"));
        assert!(!id_pattern().is_match("UPPER"));
        assert!(!id_pattern().is_match("id/with/slash"));
        assert!(!id_pattern().is_match(""));
    }

    #[test]
    fn projection_redacts_error_text() {
        let mut job = Job::new("abc", "/tmp/x.png", "image/png", "docs");
        job.stage = Stage::Failed;
        job.error_message = Some("llm transcribe: provider exploded".to_string());
        let out = project(job);
        assert_eq!(out.error, Some("internal error"));
        assert!(out.target_result.is_none());
    }

    #[test]
    fn projection_includes_target_result_when_present() {
        let mut job = Job::new("abc", "/tmp/x.png", "image/png", "docs");
        job.stage = Stage::Completed;
        job.target_location = Some("git:loc".to_string());
        job.target_commit = Some("deadbeef".to_string());
        let out = project(job);
        assert_eq!(out.error, None);
        let result = out.target_result.unwrap();
        assert_eq!(result.target, "docs");
        assert_eq!(result.location, "git:loc");
        assert_eq!(result.commit, "deadbeef");
    }
}
