//! The per-job pipeline: transcribe, publish, finalize, notify.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::jobs::model::{Stage, WorkItem};
use crate::jobs::queue::JobProcessor;
use crate::jobs::JobStore;
use crate::llm::LlmClient;
use crate::targets::{PostRequest, Registry};
use crate::{Error, Result};

const STATUS_COMPLETED: &str = "completed";

/// Callback retry/backoff policy.
#[derive(Debug, Clone, Copy)]
pub struct CallbackPolicy {
    /// Maximum delivery attempts.
    pub retries: u32,
    /// Base backoff; attempt `k` sleeps `k × base` before the next try.
    pub backoff: Duration,
}

/// Drives a work item through transcribe-then-publish and records every
/// lifecycle transition in the job store.
pub struct TranscriptionProcessor {
    store: Arc<dyn JobStore>,
    llm: Arc<dyn LlmClient>,
    targets: Arc<Registry>,
    http: reqwest::Client,
    callback: CallbackPolicy,
}

impl TranscriptionProcessor {
    pub fn new(
        store: Arc<dyn JobStore>,
        llm: Arc<dyn LlmClient>,
        targets: Arc<Registry>,
        callback: CallbackPolicy,
    ) -> Self {
        Self {
            store,
            llm,
            targets,
            http: reqwest::Client::new(),
            callback,
        }
    }

    /// Finalize as failed. Persistence failures here are logged and
    /// tolerated; the process must not crash over a lagging record.
    async fn finish_with_error(&self, job_id: &str, err: &Error) {
        if let Err(persist_err) = self
            .store
            .save_error(job_id, &err.to_string(), Utc::now())
            .await
        {
            warn!(%job_id, error = %persist_err, "failed to persist job failure");
        }
    }

    async fn send_callback_with_retry(
        &self,
        cancel: &CancellationToken,
        url: &str,
        payload: &CallbackPayload,
    ) -> Result<()> {
        let max = self.callback.retries.max(1);
        let mut last_err = Error::Other("callback never attempted".to_string());

        for attempt in 1..=max {
            match self.post_json(cancel, url, payload).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if cancel.is_cancelled() {
                        return Err(e);
                    }
                    debug!(attempt, error = %e, "callback attempt failed");
                    last_err = e;
                    if attempt < max {
                        let delay = self.callback.backoff.saturating_mul(attempt);
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(last_err),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
        Err(last_err)
    }

    async fn post_json(
        &self,
        cancel: &CancellationToken,
        url: &str,
        payload: &CallbackPayload,
    ) -> Result<()> {
        let request = self.http.post(url).json(payload);
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Canceled),
            res = request.send() => res.map_err(|e| Error::Other(format!("callback request: {e}")))?,
        };
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Other(format!("callback status {}", status.as_u16())));
        }
        Ok(())
    }
}

#[async_trait]
impl JobProcessor for TranscriptionProcessor {
    async fn process(&self, cancel: &CancellationToken, item: &WorkItem) -> Result<()> {
        let job = &item.job;

        self.store
            .update_stage(&job.id, Stage::Transcribing, Some(Utc::now()))
            .await
            .map_err(|e| Error::Other(format!("update stage to transcribing: {e}")))?;

        let image = match tokio::fs::read(&job.image_path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let err = Error::Other(format!("open image: {e}"));
                self.finish_with_error(&job.id, &err).await;
                return Err(err);
            }
        };

        let markdown = match self.llm.transcribe(cancel, &image, &job.mime_type).await {
            Ok(md) => md,
            Err(e) => {
                let err = Error::Other(format!("llm transcribe: {e}"));
                self.finish_with_error(&job.id, &err).await;
                return Err(err);
            }
        };

        let markdown = match job.title.as_deref().filter(|t| !t.is_empty()) {
            Some(title) => format!("# {title}\n\n{markdown}"),
            None => markdown,
        };

        // started_at was set on the first transition out of Queued; it is
        // left untouched here.
        if let Err(e) = self
            .store
            .update_stage(&job.id, Stage::Posting, None)
            .await
        {
            let err = Error::Other(format!("update stage to posting: {e}"));
            self.finish_with_error(&job.id, &err).await;
            return Err(err);
        }

        let Some(target) = self.targets.get(&job.target_name) else {
            let err = Error::target(format!("target {:?} not registered", job.target_name));
            self.finish_with_error(&job.id, &err).await;
            return Err(err);
        };

        let request = PostRequest {
            job_id: job.id.clone(),
            markdown,
            suggested_title: job.title.clone(),
            metadata: job.metadata.clone(),
            timestamp: Utc::now(),
        };
        let outcome = match target.post(cancel, &request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let err = Error::Other(format!("target post: {e}"));
                self.finish_with_error(&job.id, &err).await;
                return Err(err);
            }
        };

        self.store
            .save_result(&job.id, &outcome.location, &outcome.commit, Utc::now())
            .await
            .map_err(|e| Error::Other(format!("save result: {e}")))?;

        if let Some(url) = job.callback_url.as_deref().filter(|u| !u.is_empty()) {
            let payload = CallbackPayload {
                job_id: job.id.clone(),
                status: STATUS_COMPLETED.to_string(),
                stage: Stage::Completed.as_str().to_string(),
                error: None,
                result: Some(CallbackResult {
                    target: outcome.target_name.clone(),
                    location: outcome.location.clone(),
                    commit: outcome.commit.clone(),
                }),
            };
            if let Err(e) = self.send_callback_with_retry(cancel, url, &payload).await {
                warn!(job_id = %job.id, error = %e, "callback failed after retries");
            }
        }

        Ok(())
    }
}

/// Completion envelope delivered to the client-supplied callback URL.
#[derive(Debug, Clone, Serialize)]
pub struct CallbackPayload {
    pub job_id: String,
    pub status: String,
    pub stage: String,
    pub error: Option<String>,
    pub result: Option<CallbackResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallbackResult {
    pub target: String,
    pub location: String,
    pub commit: String,
}
