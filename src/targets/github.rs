//! Hosted-repository target posting via the REST contents API.

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::template::{render_commit_message, render_filename};
use super::{PostOutcome, PostRequest, Target};
use crate::config::GithubTargetConfig;
use crate::{Error, Result};

const API_VERSION_HEADER: &str = "X-GitHub-Api-Version";
const API_VERSION: &str = "2022-11-28";
const ACCEPT_HEADER_VALUE: &str = "application/vnd.github+json";

/// Creates files in a hosted repository without cloning it.
pub struct GithubTarget {
    name: String,
    cfg: GithubTargetConfig,
    http: reqwest::Client,
}

impl GithubTarget {
    pub fn new(name: impl Into<String>, cfg: GithubTargetConfig) -> Result<Self> {
        if cfg.auth.token.trim().is_empty() {
            return Err(Error::config("github token must not be empty"));
        }
        if cfg.repository_owner.trim().is_empty() || cfg.repository_name.trim().is_empty() {
            return Err(Error::config("repository owner/name must not be empty"));
        }
        if cfg.branch.trim().is_empty() {
            return Err(Error::config("branch must not be empty"));
        }
        Ok(Self {
            name: name.into(),
            cfg,
            http: reqwest::Client::new(),
        })
    }

    /// Override the HTTP client (tests point this at a local stub server).
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    fn contents_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/contents/{}",
            self.cfg.api_base_url.trim_end_matches('/'),
            self.cfg.repository_owner,
            self.cfg.repository_name,
            path
        )
    }
}

#[async_trait]
impl Target for GithubTarget {
    fn name(&self) -> &str {
        &self.name
    }

    async fn post(&self, cancel: &CancellationToken, req: &PostRequest) -> Result<PostOutcome> {
        let path = render_filename(&self.cfg.filename_template, &self.cfg.base_path, req);
        let message = render_commit_message(&self.cfg.commit_message_template, req);

        let identity = GitIdentity {
            name: self.cfg.author_name.clone(),
            email: self.cfg.author_email.clone(),
        };
        let payload = CreateFilePayload {
            message,
            content: base64::engine::general_purpose::STANDARD.encode(req.markdown.as_bytes()),
            branch: self.cfg.branch.clone(),
            committer: identity.clone(),
            author: identity,
        };

        let url = self.contents_url(&path);
        debug!(%url, job_id = %req.job_id, "creating repository content");
        let request = self
            .http
            .put(&url)
            .bearer_auth(self.cfg.auth.token.trim())
            .header(reqwest::header::ACCEPT, ACCEPT_HEADER_VALUE)
            .header(API_VERSION_HEADER, API_VERSION)
            .json(&payload);

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Canceled),
            res = request.send() => res.map_err(|e| Error::target(format!("github request: {e}")))?,
        };

        let status = response.status();
        let bytes = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Canceled),
            body = response.bytes() => body.map_err(|e| Error::target(format!("read response: {e}")))?,
        };

        // Create returns 201; updating an existing path returns 200.
        if status != reqwest::StatusCode::CREATED && status != reqwest::StatusCode::OK {
            let api_err: ApiError = serde_json::from_slice(&bytes).unwrap_or_default();
            if api_err.message.is_empty() {
                return Err(Error::target(format!("github api: status {status}")));
            }
            return Err(Error::target(format!(
                "github api: status {status}: {}",
                api_err.message
            )));
        }

        let out: CreateFileResponse = serde_json::from_slice(&bytes)
            .map_err(|e| Error::target(format!("decode response: {e}")))?;

        Ok(PostOutcome {
            target_name: self.name.clone(),
            location: format!(
                "github:{}/{}@{}:{}",
                self.cfg.repository_owner, self.cfg.repository_name, self.cfg.branch, path
            ),
            commit: out.commit.sha,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
struct GitIdentity {
    name: String,
    email: String,
}

#[derive(Debug, Serialize)]
struct CreateFilePayload {
    message: String,
    /// Base64-encoded file body.
    content: String,
    branch: String,
    committer: GitIdentity,
    author: GitIdentity,
}

#[derive(Debug, Default, Deserialize)]
struct CreateFileResponse {
    #[serde(default)]
    commit: CommitInfo,
}

#[derive(Debug, Default, Deserialize)]
struct CommitInfo {
    #[serde(default)]
    sha: String,
}

#[derive(Debug, Default, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}
