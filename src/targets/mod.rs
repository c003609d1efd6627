//! Publication targets for rendered Markdown.

pub mod git;
pub mod github;
pub mod template;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::jobs::model::Metadata;
use crate::Result;

pub use git::GitTarget;
pub use github::GithubTarget;

/// Data needed to post a document.
#[derive(Debug, Clone)]
pub struct PostRequest {
    pub job_id: String,
    pub markdown: String,
    pub suggested_title: Option<String>,
    pub metadata: Option<Metadata>,
    pub timestamp: DateTime<Utc>,
}

/// Where the content landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostOutcome {
    pub target_name: String,
    /// Opaque stable location string.
    pub location: String,
    /// Content revision identifier; empty when the destination has none.
    pub commit: String,
}

/// An output destination for a Markdown document.
#[async_trait]
pub trait Target: Send + Sync {
    fn name(&self) -> &str;

    /// Publish the document, returning its location and commit.
    ///
    /// A failed post must not report a `(location, commit)` pair pointing at
    /// an incomplete artifact.
    async fn post(&self, cancel: &CancellationToken, req: &PostRequest) -> Result<PostOutcome>;
}

/// Initialized targets by name; read-only after startup.
#[derive(Default)]
pub struct Registry {
    by_name: HashMap<String, Arc<dyn Target>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, target: Arc<dyn Target>) {
        self.by_name.insert(target.name().to_string(), target);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Target>> {
        self.by_name.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.by_name.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubTarget;

    #[async_trait]
    impl Target for StubTarget {
        fn name(&self) -> &str {
            "stub"
        }

        async fn post(
            &self,
            _cancel: &CancellationToken,
            _req: &PostRequest,
        ) -> Result<PostOutcome> {
            Ok(PostOutcome {
                target_name: "stub".to_string(),
                location: "git:loc".to_string(),
                commit: "deadbeef".to_string(),
            })
        }
    }

    #[test]
    fn registry_resolves_by_name() {
        let mut registry = Registry::new();
        registry.add(Arc::new(StubTarget));
        assert!(registry.get("stub").is_some());
        assert!(registry.get("other").is_none());
        assert_eq!(registry.names(), vec!["stub"]);
    }
}
