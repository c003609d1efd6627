//! Deterministic local LLM used for development and tests.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::LlmClient;
use crate::config::MockLlmConfig;
use crate::{Error, Result};

/// Mock client: sleeps for the configured delay (honoring cancellation) and
/// returns a fixed-prefix string that names the media type.
pub struct MockClient {
    cfg: MockLlmConfig,
}

impl MockClient {
    pub fn new(cfg: MockLlmConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl LlmClient for MockClient {
    async fn transcribe(
        &self,
        cancel: &CancellationToken,
        image: &[u8],
        mime: &str,
    ) -> Result<String> {
        if image.is_empty() {
            return Err(Error::llm("image is empty"));
        }

        let delay = self.cfg.delay.as_duration();
        if !delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Canceled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        Ok(format!(
            "{}\n\nTranscription of a {} image ({} bytes).",
            self.cfg.prefix,
            mime,
            image.len()
        ))
    }
}
