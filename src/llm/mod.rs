//! Language-model clients for image transcription.

pub mod aiproxy;
pub mod mock;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::Result;

pub use aiproxy::AiProxyClient;
pub use mock::MockClient;

/// Capability to transcribe an image into Markdown.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Transcribe `image` (with the given media type) into a Markdown string.
    ///
    /// Empty input fails fast. Implementations return promptly with
    /// [`crate::Error::Canceled`] when `cancel` fires, even mid-request.
    async fn transcribe(
        &self,
        cancel: &CancellationToken,
        image: &[u8],
        mime: &str,
    ) -> Result<String>;
}
