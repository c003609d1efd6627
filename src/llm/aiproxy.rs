//! OpenAI-compatible chat-completion client for image transcription.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::LlmClient;
use crate::config::AiProxyConfig;
use crate::{Error, Result};

const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const ERROR_SNIPPET_LIMIT: usize = 400;

const DEFAULT_SYSTEM_PROMPT: &str = "You are an expert OCR and document understanding assistant. \
Transcribe the provided image into clean, readable Markdown. Preserve headings, lists, tables, \
code blocks, and semantic structure. Do not add commentary; output only the transcription.";
const DEFAULT_INSTRUCTIONS: &str = "Please transcribe the content of this image into Markdown. \
Keep the original structure and formatting.";

/// Client posting chat-completion requests to an OpenAI-compatible proxy.
pub struct AiProxyClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    system_prompt: String,
    instructions: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl AiProxyClient {
    pub fn new(cfg: AiProxyConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key,
            model: cfg.model,
            system_prompt: cfg.system_prompt,
            instructions: cfg.instructions,
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
        }
    }

    fn build_request(&self, image_data_url: String) -> ChatCompletionRequest {
        let system = if self.system_prompt.trim().is_empty() {
            DEFAULT_SYSTEM_PROMPT
        } else {
            &self.system_prompt
        };
        let instructions = if self.instructions.trim().is_empty() {
            DEFAULT_INSTRUCTIONS
        } else {
            &self.instructions
        };

        ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: MessageContent::Text(system.to_string()),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: MessageContent::Parts(vec![
                        MessagePart::Text {
                            text: instructions.to_string(),
                        },
                        MessagePart::ImageUrl {
                            image_url: ImageUrl {
                                url: image_data_url,
                            },
                        },
                    ]),
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: false,
        }
    }
}

#[async_trait]
impl LlmClient for AiProxyClient {
    async fn transcribe(
        &self,
        cancel: &CancellationToken,
        image: &[u8],
        mime: &str,
    ) -> Result<String> {
        if image.is_empty() {
            return Err(Error::llm("image is empty"));
        }

        let body = self.build_request(build_data_url(mime, image));
        let url = format!("{}{}", self.base_url, CHAT_COMPLETIONS_PATH);

        let mut request = self.http.post(&url).json(&body);
        if !self.api_key.trim().is_empty() {
            request = request.bearer_auth(self.api_key.trim());
        }

        debug!(model = %self.model, %url, "sending transcription request");
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Canceled),
            res = request.send() => res.map_err(|e| Error::llm(format!("request failed: {e}")))?,
        };

        let status = response.status();
        let bytes = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Canceled),
            body = response.bytes() => body.map_err(|e| Error::llm(format!("read response: {e}")))?,
        };

        if !status.is_success() {
            let snippet = truncate(&String::from_utf8_lossy(&bytes), ERROR_SNIPPET_LIMIT);
            return Err(Error::llm(format!("aiproxy status {status}: {snippet}")));
        }

        let completion: ChatCompletionResponse = serde_json::from_slice(&bytes)
            .map_err(|e| Error::llm(format!("parse response: {e}")))?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        if content.is_empty() {
            return Err(Error::llm("empty completion"));
        }
        Ok(content)
    }
}

fn build_data_url(mime: &str, data: &[u8]) -> String {
    let mime = if mime.trim().is_empty() {
        "application/octet-stream"
    } else {
        mime.trim()
    };
    let encoded = base64::engine::general_purpose::STANDARD.encode(data);
    format!("data:{mime};base64,{encoded}")
}

fn truncate(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: MessageContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<MessagePart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum MessagePart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}
