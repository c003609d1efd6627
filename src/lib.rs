//! Gostwriter: accepts image uploads, transcribes them to Markdown through a
//! vision-capable LLM client, and publishes the result to a configured
//! git-backed target.

pub mod api;
pub mod config;
pub mod error;
pub mod jobs;
pub mod llm;
pub mod logging;
pub mod processor;
pub mod storage;
pub mod targets;
pub mod util;

pub use error::{Error, Result};
