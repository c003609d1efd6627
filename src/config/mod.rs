//! Configuration loading.
//!
//! Configuration is a YAML document. Environment variables referenced as
//! `${VAR}` or `$VAR` are expanded before parsing; absent variables expand to
//! the empty string. Sizes accept `Ki/Mi/Gi`, `KiB/MiB/GiB`, decimal
//! `KB/MB/GB` and bare bytes; durations accept `ms/s/m/h` suffixes and bare
//! seconds.

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;

use crate::{Error, Result};

/// Environment variable naming the config file when no path is given.
pub const CONFIG_PATH_ENV: &str = "GOSTWRITER_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const DEFAULT_DATABASE_FILE: &str = "gostwriter.db";

/// Root configuration loaded from YAML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub target: TargetConfig,
}

/// HTTP server and runtime settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub address: String,
    pub read_timeout: DurationValue,
    pub write_timeout: DurationValue,
    pub idle_timeout: DurationValue,
    pub max_upload_size: ByteSize,
    pub worker_count: i64,
    pub storage_dir: String,
    /// Optional static API key checked against the `X-API-Key` header.
    pub api_key: String,
    /// Overrides the default `<storageDir>/gostwriter.db`.
    pub database_path: String,
    pub shutdown_grace: DurationValue,
    pub callback_retries: i64,
    pub callback_backoff: DurationValue,
    pub log_level: String,
}

/// LLM provider selection and provider-specific options.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// `"mock"` or `"aiproxy"`.
    pub provider: String,
    pub mock: MockLlmConfig,
    pub aiproxy: AiProxyConfig,
}

/// Settings for the deterministic mock LLM.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MockLlmConfig {
    pub delay: DurationValue,
    pub prefix: String,
}

/// Settings for the OpenAI-compatible AI proxy LLM.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AiProxyConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub system_prompt: String,
    pub instructions: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Target selection plus type-specific blocks.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TargetConfig {
    /// `"github"` or `"git"`.
    #[serde(rename = "type")]
    pub target_type: String,
    /// Logical name jobs are bound to.
    pub name: String,
    pub github: GithubTargetConfig,
    pub git: GitTargetConfig,
}

/// Hosted-repository target posting via the REST contents API.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GithubTargetConfig {
    pub repository_owner: String,
    pub repository_name: String,
    pub branch: String,
    pub base_path: String,
    pub filename_template: String,
    pub commit_message_template: String,
    pub author_name: String,
    pub author_email: String,
    pub api_base_url: String,
    pub auth: TokenAuthConfig,
}

/// Working-copy target driving the git CLI against a cached clone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GitTargetConfig {
    pub repo_url: String,
    pub branch: String,
    pub base_path: String,
    pub filename_template: String,
    pub commit_message_template: String,
    pub author_name: String,
    pub author_email: String,
    /// Overrides the default `<storageDir>/repos` cache root.
    pub clone_cache_dir: String,
    pub auth: BasicAuthConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TokenAuthConfig {
    pub token: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BasicAuthConfig {
    pub username: String,
    pub token: String,
}

impl ServerConfig {
    /// Worker count with the positive default applied.
    pub fn effective_worker_count(&self) -> usize {
        if self.worker_count <= 0 {
            DEFAULT_WORKER_COUNT
        } else {
            self.worker_count as usize
        }
    }

    /// Callback retry attempts with the positive default applied.
    pub fn effective_callback_retries(&self) -> u32 {
        if self.callback_retries <= 0 {
            DEFAULT_CALLBACK_RETRIES
        } else {
            self.callback_retries as u32
        }
    }
}

/// Default bounded queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 128;
/// Default worker count.
pub const DEFAULT_WORKER_COUNT: usize = 4;
/// Default callback attempt count.
pub const DEFAULT_CALLBACK_RETRIES: u32 = 3;

/// A byte size that deserializes from strings like `"10Mi"`, `"20MB"`,
/// `"512KiB"` or bare numbers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }
}

/// Parse a size string like `"10Mi"`, `"20MB"`, `"512KiB"`, `"1024"` into bytes.
///
/// Supports Kubernetes-style binary quantities (`Ki`, `Mi`, `Gi`,
/// case-insensitive), `KiB/MiB/GiB`, decimal `KB/MB/GB`, a bare `B` suffix,
/// and plain byte counts.
pub fn parse_byte_size(s: &str) -> Result<u64> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(Error::config("empty size"));
    }
    if trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return trimmed
            .parse::<u64>()
            .map_err(|e| Error::config(format!("invalid size number: {e}")));
    }

    let upper = trimmed.to_ascii_uppercase();
    // Longest suffixes first so "MiB" is not consumed as "B".
    const UNITS: &[(&str, u64)] = &[
        ("KIB", 1 << 10),
        ("MIB", 1 << 20),
        ("GIB", 1 << 30),
        ("KI", 1 << 10),
        ("MI", 1 << 20),
        ("GI", 1 << 30),
        ("KB", 1_000),
        ("MB", 1_000_000),
        ("GB", 1_000_000_000),
        ("B", 1),
    ];
    for (suffix, multiplier) in UNITS {
        if let Some(num) = upper.strip_suffix(suffix) {
            let num = trimmed[..num.len()].trim();
            let value: f64 = num
                .parse()
                .map_err(|e| Error::config(format!("invalid size number in {s:?}: {e}")))?;
            if value < 0.0 {
                return Err(Error::config(format!("negative size in {s:?}")));
            }
            return Ok((value * *multiplier as f64) as u64);
        }
    }
    Err(Error::config(format!("unknown size suffix in {s:?}")))
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ByteSizeVisitor;

        impl Visitor<'_> for ByteSizeVisitor {
            type Value = ByteSize;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a byte size number or string like \"10Mi\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<ByteSize, E> {
                Ok(ByteSize(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<ByteSize, E> {
                u64::try_from(v)
                    .map(ByteSize)
                    .map_err(|_| E::custom("negative byte size"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<ByteSize, E> {
                parse_byte_size(v).map(ByteSize).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(ByteSizeVisitor)
    }
}

/// A duration that deserializes from strings like `"15s"`, `"250ms"`, `"2m"`
/// or bare integer seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct DurationValue(pub Duration);

impl DurationValue {
    pub fn as_duration(self) -> Duration {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    /// Returns `self` unless zero, in which case `fallback`.
    pub fn or(self, fallback: Duration) -> Duration {
        if self.0.is_zero() {
            fallback
        } else {
            self.0
        }
    }
}

impl From<Duration> for DurationValue {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

/// Parse a duration string like `"15s"`, `"250ms"`, `"2m"`, `"1h"`.
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(Error::config("empty duration"));
    }
    if trimmed.bytes().all(|b| b.is_ascii_digit()) {
        let secs: u64 = trimmed
            .parse()
            .map_err(|e| Error::config(format!("invalid duration number: {e}")))?;
        return Ok(Duration::from_secs(secs));
    }

    const UNITS: &[(&str, f64)] = &[
        ("ms", 1e-3),
        ("s", 1.0),
        ("m", 60.0),
        ("h", 3_600.0),
    ];
    for (suffix, secs) in UNITS {
        if let Some(num) = trimmed.strip_suffix(suffix) {
            let value: f64 = num
                .trim()
                .parse()
                .map_err(|e| Error::config(format!("invalid duration number in {s:?}: {e}")))?;
            if value < 0.0 {
                return Err(Error::config(format!("negative duration in {s:?}")));
            }
            return Ok(Duration::from_secs_f64(value * secs));
        }
    }
    Err(Error::config(format!("unknown duration suffix in {s:?}")))
}

impl<'de> Deserialize<'de> for DurationValue {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl Visitor<'_> for DurationVisitor {
            type Value = DurationValue;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a duration string like \"15s\" or bare seconds")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<DurationValue, E> {
                Ok(DurationValue(Duration::from_secs(v)))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<DurationValue, E> {
                u64::try_from(v)
                    .map(|secs| DurationValue(Duration::from_secs(secs)))
                    .map_err(|_| E::custom("negative duration"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<DurationValue, E> {
                parse_duration(v).map(DurationValue).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

/// Expand `${VAR}` and `$VAR` references from the process environment.
/// Absent variables expand to the empty string.
pub fn expand_env(input: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("static pattern");
    re.replace_all(input, |caps: &regex::Captures<'_>| {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        env::var(name).unwrap_or_default()
    })
    .into_owned()
}

/// Read, expand, parse and validate configuration.
///
/// When `path` is empty, the `GOSTWRITER_CONFIG` environment variable is
/// consulted, then `config.yaml`. The storage directory is created and the
/// database path defaulted as part of loading.
pub fn load(path: &str) -> Result<Config> {
    let path = if !path.is_empty() {
        path.to_string()
    } else if let Ok(env_path) = env::var(CONFIG_PATH_ENV) {
        env_path
    } else {
        DEFAULT_CONFIG_PATH.to_string()
    };

    let raw = std::fs::read_to_string(&path)
        .map_err(|e| Error::config(format!("read config {path:?}: {e}")))?;
    let mut cfg = parse(&raw)?;

    std::fs::create_dir_all(&cfg.server.storage_dir)
        .map_err(|e| Error::config(format!("ensure storage dir: {e}")))?;
    if cfg.server.database_path.is_empty() {
        cfg.server.database_path = default_database_path(&cfg.server.storage_dir)
            .to_string_lossy()
            .into_owned();
    }
    Ok(cfg)
}

/// Parse and validate a configuration document from a string.
pub fn parse(raw: &str) -> Result<Config> {
    let expanded = expand_env(raw);
    let mut cfg: Config = serde_yaml::from_str(&expanded)
        .map_err(|e| Error::config(format!("parse config: {e}")))?;
    apply_defaults(&mut cfg);
    validate(&cfg)?;
    Ok(cfg)
}

fn apply_defaults(cfg: &mut Config) {
    let server = &mut cfg.server;
    if server.address.is_empty() {
        server.address = "0.0.0.0:8080".to_string();
    }
    if server.read_timeout.is_zero() {
        server.read_timeout = Duration::from_secs(15).into();
    }
    if server.write_timeout.is_zero() {
        server.write_timeout = Duration::from_secs(120).into();
    }
    if server.idle_timeout.is_zero() {
        server.idle_timeout = Duration::from_secs(60).into();
    }
    if server.max_upload_size.as_u64() == 0 {
        server.max_upload_size = ByteSize(10 * 1024 * 1024);
    }
    if server.storage_dir.is_empty() {
        server.storage_dir = "data".to_string();
    }
    if server.shutdown_grace.is_zero() {
        server.shutdown_grace = Duration::from_secs(15).into();
    }
    if server.callback_backoff.is_zero() {
        server.callback_backoff = Duration::from_secs(2).into();
    }
    if server.log_level.trim().is_empty() {
        server.log_level = "info".to_string();
    }

    let llm = &mut cfg.llm;
    if llm.provider.is_empty() {
        llm.provider = "mock".to_string();
    }
    if llm.mock.delay.is_zero() {
        llm.mock.delay = Duration::from_secs(2).into();
    }
    if llm.mock.prefix.is_empty() {
        llm.mock.prefix = "Transcribed by Mock".to_string();
    }
    if llm.provider.eq_ignore_ascii_case("aiproxy") {
        if llm.aiproxy.base_url.trim().is_empty() {
            llm.aiproxy.base_url = "http://localhost:8900".to_string();
        }
        if llm.aiproxy.model.trim().is_empty() {
            llm.aiproxy.model = "gpt-5".to_string();
        }
    }

    let target = &mut cfg.target;
    match target.target_type.as_str() {
        "github" => {
            target.github.base_path = normalize_base_path(&target.github.base_path);
            if target.github.api_base_url.trim().is_empty() {
                target.github.api_base_url = "https://api.github.com".to_string();
            }
        }
        "git" => {
            target.git.base_path = normalize_base_path(&target.git.base_path);
        }
        _ => {}
    }
}

fn validate(cfg: &Config) -> Result<()> {
    if cfg.target.name.trim().is_empty() {
        return Err(Error::config("target.name is required"));
    }
    match cfg.target.target_type.as_str() {
        "github" => {
            let g = &cfg.target.github;
            if g.repository_owner.trim().is_empty() {
                return Err(Error::config("target.github.repositoryOwner is required"));
            }
            if g.repository_name.trim().is_empty() {
                return Err(Error::config("target.github.repositoryName is required"));
            }
            if g.branch.trim().is_empty() {
                return Err(Error::config("target.github.branch is required"));
            }
            if g.auth.token.trim().is_empty() {
                return Err(Error::config("target.github.auth.token is required"));
            }
        }
        "git" => {
            let g = &cfg.target.git;
            if g.repo_url.trim().is_empty() {
                return Err(Error::config("target.git.repoUrl is required"));
            }
            if g.branch.trim().is_empty() {
                return Err(Error::config("target.git.branch is required"));
            }
            if g.auth.token.trim().is_empty() {
                return Err(Error::config("target.git.auth.token is required"));
            }
        }
        other => {
            return Err(Error::config(format!(
                "unsupported target type {other:?}"
            )));
        }
    }
    Ok(())
}

/// Canonicalize a base path: forward slashes only, trailing slash present,
/// no leading `./`.
fn normalize_base_path(p: &str) -> String {
    if p.is_empty() {
        return String::new();
    }
    let mut p = p.replace('\\', "/");
    if !p.ends_with('/') {
        p.push('/');
    }
    p.trim_start_matches("./").to_string()
}

/// Default database path for a given storage directory.
pub fn default_database_path(storage_dir: &str) -> PathBuf {
    Path::new(storage_dir).join(DEFAULT_DATABASE_FILE)
}
