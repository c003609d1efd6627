//! Filename and commit-message rendering.
//!
//! Templates are small placeholder strings bound to the posting context:
//! `{job_id}`, `{title}`, `{meta:key}` and time codes `%Y %m %d %H %M %S`
//! expanded against the post timestamp (UTC). `%%` yields a literal percent.

use chrono::{DateTime, Datelike, Timelike, Utc};
use regex::Regex;

use super::PostRequest;

/// Default filename template (renders to `<YYYYMMDD-HHMMSS>-<JobID>.md`).
pub const DEFAULT_FILENAME_TEMPLATE: &str = "%Y%m%d-%H%M%S-{job_id}.md";
/// Default commit-message template.
pub const DEFAULT_COMMIT_TEMPLATE: &str = "Add transcription {job_id}";

/// Characters stripped from titles substituted into filenames.
const FILENAME_INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Render the filename for a post and join it under `base_path`.
///
/// `base_path` is expected in canonical form (forward slashes, trailing
/// slash); an empty render falls back to the default template.
pub fn render_filename(template: &str, base_path: &str, req: &PostRequest) -> String {
    let mut name = render(template, DEFAULT_FILENAME_TEMPLATE, req, true);
    if name.is_empty() {
        name = render(DEFAULT_FILENAME_TEMPLATE, DEFAULT_FILENAME_TEMPLATE, req, true);
    }
    let joined = format!("{base_path}{name}");
    joined.replace('\\', "/")
}

/// Render the commit message for a post.
pub fn render_commit_message(template: &str, req: &PostRequest) -> String {
    let msg = render(template, DEFAULT_COMMIT_TEMPLATE, req, false);
    if msg.is_empty() {
        render(DEFAULT_COMMIT_TEMPLATE, DEFAULT_COMMIT_TEMPLATE, req, false)
    } else {
        msg
    }
}

fn render(template: &str, fallback: &str, req: &PostRequest, sanitize: bool) -> String {
    let template = template.trim();
    let template = if template.is_empty() { fallback } else { template };

    let title = req.suggested_title.as_deref().unwrap_or_default();
    let title = if sanitize {
        sanitize_component(title)
    } else {
        title.to_string()
    };

    let mut out = template
        .replace("{job_id}", &req.job_id)
        .replace("{title}", &title);
    out = expand_metadata(&out, req, sanitize);
    out = expand_time(&out, req.timestamp);
    out.trim().to_string()
}

/// Replace `{meta:key}` with the metadata value when it is a string or number.
fn expand_metadata(input: &str, req: &PostRequest, sanitize: bool) -> String {
    let re = Regex::new(r"\{meta:([A-Za-z0-9_.-]+)\}").expect("static pattern");
    re.replace_all(input, |caps: &regex::Captures<'_>| {
        let key = &caps[1];
        let value = req
            .metadata
            .as_ref()
            .and_then(|m| m.get(key))
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default();
        if sanitize {
            sanitize_component(&value)
        } else {
            value
        }
    })
    .into_owned()
}

fn expand_time(input: &str, ts: DateTime<Utc>) -> String {
    input
        .replace("%%", "\u{0}")
        .replace("%Y", &format!("{:04}", ts.year()))
        .replace("%m", &format!("{:02}", ts.month()))
        .replace("%d", &format!("{:02}", ts.day()))
        .replace("%H", &format!("{:02}", ts.hour()))
        .replace("%M", &format!("{:02}", ts.minute()))
        .replace("%S", &format!("{:02}", ts.second()))
        .replace('\u{0}', "%")
}

/// Strip path separators and other unsafe characters from a filename part.
fn sanitize_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_was_replacement = false;
    for c in input.chars() {
        if c.is_control() || FILENAME_INVALID_CHARS.contains(&c) {
            if !last_was_replacement {
                out.push('_');
                last_was_replacement = true;
            }
        } else {
            out.push(c);
            last_was_replacement = false;
        }
    }
    out.trim_matches(|c| c == ' ' || c == '.').to_string()
}
