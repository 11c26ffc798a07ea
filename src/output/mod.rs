pub mod json;
pub mod lines;

use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;

use crate::mail::{MailFolder, MessageDetail, MessagePage, UserProfile};

pub const NONE: &str = "NONE";

static SEPARATOR_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{Cc}\p{Zl}\p{Zp}\s]+").expect("valid separator regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Lines,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Lines
        }
    }
}

/// Makes free text safe to embed as one field of a pipe-delimited line.
/// Whitespace and control runs collapse to a single space; `\` and `|` are
/// backslash-escaped.
pub fn sanitize_for_output(text: &str) -> String {
    SEPARATOR_RUNS
        .replace_all(text, " ")
        .trim()
        .replace('\\', "\\\\")
        .replace('|', "\\|")
}

/// Like [`sanitize_for_output`] but keeps line structure, for message bodies.
pub fn sanitize_multiline(text: &str) -> String {
    text.replace("\r\n", "\n")
        .chars()
        .filter(|ch| *ch == '\n' || *ch == '\t' || !ch.is_control())
        .collect::<String>()
        .trim_end()
        .to_string()
}

pub fn or_none(value: Option<&str>) -> String {
    value
        .map(sanitize_for_output)
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| NONE.to_string())
}

pub fn format_user(format: OutputFormat, user: &UserProfile) -> Result<String> {
    match format {
        OutputFormat::Lines => Ok(lines::format_user(user)),
        OutputFormat::Json => json::format_user(user),
    }
}

pub fn format_folders(format: OutputFormat, folders: &[MailFolder]) -> Result<String> {
    match format {
        OutputFormat::Lines => Ok(lines::format_folders(folders)),
        OutputFormat::Json => json::format_folders(folders),
    }
}

pub fn format_message_page(format: OutputFormat, page: &MessagePage) -> Result<String> {
    match format {
        OutputFormat::Lines => Ok(lines::format_message_page(page)),
        OutputFormat::Json => json::format_message_page(page),
    }
}

pub fn format_message(format: OutputFormat, message: &MessageDetail) -> Result<String> {
    match format {
        OutputFormat::Lines => Ok(lines::format_message(message)),
        OutputFormat::Json => json::format_message(message),
    }
}
