use chrono::{DateTime, FixedOffset};

use crate::dates;
use crate::mail::{Address, MailFolder, MessageDetail, MessagePage, MessageStub, MessageSummary, UserProfile};
use crate::output::{or_none, sanitize_for_output, sanitize_multiline, NONE};

const HTML_RENDER_WIDTH: usize = 120;

pub fn format_user(user: &UserProfile) -> String {
    format!(
        "{}|{}",
        or_none(user.name.as_deref()),
        or_none(user.address.as_deref())
    )
}

pub fn format_folders(folders: &[MailFolder]) -> String {
    folders
        .iter()
        .map(|folder| {
            [
                sanitize_for_output(&folder.display_name),
                folder.id.clone(),
                format!("parent={}", or_none(folder.parent_folder_id.as_deref())),
                format!("children={}", folder.child_folder_count),
                format!("total={}", folder.total_item_count),
                format!("unread={}", folder.unread_item_count),
                format!("hidden={}", folder.is_hidden),
            ]
            .join("|")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_message_page(page: &MessagePage) -> String {
    let mut out = String::new();
    for message in &page.messages {
        out.push_str(&format_summary(message));
        out.push('\n');
    }
    out.push_str(&format!("--- more={} ---", page.more_available));
    out
}

pub fn format_summary(message: &MessageSummary) -> String {
    [
        or_none(message.id.as_deref()),
        or_none(message.subject.as_deref()),
        from_field(message.from.as_ref()),
        format!("to={}", addresses_field(&message.to)),
        format!("cc={}", addresses_field(&message.cc)),
        read_state(message).to_string(),
        timestamp_field(message.received_at.as_ref()),
        format!("sent={}", timestamp_field(message.sent_at.as_ref())),
        format!("attachments={}", message.has_attachments),
        format!("importance={}", importance(message)),
        format!("conversation={}", or_none(message.conversation_id.as_deref())),
        format!("folder={}", or_none(message.parent_folder_id.as_deref())),
        format!("weblink={}", or_none(message.web_link.as_deref())),
    ]
    .join("|")
}

pub fn format_message(detail: &MessageDetail) -> String {
    let message = &detail.summary;
    let header = [
        format!("id={}", or_none(message.id.as_deref())),
        format!("subject={}", or_none(message.subject.as_deref())),
        format!("from={}", from_field(message.from.as_ref())),
        format!("to={}", addresses_field(&message.to)),
        format!("cc={}", addresses_field(&message.cc)),
        format!("received={}", timestamp_field(message.received_at.as_ref())),
        format!("sent={}", timestamp_field(message.sent_at.as_ref())),
        format!("status={}", read_state(message)),
        format!("attachments={}", message.has_attachments),
        format!("importance={}", importance(message)),
        format!("conversation={}", or_none(message.conversation_id.as_deref())),
        format!("folder={}", or_none(message.parent_folder_id.as_deref())),
        format!("weblink={}", or_none(message.web_link.as_deref())),
    ]
    .join("|");

    let body_type = detail
        .body
        .as_ref()
        .map(|body| body.content_type.as_str())
        .unwrap_or("text");
    let body = detail
        .body
        .as_ref()
        .map(|body| render_body(&body.content_type, &body.content))
        .filter(|text| !text.trim().is_empty())
        .unwrap_or_else(|| "(No body content)".to_string());

    format!("{header}\n\n--- Body ({body_type}) ---\n{body}")
}

/// Plain-text rendering of a body; HTML goes through `html2text`.
pub fn render_body(content_type: &str, content: &str) -> String {
    if !content_type.eq_ignore_ascii_case("html") {
        return sanitize_multiline(content);
    }

    let plain = std::panic::catch_unwind(|| {
        html2text::from_read(content.as_bytes(), HTML_RENDER_WIDTH)
            .lines()
            .map(str::trim_end)
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    })
    .unwrap_or_default();
    sanitize_multiline(&plain)
}

pub fn purge_message_line(dry_run: bool, stub: &MessageStub) -> String {
    format!(
        "{}|{}|{}|{}",
        if dry_run { "DRY-RUN" } else { "DELETING" },
        sanitize_for_output(&stub.id),
        or_none(stub.subject.as_deref()),
        timestamp_field(stub.received_at.as_ref())
    )
}

pub fn progress_line(total: u64, iteration: u64, batch: usize) -> String {
    format!("PROGRESS|total={total}|iteration={iteration}|batch={batch}")
}

pub fn result_line(dry_run: bool, total: u64, folder_id: &str, cutoff: &DateTime<FixedOffset>) -> String {
    format!(
        "RESULT|{}|total={total}|folder_id={}|before={}",
        if dry_run { "DRY-RUN" } else { "DELETED" },
        sanitize_for_output(folder_id),
        dates::to_iso(cutoff)
    )
}

pub fn delete_failed_line(message_id: &str, error: &anyhow::Error) -> String {
    format!(
        "DELETE-FAILED|{}|{}",
        sanitize_for_output(message_id),
        sanitize_for_output(&format!("{error:#}"))
    )
}

pub fn ok_line(fields: &[&str]) -> String {
    std::iter::once("OK".to_string())
        .chain(fields.iter().map(|field| sanitize_for_output(field)))
        .collect::<Vec<_>>()
        .join("|")
}

pub fn error_line(operation: &str, message_id: &str, error: &anyhow::Error) -> String {
    format!(
        "ERROR|{operation}|{}|{}",
        sanitize_for_output(message_id),
        sanitize_for_output(&format!("{error:#}"))
    )
}

fn from_field(from: Option<&Address>) -> String {
    from.map(|address| sanitize_for_output(&address.display()))
        .unwrap_or_else(|| NONE.to_string())
}

fn addresses_field(addresses: &[Address]) -> String {
    if addresses.is_empty() {
        return NONE.to_string();
    }
    sanitize_for_output(
        &addresses
            .iter()
            .map(|address| address.address.as_str())
            .collect::<Vec<_>>()
            .join(","),
    )
}

fn timestamp_field(value: Option<&DateTime<FixedOffset>>) -> String {
    value
        .map(dates::to_display)
        .unwrap_or_else(|| NONE.to_string())
}

fn read_state(message: &MessageSummary) -> &'static str {
    if message.is_read {
        "read"
    } else {
        "unread"
    }
}

fn importance(message: &MessageSummary) -> String {
    message
        .importance
        .as_deref()
        .map(|value| sanitize_for_output(&value.to_ascii_lowercase()))
        .unwrap_or_else(|| "normal".to_string())
}
