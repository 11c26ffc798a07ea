use anyhow::Result;

use crate::mail::{MailFolder, MessageDetail, MessagePage, UserProfile};

pub fn format_user(user: &UserProfile) -> Result<String> {
    Ok(serde_json::to_string_pretty(user)?)
}

pub fn format_folders(folders: &[MailFolder]) -> Result<String> {
    Ok(serde_json::to_string_pretty(folders)?)
}

pub fn format_message_page(page: &MessagePage) -> Result<String> {
    Ok(serde_json::to_string_pretty(page)?)
}

pub fn format_message(message: &MessageDetail) -> Result<String> {
    Ok(serde_json::to_string_pretty(message)?)
}
