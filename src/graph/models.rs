use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::mail::{
    Address, MailFolder, MessageBody, MessageDetail, MessagePage, MessageSummary, UserProfile,
};

pub(crate) const MESSAGE_SELECT_FIELDS: &str = concat!(
    "id,subject,from,toRecipients,ccRecipients,isRead,receivedDateTime,sentDateTime,",
    "hasAttachments,importance,conversationId,parentFolderId,webLink,bodyPreview"
);

pub(crate) const USER_SELECT_FIELDS: &str = "displayName,mail,userPrincipalName";

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct GraphUser {
    #[serde(rename = "displayName")]
    display_name: Option<String>,
    mail: Option<String>,
    #[serde(rename = "userPrincipalName")]
    user_principal_name: Option<String>,
}

impl GraphUser {
    /// Work accounts carry the address in `mail`, personal accounts only in
    /// `userPrincipalName`.
    pub(crate) fn into_profile(self) -> UserProfile {
        UserProfile {
            name: clean(self.display_name),
            address: clean(self.mail).or_else(|| clean(self.user_principal_name)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct GraphMailFolder {
    pub(crate) id: Option<String>,
    #[serde(rename = "displayName")]
    pub(crate) display_name: Option<String>,
    #[serde(rename = "parentFolderId")]
    parent_folder_id: Option<String>,
    #[serde(rename = "childFolderCount")]
    pub(crate) child_folder_count: Option<u32>,
    #[serde(rename = "totalItemCount")]
    total_item_count: Option<u32>,
    #[serde(rename = "unreadItemCount")]
    unread_item_count: Option<u32>,
    #[serde(rename = "isHidden")]
    is_hidden: Option<bool>,
}

impl GraphMailFolder {
    /// Folders without an id or a name are unusable and dropped.
    pub(crate) fn into_folder(self) -> Option<MailFolder> {
        let id = clean(self.id)?;
        let display_name = clean(self.display_name)?;
        Some(MailFolder {
            id,
            display_name,
            parent_folder_id: clean(self.parent_folder_id),
            child_folder_count: self.child_folder_count.unwrap_or(0),
            total_item_count: self.total_item_count.unwrap_or(0),
            unread_item_count: self.unread_item_count.unwrap_or(0),
            is_hidden: self.is_hidden.unwrap_or(false),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct GraphPage<T> {
    pub(crate) value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    pub(crate) next_link: Option<String>,
}

impl GraphPage<GraphMessage> {
    pub(crate) fn into_message_page(self) -> MessagePage {
        MessagePage {
            more_available: self.next_link.is_some(),
            messages: self
                .value
                .into_iter()
                .map(GraphMessage::into_summary)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct GraphMessage {
    id: Option<String>,
    subject: Option<String>,
    from: Option<GraphRecipient>,
    #[serde(rename = "toRecipients")]
    to_recipients: Option<Vec<GraphRecipient>>,
    #[serde(rename = "ccRecipients")]
    cc_recipients: Option<Vec<GraphRecipient>>,
    #[serde(rename = "isRead")]
    is_read: Option<bool>,
    #[serde(rename = "receivedDateTime")]
    received_date_time: Option<String>,
    #[serde(rename = "sentDateTime")]
    sent_date_time: Option<String>,
    #[serde(rename = "hasAttachments")]
    has_attachments: Option<bool>,
    importance: Option<String>,
    #[serde(rename = "conversationId")]
    conversation_id: Option<String>,
    #[serde(rename = "parentFolderId")]
    parent_folder_id: Option<String>,
    #[serde(rename = "webLink")]
    web_link: Option<String>,
    #[serde(rename = "bodyPreview")]
    body_preview: Option<String>,
    body: Option<GraphBody>,
}

impl GraphMessage {
    pub(crate) fn into_summary(self) -> MessageSummary {
        self.into_detail().summary
    }

    pub(crate) fn into_detail(self) -> MessageDetail {
        let summary = MessageSummary {
            id: clean(self.id),
            subject: self.subject,
            from: self.from.as_ref().and_then(GraphRecipient::to_address),
            to: recipient_addresses(self.to_recipients.as_deref()),
            cc: recipient_addresses(self.cc_recipients.as_deref()),
            is_read: self.is_read.unwrap_or(false),
            received_at: parse_timestamp(self.received_date_time.as_deref()),
            sent_at: parse_timestamp(self.sent_date_time.as_deref()),
            has_attachments: self.has_attachments.unwrap_or(false),
            importance: clean(self.importance),
            conversation_id: clean(self.conversation_id),
            parent_folder_id: clean(self.parent_folder_id),
            web_link: clean(self.web_link),
            body_preview: clean(self.body_preview),
        };
        MessageDetail {
            summary,
            body: self.body.and_then(GraphBody::into_body),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct GraphRecipient {
    #[serde(rename = "emailAddress")]
    email_address: Option<GraphEmailAddress>,
}

impl GraphRecipient {
    pub(crate) fn for_address(address: &str) -> Self {
        Self {
            email_address: Some(GraphEmailAddress {
                name: None,
                address: Some(address.to_string()),
            }),
        }
    }

    fn to_address(&self) -> Option<Address> {
        let email = self.email_address.as_ref()?;
        let address = clean(email.address.clone())?;
        Some(Address {
            name: clean(email.name.clone()),
            address,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GraphEmailAddress {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GraphBody {
    #[serde(rename = "contentType")]
    content_type: Option<String>,
    content: Option<String>,
}

impl GraphBody {
    fn into_body(self) -> Option<MessageBody> {
        let content = self.content.filter(|text| !text.trim().is_empty())?;
        Some(MessageBody {
            content_type: clean(self.content_type)
                .map(|kind| kind.to_ascii_lowercase())
                .unwrap_or_else(|| "text".to_string()),
            content,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct MoveRequest<'a> {
    #[serde(rename = "destinationId")]
    pub(crate) destination_id: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ForwardRequest<'a> {
    #[serde(rename = "toRecipients")]
    pub(crate) to_recipients: Vec<GraphRecipient>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) comment: Option<&'a str>,
}

fn recipient_addresses(recipients: Option<&[GraphRecipient]>) -> Vec<Address> {
    recipients
        .unwrap_or_default()
        .iter()
        .filter_map(GraphRecipient::to_address)
        .collect()
}

fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<FixedOffset>> {
    raw.and_then(|value| DateTime::parse_from_rfc3339(value.trim()).ok())
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
