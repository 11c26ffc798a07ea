use std::future::Future;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use futures::stream::{self, StreamExt};
use serde::Serialize;

use crate::dates;

/// Upper bound on concurrent per-message operations (deletes, moves).
pub const MAX_CONCURRENT_OPERATIONS: usize = 4;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UserProfile {
    pub name: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailFolder {
    pub id: String,
    pub display_name: String,
    pub parent_folder_id: Option<String>,
    pub child_folder_count: u32,
    pub total_item_count: u32,
    pub unread_item_count: u32,
    pub is_hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Address {
    pub name: Option<String>,
    pub address: String,
}

impl Address {
    /// `Name <addr>` when a display name is known, the bare address otherwise.
    pub fn display(&self) -> String {
        match self.name.as_deref() {
            Some(name) => format!("{name} <{}>", self.address),
            None => self.address.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MessageSummary {
    pub id: Option<String>,
    pub subject: Option<String>,
    pub from: Option<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub is_read: bool,
    pub received_at: Option<DateTime<FixedOffset>>,
    pub sent_at: Option<DateTime<FixedOffset>>,
    pub has_attachments: bool,
    pub importance: Option<String>,
    pub conversation_id: Option<String>,
    pub parent_folder_id: Option<String>,
    pub web_link: Option<String>,
    pub body_preview: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageBody {
    pub content_type: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageDetail {
    #[serde(flatten)]
    pub summary: MessageSummary,
    pub body: Option<MessageBody>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MessagePage {
    pub messages: Vec<MessageSummary>,
    pub more_available: bool,
}

/// The minimal view of a message the purge loop needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageStub {
    pub id: String,
    pub subject: Option<String>,
    pub received_at: Option<DateTime<FixedOffset>>,
}

impl MessageStub {
    /// Returns `None` for messages without a usable id.
    pub fn from_summary(summary: MessageSummary) -> Option<Self> {
        let id = summary.id.filter(|id| !id.trim().is_empty())?;
        Some(Self {
            id,
            subject: summary.subject,
            received_at: summary.received_at,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    #[default]
    Descending,
}

impl SortOrder {
    fn keyword(self) -> &'static str {
        match self {
            Self::Ascending => "asc",
            Self::Descending => "desc",
        }
    }
}

/// A message listing request, ordered and filtered on `receivedDateTime`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageQuery {
    pub received_before: Option<DateTime<FixedOffset>>,
    pub received_on_or_after: Option<DateTime<FixedOffset>>,
    pub order: SortOrder,
    pub top: usize,
    pub skip: usize,
}

impl Default for MessageQuery {
    fn default() -> Self {
        Self {
            received_before: None,
            received_on_or_after: None,
            order: SortOrder::Descending,
            top: 25,
            skip: 0,
        }
    }
}

impl MessageQuery {
    pub fn odata_filter(&self) -> Option<String> {
        let mut clauses = Vec::new();
        if let Some(start) = &self.received_on_or_after {
            clauses.push(format!("receivedDateTime ge {}", dates::to_iso(start)));
        }
        if let Some(end) = &self.received_before {
            clauses.push(format!("receivedDateTime lt {}", dates::to_iso(end)));
        }
        if clauses.is_empty() {
            None
        } else {
            Some(clauses.join(" and "))
        }
    }

    pub fn odata_orderby(&self) -> String {
        format!("receivedDateTime {}", self.order.keyword())
    }

    /// Whether a message received at `received_at` satisfies the filter.
    pub fn matches(&self, received_at: Option<&DateTime<FixedOffset>>) -> bool {
        let Some(received_at) = received_at else {
            return self.received_before.is_none() && self.received_on_or_after.is_none();
        };
        self.received_before.is_none_or(|end| *received_at < end)
            && self
                .received_on_or_after
                .is_none_or(|start| *received_at >= start)
    }
}

/// The mail operations the purge loop depends on.
#[async_trait]
pub trait MailClient: Send + Sync {
    async fn list_messages(&self, folder_id: &str, query: &MessageQuery) -> Result<MessagePage>;

    async fn delete_message(&self, message_id: &str) -> Result<()>;
}

#[derive(Debug)]
pub struct OperationOutcome {
    pub message_id: String,
    pub result: Result<()>,
}

/// Runs `operation` for every id with at most `limit` calls in flight.
/// Every call settles before this returns; one failure never cancels the
/// others. Outcomes are returned in completion order.
pub async fn fan_out<F, Fut>(ids: Vec<String>, limit: usize, operation: F) -> Vec<OperationOutcome>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    stream::iter(ids.into_iter().map(move |id| {
        let call = operation(id.clone());
        async move {
            OperationOutcome {
                message_id: id,
                result: call.await,
            }
        }
    }))
    .buffer_unordered(limit.max(1))
    .collect()
    .await
}
