use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::auth::TokenProvider;
use crate::config::AppConfig;
use crate::mail::{MailClient, MailFolder, MessageDetail, MessagePage, MessageQuery, UserProfile};

pub mod models;

use self::models::{
    ForwardRequest, GraphMailFolder, GraphMessage, GraphPage, GraphRecipient, GraphUser,
    MoveRequest, MESSAGE_SELECT_FIELDS, USER_SELECT_FIELDS,
};

const MAX_RATE_LIMIT_RETRIES: usize = 5;
const MAX_BACKOFF_SECONDS: u64 = 32;
const REDACTED_BODY_MAX_LEN: usize = 200;
const FOLDER_PAGE_SIZE: usize = 100;

/// A non-success response from Graph, other than exhausted throttling.
#[derive(Debug, Error)]
#[error("graph {label} request failed: status={status} body={body}")]
pub struct GraphStatusError {
    pub label: String,
    pub status: StatusCode,
    pub body: String,
}

impl GraphStatusError {
    pub fn is_not_found(&self) -> bool {
        self.status == StatusCode::NOT_FOUND || self.body.contains("ErrorItemNotFound")
    }
}

/// Folders the CLI never lists, along with everything beneath them.
pub const EXCLUDED_FOLDERS: &[&str] = &[
    "Conversation History",
    "Drafts",
    "Outbox",
    "RSS Subscriptions",
    "Sent Items",
];

pub fn is_excluded_folder(display_name: &str) -> bool {
    EXCLUDED_FOLDERS
        .iter()
        .any(|excluded| excluded.eq_ignore_ascii_case(display_name.trim()))
}

/// Client for the signed-in user's mailbox (`/me`). Dropping it releases
/// the underlying connection pool.
pub struct GraphClient {
    http: Client,
    base: String,
    tokens: Arc<TokenProvider>,
}

impl GraphClient {
    pub fn open(config: &AppConfig, tokens: Arc<TokenProvider>) -> Result<Self> {
        let base = config.graph_api_base.trim_end_matches('/').to_string();
        Url::parse(&base).with_context(|| format!("parse graph API base {base}"))?;
        let http = Client::builder()
            .connect_timeout(StdDuration::from_secs(30))
            .timeout(StdDuration::from_secs(120))
            .build()
            .context("build graph HTTP client")?;
        Ok(Self { http, base, tokens })
    }

    fn url(&self, path: &str) -> Result<Url> {
        let endpoint = format!("{}/{}", self.base, path.trim_start_matches('/'));
        Url::parse(&endpoint).with_context(|| format!("parse graph URL {endpoint}"))
    }

    pub async fn me(&self) -> Result<UserProfile> {
        let mut url = self.url("me")?;
        url.query_pairs_mut().append_pair("$select", USER_SELECT_FIELDS);
        let user: GraphUser = self.get_json(url.as_str(), "user profile").await?;
        Ok(user.into_profile())
    }

    /// Every folder in the mailbox except the excluded ones, with children
    /// listed before their parent.
    pub async fn mail_folders(&self) -> Result<Vec<MailFolder>> {
        let mut url = self.url("me/mailFolders")?;
        url.query_pairs_mut()
            .append_pair("includeHiddenFolders", "true")
            .append_pair("$top", &FOLDER_PAGE_SIZE.to_string());
        let top_level = self.folder_pages(url.to_string()).await?;

        let mut ordered = Vec::new();
        // (folder, children already expanded)
        let mut stack: Vec<(MailFolder, bool)> = top_level
            .into_iter()
            .rev()
            .map(|folder| (folder, false))
            .collect();

        while let Some((folder, expanded)) = stack.pop() {
            if expanded || folder.child_folder_count == 0 {
                ordered.push(folder);
                continue;
            }

            let mut url = self.url(&format!("me/mailFolders/{}/childFolders", folder.id))?;
            url.query_pairs_mut()
                .append_pair("includeHiddenFolders", "true")
                .append_pair("$top", &FOLDER_PAGE_SIZE.to_string());
            let children = self.folder_pages(url.to_string()).await?;

            stack.push((folder, true));
            stack.extend(children.into_iter().rev().map(|child| (child, false)));
        }

        debug!("graph: discovered {} folders", ordered.len());
        Ok(ordered)
    }

    async fn folder_pages(&self, first_url: String) -> Result<Vec<MailFolder>> {
        let mut folders = Vec::new();
        let mut next_url = Some(first_url);

        while let Some(url) = next_url {
            let page: GraphPage<GraphMailFolder> = self.get_json(&url, "mailFolders page").await?;
            folders.extend(
                page.value
                    .into_iter()
                    .filter_map(GraphMailFolder::into_folder)
                    .filter(|folder| !is_excluded_folder(&folder.display_name)),
            );
            next_url = page.next_link;
        }

        Ok(folders)
    }

    pub fn messages_url(&self, folder_id: &str, query: &MessageQuery) -> Result<Url> {
        let mut url = self.url(&format!("me/mailFolders/{folder_id}/messages"))?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(filter) = query.odata_filter() {
                pairs.append_pair("$filter", &filter);
            }
            pairs
                .append_pair("$orderby", &query.odata_orderby())
                .append_pair("$select", MESSAGE_SELECT_FIELDS)
                .append_pair("$top", &query.top.to_string());
            if query.skip > 0 {
                pairs.append_pair("$skip", &query.skip.to_string());
            }
        }
        Ok(url)
    }

    pub async fn get_message(&self, message_id: &str) -> Result<MessageDetail> {
        let url = self.url(&format!("me/messages/{message_id}"))?;
        let message: GraphMessage = self.get_json(url.as_str(), "message").await?;
        Ok(message.into_detail())
    }

    pub async fn move_message(&self, message_id: &str, destination_id: &str) -> Result<()> {
        let url = self.url(&format!("me/messages/{message_id}/move"))?;
        let body = MoveRequest { destination_id };
        self.send(Method::POST, url.as_str(), "move message", |request| {
            request.json(&body)
        })
        .await?;
        Ok(())
    }

    pub async fn forward_message(
        &self,
        message_id: &str,
        recipients: &[String],
        comment: Option<&str>,
    ) -> Result<()> {
        if recipients.is_empty() {
            return Err(anyhow!("forward needs at least one recipient"));
        }
        let url = self.url(&format!("me/messages/{message_id}/forward"))?;
        let body = ForwardRequest {
            to_recipients: recipients
                .iter()
                .map(|address| GraphRecipient::for_address(address))
                .collect(),
            comment,
        };
        self.send(Method::POST, url.as_str(), "forward message", |request| {
            request.json(&body)
        })
        .await?;
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, label: &str) -> Result<T> {
        let body = self.send(Method::GET, url, label, |request| request).await?;
        serde_json::from_str(&body).with_context(|| format!("decode graph {label} JSON"))
    }

    /// Sends one request, waiting out 429 responses with `Retry-After` or
    /// exponential backoff. Returns the response body on success.
    async fn send<F>(&self, method: Method, url: &str, label: &str, build: F) -> Result<String>
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let mut backoff_seconds = 1u64;

        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            let token = self
                .tokens
                .access_token()
                .await
                .context("acquire graph access token")?;

            debug!("graph {method} {url}");
            let request = self
                .http
                .request(method.clone(), url)
                .bearer_auth(&token)
                .header("accept", "application/json");
            let response = build(request)
                .send()
                .await
                .with_context(|| format!("request graph {label}"))?;

            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                if attempt == MAX_RATE_LIMIT_RETRIES {
                    let body = response
                        .text()
                        .await
                        .context("read graph 429 response body")?;
                    return Err(anyhow!(
                        "graph {label} request exhausted retries: {}",
                        redact_response_body(&body)
                    ));
                }

                let retry_after_seconds = response
                    .headers()
                    .get("retry-after")
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.trim().parse::<u64>().ok())
                    .unwrap_or(backoff_seconds);

                warn!("graph {label} throttled; retrying in {retry_after_seconds}s");
                sleep(StdDuration::from_secs(retry_after_seconds)).await;
                backoff_seconds = (backoff_seconds * 2).min(MAX_BACKOFF_SECONDS);
                continue;
            }

            let status = response.status();
            let body = response
                .text()
                .await
                .with_context(|| format!("read graph {label} response body"))?;
            if !status.is_success() {
                return Err(GraphStatusError {
                    label: label.to_string(),
                    status,
                    body: redact_response_body(&body),
                }
                .into());
            }

            return Ok(body);
        }

        Err(anyhow!("graph {label} request failed without response"))
    }
}

#[async_trait]
impl MailClient for GraphClient {
    async fn list_messages(&self, folder_id: &str, query: &MessageQuery) -> Result<MessagePage> {
        let url = self.messages_url(folder_id, query)?;
        let page: GraphPage<GraphMessage> = self.get_json(url.as_str(), "messages page").await?;
        Ok(page.into_message_page())
    }

    async fn delete_message(&self, message_id: &str) -> Result<()> {
        let url = self.url(&format!("me/messages/{message_id}"))?;
        match self
            .send(Method::DELETE, url.as_str(), "delete message", |request| request)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => {
                debug!(message_id, "message already gone; treating delete as done");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// Whether the error is Graph reporting that the item does not exist.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<GraphStatusError>()
        .is_some_and(GraphStatusError::is_not_found)
}

fn redact_response_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= REDACTED_BODY_MAX_LEN {
        return trimmed.to_string();
    }
    let cut = (0..=REDACTED_BODY_MAX_LEN)
        .rev()
        .find(|index| trimmed.is_char_boundary(*index))
        .unwrap_or(0);
    format!("{}…[truncated {} bytes]", &trimmed[..cut], trimmed.len())
}
