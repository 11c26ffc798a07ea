use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::auth::{AuthError, AuthRecord, CredentialStore};
use crate::config::AppConfig;

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 5;
const SLOW_DOWN_INCREMENT_SECONDS: u64 = 5;

/// What the user needs to complete a device-code sign-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCodePrompt {
    pub user_code: String,
    pub verification_uri: String,
    pub message: Option<String>,
    device_code: String,
    interval: u64,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    expires_in: u64,
    interval: Option<u64>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

/// Hands out bearer tokens for Graph, renewing them through the injected
/// credential store as they expire.
pub struct TokenProvider {
    http: Client,
    store: Arc<dyn CredentialStore>,
    client_id: String,
    tenant_id: String,
    scopes: Vec<String>,
    authority_url: String,
    current: Mutex<Option<AuthRecord>>,
}

impl TokenProvider {
    pub fn new(config: &AppConfig, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            http: Client::new(),
            store,
            client_id: config.client_id.clone(),
            tenant_id: config.tenant_id.clone(),
            scopes: config.scopes.clone(),
            authority_url: config.authority_url.trim_end_matches('/').to_string(),
            current: Mutex::new(None),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}/oauth2/v2.0/{path}", self.authority_url, self.tenant_id)
    }

    fn scope_string(&self) -> String {
        self.scopes.join(" ")
    }

    /// A valid access token, refreshed and persisted if the cached one is
    /// about to expire. Concurrent callers share a single refresh.
    pub async fn access_token(&self) -> Result<String, AuthError> {
        let mut current = self.current.lock().await;

        if current.is_none() {
            *current = self
                .store
                .load()?
                .filter(|record| record.belongs_to(&self.client_id, &self.tenant_id));
        }

        let record = current.as_ref().ok_or(AuthError::LoginRequired)?;
        if !record.is_expired(Utc::now()) {
            return Ok(record.access_token.clone());
        }

        let refresh_token = record
            .refresh_token
            .clone()
            .ok_or(AuthError::LoginRequired)?;
        debug!("access token expired; refreshing");
        let refreshed = self.refresh(record, &refresh_token).await?;
        self.store.save(&refreshed)?;
        let token = refreshed.access_token.clone();
        *current = Some(refreshed);
        Ok(token)
    }

    async fn refresh(
        &self,
        previous: &AuthRecord,
        refresh_token: &str,
    ) -> Result<AuthRecord, AuthError> {
        let scope = self.scope_string();
        let response = self
            .http
            .post(self.endpoint("token"))
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("scope", scope.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(oauth_error(&body));
        }

        let payload: TokenResponse = serde_json::from_str(&body)?;
        Ok(self.record_from(payload, previous.username.clone(), previous.refresh_token.clone()))
    }

    /// Starts a device-code sign-in. The caller shows the prompt to the user
    /// and then calls [`TokenProvider::complete_login`].
    pub async fn begin_login(&self) -> Result<DeviceCodePrompt, AuthError> {
        let scope = self.scope_string();
        let response = self
            .http
            .post(self.endpoint("devicecode"))
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("scope", scope.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(oauth_error(&body));
        }

        let payload: DeviceCodeResponse = serde_json::from_str(&body)?;
        Ok(DeviceCodePrompt {
            user_code: payload.user_code,
            verification_uri: payload.verification_uri,
            message: payload.message,
            device_code: payload.device_code,
            interval: payload.interval.unwrap_or(DEFAULT_POLL_INTERVAL_SECONDS),
            expires_in: payload.expires_in,
        })
    }

    /// Polls the token endpoint until the user approves the device code,
    /// then persists the resulting record.
    pub async fn complete_login(&self, prompt: &DeviceCodePrompt) -> Result<AuthRecord, AuthError> {
        let deadline = device_code_deadline(Utc::now(), prompt.expires_in)?;
        let mut interval = prompt.interval.max(1);

        loop {
            if Utc::now() >= deadline {
                return Err(AuthError::DeviceCodeExpired);
            }
            sleep(StdDuration::from_secs(interval)).await;

            let response = self
                .http
                .post(self.endpoint("token"))
                .form(&[
                    ("client_id", self.client_id.as_str()),
                    ("grant_type", DEVICE_CODE_GRANT),
                    ("device_code", prompt.device_code.as_str()),
                ])
                .send()
                .await?;

            let status = response.status();
            let body = response.text().await?;
            if status.is_success() {
                let payload: TokenResponse = serde_json::from_str(&body)?;
                let record = self.record_from(payload, None, None);
                self.store.save(&record)?;
                *self.current.lock().await = Some(record.clone());
                info!("device-code sign-in completed");
                return Ok(record);
            }

            match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(error) if error.error == "authorization_pending" => continue,
                Ok(error) if error.error == "slow_down" => {
                    interval += SLOW_DOWN_INCREMENT_SECONDS;
                    debug!("token endpoint asked to slow down; polling every {interval}s");
                }
                Ok(error) if error.error == "expired_token" => {
                    return Err(AuthError::DeviceCodeExpired)
                }
                _ => return Err(oauth_error(&body)),
            }
        }
    }

    /// Records which account the current sign-in belongs to.
    pub async fn remember_username(&self, username: &str) -> Result<(), AuthError> {
        let mut current = self.current.lock().await;
        if let Some(record) = current.as_mut() {
            record.username = Some(username.to_string());
            self.store.save(record)?;
        }
        Ok(())
    }

    pub async fn logout(&self) -> Result<(), AuthError> {
        *self.current.lock().await = None;
        self.store.clear()
    }

    fn record_from(
        &self,
        payload: TokenResponse,
        username: Option<String>,
        previous_refresh: Option<String>,
    ) -> AuthRecord {
        let scopes = payload
            .scope
            .map(|scope| scope.split_whitespace().map(str::to_string).collect())
            .unwrap_or_else(|| self.scopes.clone());
        AuthRecord {
            client_id: self.client_id.clone(),
            tenant_id: self.tenant_id.clone(),
            username,
            access_token: payload.access_token,
            refresh_token: payload.refresh_token.or(previous_refresh),
            expires_at: expiry_from(Utc::now(), payload.expires_in),
            scopes,
        }
    }
}

/// Lifetimes past what a timestamp can hold saturate at the latest one.
fn expiry_from(now: DateTime<Utc>, expires_in: i64) -> DateTime<Utc> {
    Duration::try_seconds(expires_in.max(0))
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn device_code_deadline(now: DateTime<Utc>, expires_in: u64) -> Result<DateTime<Utc>, AuthError> {
    i64::try_from(expires_in)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .ok_or_else(|| AuthError::OAuth {
            code: "invalid_response".to_string(),
            description: format!("device code lifetime of {expires_in}s is out of range"),
        })
}

fn oauth_error(body: &str) -> AuthError {
    match serde_json::from_str::<TokenErrorResponse>(body) {
        Ok(error) => AuthError::OAuth {
            code: error.error,
            description: error
                .error_description
                .map(|text| text.lines().next().unwrap_or_default().to_string())
                .unwrap_or_default(),
        },
        Err(_) => AuthError::OAuth {
            code: "unexpected_response".to_string(),
            description: body.trim().chars().take(200).collect(),
        },
    }
}
