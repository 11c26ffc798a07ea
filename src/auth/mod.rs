use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub mod crypto;
pub mod token;

pub use token::{DeviceCodePrompt, TokenProvider};

pub const CREDENTIAL_KEY_ENV: &str = "OUTLOOK_TOKEN_CACHE_KEY";

/// Tokens are treated as expired this long before their real expiry.
const EXPIRY_SKEW_SECONDS: i64 = 60;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("credential store: {0}")]
    Io(#[from] std::io::Error),

    #[error("json serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("token endpoint request: {0}")]
    Http(#[from] reqwest::Error),

    #[error("credential encryption: {0}")]
    Crypto(String),

    #[error("identity platform returned {code}: {description}")]
    OAuth { code: String, description: String },

    #[error("not signed in; run 'outlook login' first")]
    LoginRequired,

    #[error("device code expired before sign-in completed")]
    DeviceCodeExpired,
}

/// A persisted sign-in: enough to renew access without user interaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRecord {
    pub client_id: String,
    pub tenant_id: String,
    pub username: Option<String>,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
}

impl AuthRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - Duration::seconds(EXPIRY_SKEW_SECONDS) <= now
    }

    /// Whether this record was issued for the given app registration.
    pub fn belongs_to(&self, client_id: &str, tenant_id: &str) -> bool {
        self.client_id == client_id && self.tenant_id == tenant_id
    }
}

pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<Option<AuthRecord>, AuthError>;

    fn save(&self, record: &AuthRecord) -> Result<(), AuthError>;

    fn clear(&self) -> Result<(), AuthError>;
}

/// Stores the record as JSON on disk, sealed with AES-256-GCM when a key is
/// configured.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
    key: Option<[u8; crypto::KEY_BYTES]>,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>, key: Option<[u8; crypto::KEY_BYTES]>) -> Self {
        Self {
            path: path.into(),
            key,
        }
    }

    /// Builds a store whose key comes from `OUTLOOK_TOKEN_CACHE_KEY`.
    pub fn from_env(path: impl Into<PathBuf>) -> Result<Self, AuthError> {
        let key = std::env::var(CREDENTIAL_KEY_ENV)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(|value| crypto::parse_key_hex(&value))
            .transpose()?;
        Ok(Self::new(path, key))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_private(&self, contents: &str) -> Result<(), AuthError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path)?;
        // `mode` only applies on creation; an older file keeps its bits
        // until they are narrowed here, before any token is written.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(contents.as_bytes())?;
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Option<AuthRecord>, AuthError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };

        if crypto::is_envelope(&raw) {
            let Some(key) = self.key.as_ref() else {
                warn!(
                    "credential record at {} is encrypted but {CREDENTIAL_KEY_ENV} is not set",
                    self.path.display()
                );
                return Ok(None);
            };
            let plaintext = crypto::open(&raw, key)?;
            return Ok(Some(serde_json::from_slice(&plaintext)?));
        }

        let record: AuthRecord = serde_json::from_str(&raw)?;
        if self.key.is_some() {
            // Plaintext left over from before a key was configured.
            self.save(&record)?;
        }
        Ok(Some(record))
    }

    fn save(&self, record: &AuthRecord) -> Result<(), AuthError> {
        let plaintext = serde_json::to_string_pretty(record)?;
        let contents = match self.key.as_ref() {
            Some(key) => crypto::seal(plaintext.as_bytes(), key)?,
            None => plaintext,
        };
        self.write_private(&contents)
    }

    fn clear(&self) -> Result<(), AuthError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    record: Mutex<Option<AuthRecord>>,
}

impl MemoryCredentialStore {
    pub fn new(record: Option<AuthRecord>) -> Self {
        Self {
            record: Mutex::new(record),
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<AuthRecord>> {
        self.record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Result<Option<AuthRecord>, AuthError> {
        Ok(self.slot().clone())
    }

    fn save(&self, record: &AuthRecord) -> Result<(), AuthError> {
        *self.slot() = Some(record.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), AuthError> {
        *self.slot() = None;
        Ok(())
    }
}
