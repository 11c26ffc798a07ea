use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono_tz::Tz;
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_TENANT_ID: &str = "common";
pub const DEFAULT_SCOPES: &str = "User.Read Mail.ReadWrite Mail.Send offline_access";
pub const DEFAULT_TIMEZONE: Tz = Tz::America__Toronto;
pub const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";
pub const AUTHORITY_URL: &str = "https://login.microsoftonline.com";

const HOME_ENV: &str = "OUTLOOK_HOME";
const AUTH_CONFIG_ENV: &str = "OUTLOOK_AUTH_CONFIG";
const CLIENT_ID_ENV: &str = "OUTLOOK_CLIENT_ID";
const TENANT_ID_ENV: &str = "OUTLOOK_TENANT_ID";
const SCOPES_ENV: &str = "OUTLOOK_SCOPES";
const TIMEZONE_ENV: &str = "OUTLOOK_TIMEZONE";
const GRAPH_API_BASE_ENV: &str = "OUTLOOK_GRAPH_API_BASE";
const AUTHORITY_URL_ENV: &str = "OUTLOOK_AUTHORITY_URL";

const AUTH_CONFIG_FILE: &str = "auth.json";
const AUTH_RECORD_FILE: &str = "auth_record.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("missing {0}; set it in auth.json or the environment")]
    Missing(&'static str),

    #[error("invalid time zone '{0}'")]
    InvalidTimezone(String),

    #[error("failed to determine home directory")]
    NoHomeDirectory,
}

/// Application registration as stored in `auth.json`.
#[derive(Debug, Clone, Default, Deserialize)]
struct AuthFile {
    #[serde(rename = "clientId")]
    client_id: Option<String>,
    #[serde(rename = "tenantId")]
    tenant_id: Option<String>,
    #[serde(rename = "graphUserScopes")]
    graph_user_scopes: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub client_id: String,
    pub tenant_id: String,
    pub scopes: Vec<String>,
    pub timezone: Tz,
    pub graph_api_base: String,
    pub authority_url: String,
    pub home: PathBuf,
}

impl AppConfig {
    /// Resolves the configuration directory, reads `auth.json` if present and
    /// applies environment overrides on top.
    pub fn load() -> Result<Self, ConfigError> {
        let home = Self::default_home()?;
        let auth_path = env_value(AUTH_CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join(AUTH_CONFIG_FILE));
        Self::load_from(home, &auth_path)
    }

    pub fn load_from(home: PathBuf, auth_path: &Path) -> Result<Self, ConfigError> {
        let file = read_auth_file(auth_path)?;

        let client_id = env_value(CLIENT_ID_ENV)
            .or_else(|| non_empty(file.client_id))
            .ok_or(ConfigError::Missing("client id (clientId/OUTLOOK_CLIENT_ID)"))?;

        let tenant_id = env_value(TENANT_ID_ENV)
            .or_else(|| non_empty(file.tenant_id))
            .unwrap_or_else(|| DEFAULT_TENANT_ID.to_string());

        let scopes = env_value(SCOPES_ENV)
            .or_else(|| non_empty(file.graph_user_scopes))
            .unwrap_or_else(|| DEFAULT_SCOPES.to_string())
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let timezone = match env_value(TIMEZONE_ENV) {
            Some(name) => Tz::from_str(&name).map_err(|_| ConfigError::InvalidTimezone(name))?,
            None => DEFAULT_TIMEZONE,
        };

        Ok(Self {
            client_id,
            tenant_id,
            scopes,
            timezone,
            graph_api_base: env_value(GRAPH_API_BASE_ENV)
                .unwrap_or_else(|| GRAPH_API_BASE.to_string()),
            authority_url: env_value(AUTHORITY_URL_ENV)
                .unwrap_or_else(|| AUTHORITY_URL.to_string()),
            home,
        })
    }

    pub fn default_home() -> Result<PathBuf, ConfigError> {
        if let Some(home) = env_value(HOME_ENV) {
            return Ok(PathBuf::from(home));
        }
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDirectory)?;
        Ok(home.join(".outlook"))
    }

    pub fn auth_record_path(&self) -> PathBuf {
        self.home.join(AUTH_RECORD_FILE)
    }

    pub fn scope_string(&self) -> String {
        self.scopes.join(" ")
    }
}

fn read_auth_file(path: &Path) -> Result<AuthFile, ConfigError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Ok(AuthFile::default())
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    serde_json::from_str(&raw).map_err(|source| ConfigError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn env_value(key: &str) -> Option<String> {
    non_empty(std::env::var(key).ok())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
