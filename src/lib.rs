pub mod auth;
pub mod config;
pub mod dates;
pub mod graph;
pub mod mail;
pub mod output;
pub mod purge;

/// Serializes tests that mutate process-wide environment variables.
#[cfg(test)]
pub(crate) static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
