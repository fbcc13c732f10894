//! Process configuration
//!
//! All inputs the resolver needs are collected once into [`Settings`] at
//! startup; the core never reads the environment on its own. Client id and
//! secret come from the environment (a `.env` file is honored), matching the
//! deployment shape of the SMTP client this tool serves.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use thiserror::Error;

use crate::store::STORE_FILE;

const DEFAULT_SCOPE: &str = "https://www.googleapis.com/auth/gmail.send";
const DEFAULT_REDIRECT_URL: &str = "http://127.0.0.1";
const DEFAULT_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";
const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Timeout for the refresh POST; converts a hung provider into a transient
/// failure instead of a wedged process.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("required configuration value `{0}` is missing or empty")]
    Missing(&'static str),
    #[error("could not determine a per-user data directory for the credential store")]
    NoDataDir,
}

/// Everything the resolver and grant flow need, validated before any file or
/// network operation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub scope: String,
    pub redirect_url: String,
    pub auth_url: String,
    pub token_url: String,
    pub store_path: PathBuf,
}

impl Settings {
    pub fn from_env(username_override: Option<String>) -> Result<Self, SettingsError> {
        Ok(Self {
            client_id: require("CLIENT_ID")?,
            client_secret: require("CLIENT_SECRET")?,
            username: resolve_username(username_override)?,
            scope: env_or("SCOPE", DEFAULT_SCOPE),
            redirect_url: env_or("REDIRECT_URL", DEFAULT_REDIRECT_URL),
            auth_url: env_or("AUTH_URL", DEFAULT_AUTH_URL),
            token_url: env_or("TOKEN_URL", DEFAULT_TOKEN_URL),
            store_path: default_store_path()?,
        })
    }
}

/// The SMTP client passes the account through the lowercase `username`
/// environment variable; a CLI flag wins when given.
pub fn resolve_username(flag: Option<String>) -> Result<String, SettingsError> {
    match flag {
        Some(username) if !username.trim().is_empty() => Ok(username),
        _ => require("username"),
    }
}

/// Pure store-path decision, unit-testable without touching the OS.
/// `use_local_state` pins the store to `creds.data` in the working directory.
pub fn resolve_store_path(use_local_state: bool, data_dir: Option<&Path>) -> Option<PathBuf> {
    if use_local_state {
        return Some(PathBuf::from(STORE_FILE));
    }
    data_dir.map(|dir| dir.join(STORE_FILE))
}

/// Store path for this invocation: the per-OS application data directory,
/// unless the `uselocalstate` flag variable is set.
pub fn default_store_path() -> Result<PathBuf, SettingsError> {
    let use_local_state = env::var_os("uselocalstate").is_some();
    let data_dir = ProjectDirs::from("com", "xoauth2-token", "xoauth2-token")
        .map(|dirs| dirs.data_dir().to_path_buf());
    resolve_store_path(use_local_state, data_dir.as_deref()).ok_or(SettingsError::NoDataDir)
}

fn require(key: &'static str) -> Result<String, SettingsError> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(SettingsError::Missing(key)),
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}
