//! Persistent multi-user credential store
//!
//! One JSON file holds the cached access/refresh token pairs for every
//! username this tool has authorized. Writes go through a temp file in the
//! same directory followed by a rename, so a reader never observes a
//! partially written store.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Schema tag written on every save. Files without a `users` key predate
/// versioning entirely and go through [`upgrade`].
pub const STORE_VERSION: u32 = 1;

/// Store file name, both for the per-OS data dir and the local-state override.
pub const STORE_FILE: &str = "creds.data";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read credential store at {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("credential store at {path} is corrupt; delete or repair it manually")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode credential store")]
    Encode(#[source] serde_json::Error),
    #[error("failed to write credential store at {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One user's cached credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub access_token: String,
    pub refresh_token: String,
    /// Absolute instant the access token stops being valid (UTC). Compared
    /// as a parsed timestamp, never as a string.
    pub token_expiry: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    pub username: String,
    pub data: CredentialRecord,
}

/// The whole on-disk store. At most one entry per username survives any
/// completed operation (merge is last-write-wins).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialStore {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub users: Vec<UserEntry>,
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            users: Vec::new(),
        }
    }
}

impl CredentialStore {
    pub fn find(&self, username: &str) -> Option<&CredentialRecord> {
        self.users
            .iter()
            .find(|entry| entry.username == username)
            .map(|entry| &entry.data)
    }

    /// Insert or replace the record for `username`; other entries untouched.
    pub fn merge(&mut self, username: &str, record: CredentialRecord) {
        match self
            .users
            .iter_mut()
            .find(|entry| entry.username == username)
        {
            Some(entry) => entry.data = record,
            None => self.users.push(UserEntry {
                username: username.to_string(),
                data: record,
            }),
        }
    }

    /// Drop the record for `username`. Returns whether anything was removed.
    pub fn remove(&mut self, username: &str) -> bool {
        let before = self.users.len();
        self.users.retain(|entry| entry.username != username);
        self.users.len() != before
    }
}

/// Read and parse the store file. A missing file is not an error (`None`);
/// an unparseable one is.
pub fn load(path: &Path) -> Result<Option<CredentialStore>, StoreError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let value: serde_json::Value = serde_json::from_str(&raw).map_err(|source| {
        StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        }
    })?;

    if value.get("users").is_some() {
        let store = serde_json::from_value(value).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Some(store))
    } else {
        Ok(Some(upgrade(value)))
    }
}

/// Upgrade a legacy store (bare token fields, no `users` wrapper) to the
/// wrapped schema. A legacy record that carries a `username` field is
/// attributed to that user; one without cannot be safely attributed to
/// anybody and is discarded with a warning.
pub fn upgrade(raw: serde_json::Value) -> CredentialStore {
    let username = raw
        .get("username")
        .and_then(|value| value.as_str())
        .map(str::to_string);

    let mut store = CredentialStore::default();
    match (username, serde_json::from_value::<CredentialRecord>(raw)) {
        (Some(username), Ok(data)) => {
            tracing::info!("upgrading legacy credential store for {username}");
            store.users.push(UserEntry { username, data });
        }
        _ => {
            tracing::warn!(
                "legacy credential store has no username attribution; discarding its record"
            );
        }
    }
    store
}

/// Serialize and write the store atomically: temp file in the destination
/// directory, then rename over the target.
pub fn save(path: &Path, store: &CredentialStore) -> Result<(), StoreError> {
    let write_err = |source: std::io::Error| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };

    let parent = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&parent).map_err(write_err)?;

    let on_disk = CredentialStore {
        version: STORE_VERSION,
        users: store.users.clone(),
    };
    let json = serde_json::to_string_pretty(&on_disk).map_err(StoreError::Encode)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&parent).map_err(write_err)?;
    tmp.write_all(json.as_bytes()).map_err(write_err)?;
    tmp.flush().map_err(write_err)?;

    // Store holds tokens; keep it private to the owner.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600)).map_err(write_err)?;
    }

    tmp.persist(path).map_err(|err| StoreError::Write {
        path: path.to_path_buf(),
        source: err.error,
    })?;
    Ok(())
}
