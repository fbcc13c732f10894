//! Credential resolution
//!
//! Cache lookup against the on-disk store, transparent refresh-token
//! exchange when the cached access token has expired, and fallback to the
//! interactive browser grant when no usable credential exists.

pub mod grant;
pub mod refresh;
pub mod resolver;

use std::path::Path;

use chrono::Utc;
use thiserror::Error;

use crate::store::{self, StoreError};

pub use resolver::CredentialResolver;

/// Terminal failures of a resolve request. A rejected refresh token is not
/// listed here: it is recovered locally by discarding the record and falling
/// through to the interactive grant.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("token refresh failed with a transient network error; try again")]
    TransientFailure(#[source] reqwest::Error),
    #[error("interactive authorization grant failed")]
    GrantFailed(#[source] anyhow::Error),
}

/// Print cached credential status for every stored user.
pub fn status(store_path: &Path) -> Result<(), StoreError> {
    let store = store::load(store_path)?.unwrap_or_default();
    if store.users.is_empty() {
        println!("No cached credentials.");
        return Ok(());
    }

    let now = Utc::now();
    for entry in &store.users {
        let state = if now < entry.data.token_expiry {
            "valid"
        } else {
            "expired"
        };
        println!(
            "{:<24} {:<8} (expires {})",
            entry.username,
            state,
            entry.data.token_expiry.to_rfc3339()
        );
    }
    Ok(())
}

/// Drop a user's cached credentials. Local removal only; the refresh token
/// is not revoked at the provider.
pub fn logout(store_path: &Path, username: &str) -> Result<(), StoreError> {
    let mut store = store::load(store_path)?.unwrap_or_default();
    if store.remove(username) {
        store::save(store_path, &store)?;
        println!("Removed cached credentials for {username}.");
    } else {
        println!("No cached credentials for {username}.");
    }
    Ok(())
}
