//! The resolve state machine
//!
//! Per request: `Lookup -> Valid | Expired | Absent`. A valid cached token
//! is returned with zero network calls. An expired one goes through the
//! refresh exchange; rejection demotes the record to absent, a transport
//! failure aborts with the store untouched. An absent record falls through
//! to the interactive grant collaborator.

use std::path::PathBuf;

use chrono::{Duration, Utc};

use super::refresh::{RefreshError, RefreshedToken};
use super::ResolveError;
use crate::config::Settings;
use crate::store::{self, CredentialRecord};

/// Refresh-exchange seam, so tests can stand in for the provider.
#[allow(async_fn_in_trait)]
pub trait RefreshTokens {
    async fn refresh(
        &self,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> Result<RefreshedToken, RefreshError>;
}

/// Interactive grant seam. Produces the initial credential tuple when
/// nothing cached is usable.
#[allow(async_fn_in_trait)]
pub trait ObtainGrant {
    async fn obtain(&self) -> anyhow::Result<CredentialRecord>;
}

pub struct CredentialResolver<R, G> {
    client_id: String,
    client_secret: String,
    store_path: PathBuf,
    refresher: R,
    grant: G,
}

impl<R, G> CredentialResolver<R, G>
where
    R: RefreshTokens,
    G: ObtainGrant,
{
    pub fn new(settings: &Settings, refresher: R, grant: G) -> Self {
        Self {
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            store_path: settings.store_path.clone(),
            refresher,
            grant,
        }
    }

    /// Resolve a valid access token for `username`.
    pub async fn resolve(&self, username: &str) -> Result<String, ResolveError> {
        // Captured once and reused for both the expiry comparison and the
        // new absolute expiry, so the two cannot skew.
        let now = Utc::now();

        let mut store = store::load(&self.store_path)?.unwrap_or_default();
        match store.find(username).cloned() {
            // Strict comparison: a token expiring exactly now is expired.
            Some(record) if now < record.token_expiry => {
                tracing::debug!("cached access token for {username} is still valid");
                return Ok(record.access_token);
            }
            Some(record) => {
                tracing::info!("cached access token for {username} expired; refreshing");
                match self
                    .refresher
                    .refresh(&self.client_id, &self.client_secret, &record.refresh_token)
                    .await
                {
                    Ok(refreshed) => {
                        let mut updated = record;
                        updated.access_token = refreshed.access_token.clone();
                        updated.token_expiry = now + Duration::seconds(refreshed.expires_in as i64);
                        if let Some(rotated) = refreshed.refresh_token {
                            tracing::debug!("provider rotated the refresh token for {username}");
                            updated.refresh_token = rotated;
                        }
                        store.merge(username, updated);
                        store::save(&self.store_path, &store)?;
                        return Ok(refreshed.access_token);
                    }
                    Err(RefreshError::Rejected { status, .. }) => {
                        // A dead refresh token must not wedge future lookups.
                        tracing::warn!(
                            "provider rejected the refresh token for {username} (HTTP {status}); \
                             discarding the record"
                        );
                        store.remove(username);
                        store::save(&self.store_path, &store)?;
                    }
                    Err(RefreshError::Network(err)) => {
                        return Err(ResolveError::TransientFailure(err));
                    }
                }
            }
            None => {
                tracing::info!("no cached credentials for {username}");
            }
        }

        // Absent: fall through to the interactive grant.
        let record = self
            .grant
            .obtain()
            .await
            .map_err(ResolveError::GrantFailed)?;
        let access_token = record.access_token.clone();
        store.merge(username, record);
        store::save(&self.store_path, &store)?;
        Ok(access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::store::{CredentialStore, STORE_FILE};

    enum RefreshBehavior {
        Succeed(RefreshedToken),
        Reject(u16),
        FailTransport,
    }

    struct FakeRefresher {
        behavior: RefreshBehavior,
        calls: AtomicUsize,
    }

    impl FakeRefresher {
        fn new(behavior: RefreshBehavior) -> Self {
            Self {
                behavior,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl RefreshTokens for FakeRefresher {
        async fn refresh(
            &self,
            _client_id: &str,
            _client_secret: &str,
            _refresh_token: &str,
        ) -> Result<RefreshedToken, RefreshError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                RefreshBehavior::Succeed(token) => Ok(token.clone()),
                RefreshBehavior::Reject(status) => Err(RefreshError::Rejected {
                    status: *status,
                    body: String::new(),
                }),
                RefreshBehavior::FailTransport => {
                    Err(RefreshError::Network(local_connect_error().await))
                }
            }
        }
    }

    struct FakeGrant {
        record: Option<CredentialRecord>,
        calls: AtomicUsize,
    }

    impl FakeGrant {
        fn yielding(record: CredentialRecord) -> Self {
            Self {
                record: Some(record),
                calls: AtomicUsize::new(0),
            }
        }

        fn unavailable() -> Self {
            Self {
                record: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl ObtainGrant for FakeGrant {
        async fn obtain(&self) -> anyhow::Result<CredentialRecord> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.record {
                Some(record) => Ok(record.clone()),
                None => anyhow::bail!("grant unavailable in this test"),
            }
        }
    }

    // A real reqwest error for the transport-failure behavior; port 1 is
    // reserved and never listening.
    async fn local_connect_error() -> reqwest::Error {
        reqwest::Client::new()
            .get("http://127.0.0.1:1/")
            .send()
            .await
            .unwrap_err()
    }

    fn record(tag: &str, expires_in_secs: i64) -> CredentialRecord {
        CredentialRecord {
            access_token: format!("access-{tag}"),
            refresh_token: format!("refresh-{tag}"),
            token_expiry: Utc::now() + Duration::seconds(expires_in_secs),
        }
    }

    fn settings(store_path: PathBuf) -> Settings {
        Settings {
            client_id: "cid".into(),
            client_secret: "secret".into(),
            username: "alice".into(),
            scope: "scope".into(),
            redirect_url: "http://127.0.0.1".into(),
            auth_url: "http://127.0.0.1/auth".into(),
            token_url: "http://127.0.0.1/token".into(),
            store_path,
        }
    }

    fn seed_store(path: &std::path::Path, entries: &[(&str, CredentialRecord)]) {
        let mut store = CredentialStore::default();
        for (username, record) in entries {
            store.merge(username, record.clone());
        }
        store::save(path, &store).unwrap();
    }

    #[tokio::test]
    async fn valid_record_is_served_from_cache_without_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STORE_FILE);
        let cached = record("alice", 3600);
        seed_store(&path, &[("alice", cached.clone())]);

        let refresher = FakeRefresher::new(RefreshBehavior::Reject(500));
        let resolver =
            CredentialResolver::new(&settings(path), refresher, FakeGrant::unavailable());

        let token = resolver.resolve("alice").await.unwrap();
        assert_eq!(token, cached.access_token);
        assert_eq!(resolver.refresher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(resolver.grant.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_record_refreshes_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STORE_FILE);
        seed_store(&path, &[("alice", record("alice", -3600))]);

        let refresher = FakeRefresher::new(RefreshBehavior::Succeed(RefreshedToken {
            access_token: "access-new".into(),
            expires_in: 3600,
            refresh_token: None,
        }));
        let resolver =
            CredentialResolver::new(&settings(path.clone()), refresher, FakeGrant::unavailable());

        let token = resolver.resolve("alice").await.unwrap();
        assert_eq!(token, "access-new");

        let saved = store::load(&path).unwrap().unwrap();
        let alice = saved.find("alice").unwrap();
        assert_eq!(alice.access_token, "access-new");
        assert_eq!(alice.refresh_token, "refresh-alice");
        let remaining = (alice.token_expiry - Utc::now()).num_seconds();
        assert!((3500..=3600).contains(&remaining), "remaining {remaining}s");
    }

    #[tokio::test]
    async fn rotated_refresh_token_is_adopted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STORE_FILE);
        seed_store(&path, &[("alice", record("alice", -1))]);

        let refresher = FakeRefresher::new(RefreshBehavior::Succeed(RefreshedToken {
            access_token: "access-new".into(),
            expires_in: 3600,
            refresh_token: Some("refresh-rotated".into()),
        }));
        let resolver =
            CredentialResolver::new(&settings(path.clone()), refresher, FakeGrant::unavailable());

        resolver.resolve("alice").await.unwrap();
        let saved = store::load(&path).unwrap().unwrap();
        assert_eq!(saved.find("alice").unwrap().refresh_token, "refresh-rotated");
    }

    #[tokio::test]
    async fn rejected_refresh_falls_through_to_grant() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STORE_FILE);
        seed_store(&path, &[("alice", record("stale", -3600))]);

        let granted = record("granted", 3600);
        let refresher = FakeRefresher::new(RefreshBehavior::Reject(400));
        let resolver = CredentialResolver::new(
            &settings(path.clone()),
            refresher,
            FakeGrant::yielding(granted.clone()),
        );

        let token = resolver.resolve("alice").await.unwrap();
        assert_eq!(token, granted.access_token);
        assert_eq!(resolver.grant.calls.load(Ordering::SeqCst), 1);

        // The dead refresh token is gone; alice holds the granted tuple.
        let saved = store::load(&path).unwrap().unwrap();
        assert_eq!(saved.users.len(), 1);
        assert_eq!(saved.find("alice"), Some(&granted));
    }

    #[tokio::test]
    async fn network_failure_is_transient_and_leaves_store_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STORE_FILE);
        seed_store(&path, &[("alice", record("alice", -3600))]);
        let before = fs::read(&path).unwrap();

        let refresher = FakeRefresher::new(RefreshBehavior::FailTransport);
        let resolver =
            CredentialResolver::new(&settings(path.clone()), refresher, FakeGrant::unavailable());

        let err = resolver.resolve("alice").await.unwrap_err();
        assert!(matches!(err, ResolveError::TransientFailure(_)), "{err}");
        assert_eq!(resolver.grant.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn absent_store_triggers_grant_once_and_creates_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STORE_FILE);

        let granted = record("granted", 3600);
        let refresher = FakeRefresher::new(RefreshBehavior::Reject(500));
        let resolver = CredentialResolver::new(
            &settings(path.clone()),
            refresher,
            FakeGrant::yielding(granted.clone()),
        );

        let token = resolver.resolve("alice").await.unwrap();
        assert_eq!(token, granted.access_token);
        assert_eq!(resolver.grant.calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.refresher.calls.load(Ordering::SeqCst), 0);

        let saved = store::load(&path).unwrap().unwrap();
        assert_eq!(saved.users.len(), 1);
        assert_eq!(saved.users[0].username, "alice");
        assert_eq!(saved.users[0].data, granted);
    }

    #[tokio::test]
    async fn failed_grant_surfaces_without_touching_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STORE_FILE);

        let refresher = FakeRefresher::new(RefreshBehavior::Reject(500));
        let resolver =
            CredentialResolver::new(&settings(path.clone()), refresher, FakeGrant::unavailable());

        let err = resolver.resolve("alice").await.unwrap_err();
        assert!(matches!(err, ResolveError::GrantFailed(_)), "{err}");
        assert!(!path.exists());
    }
}
