//! Refresh-token exchange against the provider token endpoint
//!
//! One POST with `grant_type=refresh_token`, authenticated with HTTP basic
//! auth. Any non-2xx status means the refresh token is dead and the caller
//! should discard the record; transport failures are transient and must not
//! touch the store.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use super::resolver::RefreshTokens;

#[derive(Debug, Error)]
pub enum RefreshError {
    /// The provider refused the refresh token. Not a retry case: the token
    /// is presumed permanently invalid.
    #[error("provider rejected the refresh token (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },
    /// Timeout, DNS, connection reset. Safe to retry later with the same
    /// stored record.
    #[error("network failure during token refresh")]
    Network(#[source] reqwest::Error),
}

/// Successful exchange result. `refresh_token` is only present when the
/// provider rotated it; the caller must adopt it then.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    pub expires_in: u64,
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    expires_in: u64,
    refresh_token: Option<String>,
}

pub struct HttpRefreshClient {
    http: reqwest::Client,
    token_url: String,
}

impl HttpRefreshClient {
    pub fn new(token_url: String, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, token_url })
    }
}

impl RefreshTokens for HttpRefreshClient {
    async fn refresh(
        &self,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> Result<RefreshedToken, RefreshError> {
        tracing::debug!("refreshing access token at {}", self.token_url);

        let resp = self
            .http
            .post(&self.token_url)
            .basic_auth(client_id, Some(client_secret))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .map_err(RefreshError::Network)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RefreshError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let payload: TokenEndpointResponse = resp.json().await.map_err(RefreshError::Network)?;
        Ok(RefreshedToken {
            access_token: payload.access_token,
            expires_in: payload.expires_in,
            refresh_token: payload.refresh_token,
        })
    }
}
