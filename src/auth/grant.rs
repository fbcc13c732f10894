//! Interactive browser-based authorization grant
//!
//! Binds a loopback listener on an ephemeral port, sends the user to the
//! provider consent page, captures the redirect callback, and exchanges the
//! authorization code for the initial access/refresh token pair. Everything
//! user-facing goes to stderr; stdout stays reserved for the resolved token.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use oauth2::{
    basic::BasicClient, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken,
    RedirectUrl, Scope, TokenResponse, TokenUrl,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use super::resolver::ObtainGrant;
use crate::config::Settings;
use crate::store::CredentialRecord;

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(300);

/// Providers normally send `expires_in`; fall back to an hour if omitted.
const DEFAULT_GRANT_TTL_SECS: i64 = 3600;

pub struct BrowserGrant {
    client_id: String,
    client_secret: String,
    scope: String,
    redirect_url: String,
    auth_url: String,
    token_url: String,
}

impl BrowserGrant {
    pub fn new(settings: &Settings) -> Self {
        Self {
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            scope: settings.scope.clone(),
            redirect_url: settings.redirect_url.clone(),
            auth_url: settings.auth_url.clone(),
            token_url: settings.token_url.clone(),
        }
    }
}

impl ObtainGrant for BrowserGrant {
    async fn obtain(&self) -> Result<CredentialRecord> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .context("failed to bind authorization callback listener")?;
        let port = listener
            .local_addr()
            .context("failed to read callback listener address")?
            .port();
        let redirect_uri = format!("{}:{port}/", self.redirect_url.trim_end_matches('/'));

        let client = BasicClient::new(
            ClientId::new(self.client_id.clone()),
            Some(ClientSecret::new(self.client_secret.clone())),
            AuthUrl::new(self.auth_url.clone()).context("invalid authorization endpoint URL")?,
            Some(TokenUrl::new(self.token_url.clone()).context("invalid token endpoint URL")?),
        )
        .set_redirect_uri(RedirectUrl::new(redirect_uri).context("invalid redirect URL")?);

        let (consent_url, csrf_state) = client
            .authorize_url(CsrfToken::new_random)
            .add_scope(Scope::new(self.scope.clone()))
            // offline access so the provider issues a refresh token
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent")
            .url();

        eprintln!("Opening browser for authorization...");
        eprintln!("If it does not open, visit:\n{consent_url}");
        if !try_open_browser(consent_url.as_str()) {
            tracing::debug!("could not launch a browser automatically");
        }

        let callback = wait_for_callback(listener).await?;
        if let Some(error) = callback.error {
            bail!("authorization was denied: {error}");
        }
        let code = callback
            .code
            .context("authorization callback carried no code")?;
        if callback.state.as_deref() != Some(csrf_state.secret().as_str()) {
            bail!("authorization callback state mismatch");
        }

        let token = client
            .exchange_code(AuthorizationCode::new(code))
            .request_async(oauth2::reqwest::async_http_client)
            .await
            .context("authorization code exchange failed")?;

        let refresh_token = token
            .refresh_token()
            .map(|rt| rt.secret().to_string())
            .context("provider issued no refresh token; this grant cannot be cached")?;
        let expires_in = token
            .expires_in()
            .map(|d| d.as_secs() as i64)
            .unwrap_or(DEFAULT_GRANT_TTL_SECS);

        Ok(CredentialRecord {
            access_token: token.access_token().secret().to_string(),
            refresh_token,
            token_expiry: Utc::now() + chrono::Duration::seconds(expires_in),
        })
    }
}

#[derive(Debug, Default)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

/// Accept one connection on the loopback listener and pull the query
/// parameters out of the redirect request.
async fn wait_for_callback(listener: TcpListener) -> Result<CallbackParams> {
    let (mut stream, _) = tokio::time::timeout(CALLBACK_TIMEOUT, listener.accept())
        .await
        .context("timed out waiting for the authorization callback")?
        .context("failed to accept authorization callback connection")?;

    let mut buffer = vec![0u8; 8192];
    let read = stream
        .read(&mut buffer)
        .await
        .context("failed to read authorization callback request")?;
    let request = String::from_utf8_lossy(&buffer[..read]);
    let first_line = request.lines().next().unwrap_or_default();
    let path = first_line.split_whitespace().nth(1).unwrap_or_default();
    let query = path.split_once('?').map(|(_, query)| query).unwrap_or_default();
    let params = parse_callback_query(query);

    let body = if params.error.is_some() {
        "<html><body><h1>Authorization failed</h1><p>You can close this window.</p></body></html>"
    } else {
        "<html><body><h1>Authorization complete</h1><p>You can close this window.</p></body></html>"
    };
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream
        .write_all(response.as_bytes())
        .await
        .context("failed to write authorization callback response")?;

    Ok(params)
}

fn parse_callback_query(query: &str) -> CallbackParams {
    let mut params = CallbackParams::default();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "code" => params.code = Some(value.into_owned()),
            "state" => params.state = Some(value.into_owned()),
            "error" => params.error = Some(value.into_owned()),
            _ => {}
        }
    }
    params
}

/// Best-effort platform browser launcher.
fn try_open_browser(url: &str) -> bool {
    #[cfg(target_os = "macos")]
    {
        return std::process::Command::new("open")
            .arg(url)
            .status()
            .is_ok_and(|status| status.success());
    }
    #[cfg(target_os = "windows")]
    {
        return std::process::Command::new("cmd")
            .args(["/C", "start", "", url])
            .status()
            .is_ok_and(|status| status.success());
    }
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        return std::process::Command::new("xdg-open")
            .arg(url)
            .status()
            .is_ok_and(|status| status.success());
    }
    #[allow(unreachable_code)]
    false
}
