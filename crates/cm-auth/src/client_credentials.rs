//! OAuth2 client-credentials token provider.
//!
//! Exchanges a client id and secret for a bearer token at
//! `<host>/multipass/api/oauth2/token` and caches it:
//! - at most one exchange per refresh interval (default one hour)
//! - failed refreshes are logged and the previous token is kept
//! - an error reaches the caller only if no token was ever obtained

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::AuthError;

const OAUTH_TOKEN_PATH: &str = "/multipass/api/oauth2/token";
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

// ── Provider trait ────────────────────────────────────────────────────────────

/// Anything that can hand out a bearer token.
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Pin<Box<dyn Future<Output = Result<String, AuthError>> + Send + '_>>;
}

/// Fixed token, for tests and pre-issued credentials.
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

impl TokenProvider for StaticToken {
    fn token(&self) -> Pin<Box<dyn Future<Output = Result<String, AuthError>> + Send + '_>> {
        Box::pin(async move { Ok(self.0.clone()) })
    }
}

// ── Response ──────────────────────────────────────────────────────────────────

/// Body returned by the token endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthTokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub token_type: Option<String>,
}

// ── Provider ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct TokenState {
    token: Option<AuthTokenResponse>,
    last_refreshed: Option<Instant>,
}

impl TokenState {
    fn should_refresh(&self, interval: Duration) -> bool {
        match (&self.token, self.last_refreshed) {
            (Some(_), Some(at)) => at.elapsed() > interval,
            _ => true,
        }
    }
}

pub struct ClientCredentialsTokenProvider {
    http: reqwest::Client,
    token_url: Url,
    client_id: String,
    client_secret: String,
    scopes: Vec<String>,
    refresh_interval: Duration,
    state: Mutex<TokenState>,
}

impl std::fmt::Debug for ClientCredentialsTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentialsTokenProvider")
            .field("token_url", &self.token_url.as_str())
            .field("client_id", &self.client_id)
            .field("scopes", &self.scopes)
            .field("refresh_interval", &self.refresh_interval)
            .finish_non_exhaustive()
    }
}

impl ClientCredentialsTokenProvider {
    /// Builder with `client_id` / `client_secret` prefilled from the
    /// `CLIENT_ID` / `CLIENT_SECRET` environment variables when present.
    pub fn builder() -> ClientCredentialsTokenProviderBuilder {
        ClientCredentialsTokenProviderBuilder {
            hostname: None,
            client_id: std::env::var("CLIENT_ID").ok(),
            client_secret: std::env::var("CLIENT_SECRET").ok(),
            scopes: Vec::new(),
            http: None,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }

    pub fn token_url(&self) -> &Url {
        &self.token_url
    }

    /// Return the cached token, refreshing it first if the interval elapsed.
    ///
    /// The cache and its timestamp share one lock, so concurrent callers
    /// trigger at most one exchange.
    pub async fn get(&self) -> Result<String, AuthError> {
        let mut state = self.state.lock().await;

        if state.should_refresh(self.refresh_interval) {
            state.last_refreshed = Some(Instant::now());
            match self.exchange().await {
                Ok(response) => {
                    tracing::debug!(
                        url = %self.token_url,
                        expires_in = ?response.expires_in,
                        "Client credentials token refreshed"
                    );
                    state.token = Some(response);
                }
                Err(e) => {
                    tracing::warn!(
                        url = %self.token_url,
                        error = %e,
                        has_stale_token = state.token.is_some(),
                        "Token refresh failed"
                    );
                }
            }
        }

        state
            .token
            .as_ref()
            .map(|t| t.access_token.clone())
            .ok_or_else(|| AuthError::NoToken(self.token_url.to_string()))
    }

    async fn exchange(&self) -> Result<AuthTokenResponse, AuthError> {
        let scope = self.scopes.join(" ");
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", scope.as_str()),
        ];

        let resp = self
            .http
            .post(self.token_url.clone())
            .form(&form)
            .send()
            .await
            .map_err(|e| AuthError::Http(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| AuthError::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(AuthError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(serde_json::from_str(&body)?)
    }
}

impl TokenProvider for ClientCredentialsTokenProvider {
    fn token(&self) -> Pin<Box<dyn Future<Output = Result<String, AuthError>> + Send + '_>> {
        Box::pin(self.get())
    }
}

// ── Builder ───────────────────────────────────────────────────────────────────

pub struct ClientCredentialsTokenProviderBuilder {
    hostname: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    scopes: Vec<String>,
    http: Option<reqwest::Client>,
    refresh_interval: Duration,
}

impl ClientCredentialsTokenProviderBuilder {
    /// Bare host (`stack.example.com`, https implied) or a URL whose scheme,
    /// host and port are kept.
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn client_secret(mut self, client_secret: impl Into<String>) -> Self {
        self.client_secret = Some(client_secret.into());
        self
    }

    pub fn scopes<S: Into<String>>(mut self, scopes: impl IntoIterator<Item = S>) -> Self {
        self.scopes.extend(scopes.into_iter().map(Into::into));
        self
    }

    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn build(self) -> Result<ClientCredentialsTokenProvider, AuthError> {
        let hostname = self.hostname.ok_or(AuthError::MissingField("hostname"))?;
        let client_id = self.client_id.ok_or(AuthError::MissingField("client_id"))?;
        let client_secret = self
            .client_secret
            .ok_or(AuthError::MissingField("client_secret"))?;

        Ok(ClientCredentialsTokenProvider {
            http: self.http.unwrap_or_default(),
            token_url: token_url(&hostname)?,
            client_id,
            client_secret,
            scopes: self.scopes,
            refresh_interval: self.refresh_interval,
            state: Mutex::new(TokenState::default()),
        })
    }
}

fn token_url(hostname: &str) -> Result<Url, AuthError> {
    let invalid = |reason: String| AuthError::InvalidHost {
        host: hostname.to_string(),
        reason,
    };

    let base = match Url::parse(hostname) {
        Ok(url) if url.has_host() => url,
        _ => Url::parse(&format!("https://{hostname}")).map_err(|e| invalid(e.to_string()))?,
    };
    base.join(OAUTH_TOKEN_PATH)
        .map_err(|e| invalid(e.to_string()))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
