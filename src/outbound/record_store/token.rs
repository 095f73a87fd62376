use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::domain::ports::{TokenError, TokenProvider};

/// Tokens are refreshed this long before the issuer says they expire
const EXPIRY_MARGIN: time::Duration = time::Duration::seconds(60);

/// Upper bound on the `expires_in` we trust from the issuer
const MAX_TOKEN_LIFETIME_SECS: u64 = 24 * 60 * 60;

/// Default lifetime when the issuer omits `expires_in`
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;

/// When a token issued at `now` must be refreshed. Falls back to `now` if the
/// instant cannot be represented.
fn refresh_at(now: OffsetDateTime, expires_in: Option<u64>) -> OffsetDateTime {
    let secs = expires_in
        .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS)
        .min(MAX_TOKEN_LIFETIME_SECS);
    let lifetime = time::Duration::seconds(secs as i64);

    now.checked_add(lifetime)
        .and_then(|t| t.checked_sub(EXPIRY_MARGIN))
        .unwrap_or(now)
}

/// A bearer token supplied through configuration
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: String) -> Self {
        Self { token }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<String, TokenError> {
        Ok(self.token.clone())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Clone)]
struct CachedToken {
    value: String,
    expires_at: OffsetDateTime,
}

/// OAuth2 client-credentials grant with an in-memory token cache
pub struct ClientCredentialsTokenProvider {
    client: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    scope: String,
    cached: RwLock<Option<CachedToken>>,
}

impl ClientCredentialsTokenProvider {
    pub fn new(
        token_url: String,
        client_id: String,
        client_secret: String,
        scope: String,
        timeout: Duration,
    ) -> Result<Self, TokenError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TokenError::RequestFailed(e.to_string()))?;

        Ok(Self {
            client,
            token_url,
            client_id,
            client_secret,
            scope,
            cached: RwLock::new(None),
        })
    }

    async fn fetch(&self) -> Result<CachedToken, TokenError> {
        debug!(token_url = %self.token_url, client_id = %self.client_id, "Requesting access token");

        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", self.scope.as_str()),
            ])
            .send()
            .await
            .map_err(|e| {
                warn!(token_url = %self.token_url, error = %e, "Token request failed");
                TokenError::RequestFailed(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TokenError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| TokenError::InvalidResponse(e.to_string()))?;

        Ok(CachedToken {
            value: token.access_token,
            expires_at: refresh_at(OffsetDateTime::now_utc(), token.expires_in),
        })
    }
}

#[async_trait]
impl TokenProvider for ClientCredentialsTokenProvider {
    async fn access_token(&self) -> Result<String, TokenError> {
        let now = OffsetDateTime::now_utc();
        if let Some(token) = self.cached.read().await.as_ref()
            && token.expires_at > now
        {
            return Ok(token.value.clone());
        }

        let mut cached = self.cached.write().await;
        if let Some(token) = cached.as_ref()
            && token.expires_at > now
        {
            return Ok(token.value.clone());
        }

        let fresh = self.fetch().await?;
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }
}
