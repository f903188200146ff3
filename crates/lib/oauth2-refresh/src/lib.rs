//! OAuth2 access-token refresh for provider-backed accounts.
//!
//! Accounts carry a long-lived refresh token; the worker asks here for a
//! live access token before opening a session and persists whatever
//! rotation the provider performed.

use chrono::{DateTime, Utc};
use oauth2::TokenResponse as _;
use std::collections::HashMap;

/// A provider's OAuth2 client configuration.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Provider id referenced from account credentials.
    pub provider: String,

    /// OAuth2 client id.
    pub client_id: String,

    /// OAuth2 client secret, when the provider issues one.
    pub client_secret: Option<String>,

    /// Token endpoint URL.
    pub token_url: String,
}

/// A refreshed token set to persist back on the account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSet {
    /// The live access token.
    pub access_token: String,

    /// The refresh token to keep; providers may rotate it.
    pub refresh_token: String,

    /// Access token expiry.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Errors refreshing a token.
#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    /// A provider's token URL failed to parse.
    #[error("invalid token URL for provider {provider}: {message}")]
    InvalidTokenUrl {
        /// Provider id.
        provider: String,

        /// Parse failure description.
        message: String,
    },

    /// The account references a provider with no configuration.
    #[error("unknown OAuth2 provider: {0}")]
    UnknownProvider(String),

    /// The provider rejected the refresh token. Permanent until the
    /// operator re-authorizes the account.
    #[error("refresh token rejected: {0}")]
    Rejected(String),

    /// Transport-level failure talking to the provider.
    #[error("token endpoint unreachable: {0}")]
    Transport(String),
}

/// An OAuth2 client with its token endpoint configured.
type ConfiguredClient = oauth2::basic::BasicClient<
    oauth2::EndpointNotSet,
    oauth2::EndpointNotSet,
    oauth2::EndpointNotSet,
    oauth2::EndpointNotSet,
    oauth2::EndpointSet,
>;

/// Refreshes access tokens against configured providers.
pub struct Refresher {
    /// Configured clients keyed by provider id.
    clients: HashMap<String, ConfiguredClient>,

    /// HTTP client for token exchanges.
    http_client: reqwest::Client,

    /// Tokens expiring within this window count as expired.
    expiry_tolerance: chrono::Duration,
}

impl Refresher {
    /// Build a refresher from provider configurations.
    pub fn new(
        providers: Vec<ProviderConfig>,
        expiry_tolerance: std::time::Duration,
    ) -> Result<Self, RefreshError> {
        let mut clients = HashMap::new();
        for config in providers {
            let token_url = oauth2::TokenUrl::new(config.token_url.clone()).map_err(|err| {
                RefreshError::InvalidTokenUrl {
                    provider: config.provider.clone(),
                    message: err.to_string(),
                }
            })?;

            let mut client = oauth2::basic::BasicClient::new(oauth2::ClientId::new(
                config.client_id.clone(),
            ))
            .set_token_uri(token_url);
            if let Some(secret) = &config.client_secret {
                client = client.set_client_secret(oauth2::ClientSecret::new(secret.clone()));
            }

            clients.insert(config.provider, client);
        }

        Ok(Self {
            clients,
            http_client: reqwest::Client::new(),
            expiry_tolerance: chrono::Duration::from_std(expiry_tolerance)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
        })
    }

    /// Whether a cached access token is still usable.
    pub fn is_fresh(&self, expires_at: Option<DateTime<Utc>>) -> bool {
        match expires_at {
            Some(expires_at) => Utc::now() + self.expiry_tolerance < expires_at,
            // Tokens without recorded expiry are treated as expired.
            None => false,
        }
    }

    /// Exchange a refresh token for a fresh access token.
    ///
    /// When the provider does not rotate the refresh token, the old one is
    /// carried forward in the returned set.
    pub async fn refresh(
        &self,
        provider: &str,
        refresh_token: &str,
    ) -> Result<TokenSet, RefreshError> {
        let client = self
            .clients
            .get(provider)
            .ok_or_else(|| RefreshError::UnknownProvider(provider.to_string()))?;

        let response = client
            .exchange_refresh_token(&oauth2::RefreshToken::new(refresh_token.to_string()))
            .request_async(&self.http_client)
            .await
            .map_err(|err| match err {
                oauth2::RequestTokenError::ServerResponse(response) => {
                    RefreshError::Rejected(response.to_string())
                }
                other => RefreshError::Transport(other.to_string()),
            })?;

        let expires_at = response
            .expires_in()
            .and_then(|expires_in| chrono::Duration::from_std(expires_in).ok())
            .map(|expires_in| Utc::now() + expires_in);

        tracing::debug!(provider, "access token refreshed");

        Ok(TokenSet {
            access_token: response.access_token().secret().clone(),
            refresh_token: response
                .refresh_token()
                .map(|token| token.secret().clone())
                .unwrap_or_else(|| refresh_token.to_string()),
            expires_at,
        })
    }
}
