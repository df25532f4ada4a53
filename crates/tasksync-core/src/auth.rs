//! Access tokens for the remote task service.
//!
//! Tokens are stored as JSON in the OS keyring. Expired tokens are refreshed
//! against the OAuth token endpoint when a refresh token is available.
//! Acquiring the first token (the browser consent flow) happens elsewhere.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::AuthError;
use crate::storage::config::AuthConfig;

/// Refresh this many seconds before the recorded expiry.
const EXPIRY_SKEW_SECS: i64 = 60;

/// Thin wrapper around the OS keyring for credential storage.
pub mod keyring_store {
    use crate::error::AuthError;

    const SERVICE: &str = "tasksync";

    pub fn get(key: &str) -> Result<Option<String>, AuthError> {
        let entry = keyring::Entry::new(SERVICE, key)?;
        match entry.get_password() {
            Ok(pw) => Ok(Some(pw)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn set(key: &str, value: &str) -> Result<(), AuthError> {
        let entry = keyring::Entry::new(SERVICE, key)?;
        entry.set_password(value)?;
        Ok(())
    }

    pub fn delete(key: &str) -> Result<(), AuthError> {
        let entry = keyring::Entry::new(SERVICE, key)?;
        match entry.delete_credential() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>, // Unix timestamp
    pub token_type: String,
    pub scope: Option<String>,
}

impl OAuthTokens {
    /// Whether the access token is expired (with a 60s buffer).
    pub fn is_expired(&self, now: i64) -> bool {
        match self.expires_at {
            Some(exp) => now > exp - EXPIRY_SKEW_SECS,
            None => false,
        }
    }
}

/// Where serialized tokens live.
pub trait TokenStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<String>, AuthError>;
    fn save(&self, key: &str, value: &str) -> Result<(), AuthError>;
    fn delete(&self, key: &str) -> Result<(), AuthError>;
}

/// The OS keyring.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyringStore;

impl TokenStore for KeyringStore {
    fn load(&self, key: &str) -> Result<Option<String>, AuthError> {
        keyring_store::get(key)
    }

    fn save(&self, key: &str, value: &str) -> Result<(), AuthError> {
        keyring_store::set(key, value)
    }

    fn delete(&self, key: &str) -> Result<(), AuthError> {
        keyring_store::delete(key)
    }
}

/// Process-local store, for headless environments.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    entries: Mutex<HashMap<String, String>>,
}

impl TokenStore for MemoryTokenStore {
    fn load(&self, key: &str) -> Result<Option<String>, AuthError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| AuthError::Keyring("token store poisoned".into()))?;
        Ok(entries.get(key).cloned())
    }

    fn save(&self, key: &str, value: &str) -> Result<(), AuthError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| AuthError::Keyring("token store poisoned".into()))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), AuthError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| AuthError::Keyring("token store poisoned".into()))?;
        entries.remove(key);
        Ok(())
    }
}

/// Load stored tokens. Unreadable entries count as absent.
pub fn load_tokens(store: &dyn TokenStore, service_name: &str) -> Result<Option<OAuthTokens>, AuthError> {
    Ok(store
        .load(service_name)?
        .and_then(|json| serde_json::from_str(&json).ok()))
}

/// Persist tokens as JSON.
pub fn save_tokens(
    store: &dyn TokenStore,
    service_name: &str,
    tokens: &OAuthTokens,
) -> Result<(), AuthError> {
    let json =
        serde_json::to_string(tokens).map_err(|e| AuthError::Keyring(e.to_string()))?;
    store.save(service_name, &json)
}

/// Source of bearer tokens for remote calls.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// A currently valid access token, or `None` when nothing is stored.
    async fn access_token(&self) -> Result<Option<String>, AuthError>;
}

/// A fixed token (or none at all).
#[derive(Debug, Clone, Default)]
pub struct StaticTokenProvider {
    token: Option<String>,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    pub fn none() -> Self {
        Self { token: None }
    }

    /// Reads `TASKSYNC_ACCESS_TOKEN`.
    pub fn from_env() -> Option<Self> {
        std::env::var("TASKSYNC_ACCESS_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty())
            .map(Self::new)
    }
}

#[async_trait]
impl AuthProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<Option<String>, AuthError> {
        Ok(self.token.clone())
    }
}

/// Tokens kept in a [`TokenStore`], refreshed on demand.
pub struct KeyringTokenProvider<S: TokenStore = KeyringStore> {
    store: S,
    config: AuthConfig,
    http: Client,
    /// Serializes refreshes so concurrent callers do not race the token endpoint.
    refresh_lock: tokio::sync::Mutex<()>,
}

impl KeyringTokenProvider<KeyringStore> {
    pub fn new(config: AuthConfig) -> Self {
        Self::with_store(KeyringStore, config)
    }
}

impl<S: TokenStore> KeyringTokenProvider<S> {
    pub fn with_store(store: S, config: AuthConfig) -> Self {
        Self {
            store,
            config,
            http: Client::new(),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }

    /// Stored tokens, if any.
    pub fn tokens(&self) -> Result<Option<OAuthTokens>, AuthError> {
        load_tokens(&self.store, &self.config.service_name)
    }

    /// Store tokens obtained out of band.
    pub fn store_tokens(&self, tokens: &OAuthTokens) -> Result<(), AuthError> {
        save_tokens(&self.store, &self.config.service_name, tokens)
    }

    /// Forget the stored tokens.
    pub fn logout(&self) -> Result<(), AuthError> {
        self.store.delete(&self.config.service_name)
    }

    async fn refresh(&self, refresh: &str) -> Result<OAuthTokens, AuthError> {
        let service = self.config.service_name.clone();
        let client_id = self
            .config
            .resolved_client_id()
            .ok_or_else(|| AuthError::CredentialsNotConfigured {
                service: service.clone(),
            })?;
        let client_secret = self
            .config
            .resolved_client_secret()
            .ok_or_else(|| AuthError::CredentialsNotConfigured {
                service: service.clone(),
            })?;

        let params = [
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
            ("refresh_token", refresh),
            ("grant_type", "refresh_token"),
        ];

        let resp = self
            .http
            .post(&self.config.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::TokenRefreshFailed(e.to_string()))?;

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AuthError::TokenRefreshFailed(e.to_string()))?;

        if let Some(error) = body.get("error") {
            return Err(AuthError::TokenRefreshFailed(format!("OAuth refresh error: {error}")));
        }

        let access_token = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::TokenRefreshFailed("response carried no access token".into()))?
            .to_string();
        let expires_in = body.get("expires_in").and_then(|v| v.as_i64());
        let expires_at = expires_in.map(|ei| Utc::now().timestamp() + ei);

        let tokens = OAuthTokens {
            access_token,
            refresh_token: body
                .get("refresh_token")
                .and_then(|v| v.as_str())
                .map(String::from)
                .or_else(|| Some(refresh.to_string())),
            expires_at,
            token_type: body["token_type"].as_str().unwrap_or("Bearer").to_string(),
            scope: body.get("scope").and_then(|v| v.as_str()).map(String::from),
        };

        self.store_tokens(&tokens)?;
        Ok(tokens)
    }
}

#[async_trait]
impl<S: TokenStore> AuthProvider for KeyringTokenProvider<S> {
    async fn access_token(&self) -> Result<Option<String>, AuthError> {
        let Some(tokens) = self.tokens()? else {
            return Ok(None);
        };
        if !tokens.is_expired(Utc::now().timestamp()) {
            return Ok(Some(tokens.access_token));
        }

        let _guard = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited.
        if let Some(current) = self.tokens()? {
            if !current.is_expired(Utc::now().timestamp()) {
                return Ok(Some(current.access_token));
            }
        }

        let refresh = tokens.refresh_token.as_deref().ok_or(AuthError::TokenExpired)?;
        debug!(service = %self.config.service_name, "refreshing access token");
        match self.refresh(refresh).await {
            Ok(refreshed) => Ok(Some(refreshed.access_token)),
            Err(e) => {
                warn!(service = %self.config.service_name, error = %e, "token refresh failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(expires_at: Option<i64>, refresh: Option<&str>) -> OAuthTokens {
        OAuthTokens {
            access_token: "old-token".into(),
            refresh_token: refresh.map(String::from),
            expires_at,
            token_type: "Bearer".into(),
            scope: None,
        }
    }

    fn config(token_url: String) -> AuthConfig {
        AuthConfig {
            token_url,
            client_id: "client".into(),
            client_secret: "secret".into(),
            ..AuthConfig::default()
        }
    }

    #[test]
    fn expiry_uses_skew() {
        let now = 1_000_000;
        assert!(!tokens(None, None).is_expired(now));
        assert!(!tokens(Some(now + 120), None).is_expired(now));
        assert!(tokens(Some(now + 30), None).is_expired(now));
        assert!(tokens(Some(now - 1), None).is_expired(now));
    }

    #[tokio::test]
    async fn static_provider_returns_its_token() {
        assert_eq!(
            StaticTokenProvider::new("abc").access_token().await.unwrap(),
            Some("abc".to_string())
        );
        assert_eq!(StaticTokenProvider::none().access_token().await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_tokens_yield_none() {
        let provider =
            KeyringTokenProvider::with_store(MemoryTokenStore::default(), AuthConfig::default());
        assert_eq!(provider.access_token().await.unwrap(), None);
    }

    #[tokio::test]
    async fn fresh_token_is_used_as_is() {
        let provider =
            KeyringTokenProvider::with_store(MemoryTokenStore::default(), AuthConfig::default());
        provider
            .store_tokens(&tokens(Some(Utc::now().timestamp() + 3600), None))
            .unwrap();
        assert_eq!(provider.access_token().await.unwrap().as_deref(), Some("old-token"));
    }

    #[tokio::test]
    async fn expired_without_refresh_token_fails() {
        let provider =
            KeyringTokenProvider::with_store(MemoryTokenStore::default(), AuthConfig::default());
        provider
            .store_tokens(&tokens(Some(Utc::now().timestamp() - 10), None))
            .unwrap();
        assert!(matches!(
            provider.access_token().await,
            Err(AuthError::TokenExpired)
        ));
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_and_persisted() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                mockito::Matcher::UrlEncoded("refresh_token".into(), "r-1".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"new-token","expires_in":3600,"token_type":"Bearer"}"#)
            .create_async()
            .await;

        let provider = KeyringTokenProvider::with_store(
            MemoryTokenStore::default(),
            config(format!("{}/token", server.url())),
        );
        provider
            .store_tokens(&tokens(Some(Utc::now().timestamp() - 10), Some("r-1")))
            .unwrap();

        assert_eq!(provider.access_token().await.unwrap().as_deref(), Some("new-token"));
        mock.assert_async().await;

        let stored = provider.tokens().unwrap().unwrap();
        assert_eq!(stored.access_token, "new-token");
        assert_eq!(stored.refresh_token.as_deref(), Some("r-1"));
    }

    #[tokio::test]
    async fn refresh_error_is_reported() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let provider = KeyringTokenProvider::with_store(
            MemoryTokenStore::default(),
            config(format!("{}/token", server.url())),
        );
        provider
            .store_tokens(&tokens(Some(Utc::now().timestamp() - 10), Some("r-1")))
            .unwrap();

        assert!(matches!(
            provider.access_token().await,
            Err(AuthError::TokenRefreshFailed(_))
        ));
    }

    #[test]
    fn logout_forgets_tokens() {
        let provider =
            KeyringTokenProvider::with_store(MemoryTokenStore::default(), AuthConfig::default());
        provider.store_tokens(&tokens(None, None)).unwrap();
        assert!(provider.tokens().unwrap().is_some());
        provider.logout().unwrap();
        assert!(provider.tokens().unwrap().is_none());
    }
}
