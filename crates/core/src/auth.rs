//! Bearer token acquisition and caching
//!
//! [`TokenCache`] is constructed once per process and shared by every worker
//! through an `Arc`. Reads take the shared lock only; a refresh is serialized
//! so that concurrent callers never issue redundant exchanges.

use crate::config::{ConfigFile, GraphConfig};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// A bearer token and the instant it stops being valid
#[derive(Clone)]
pub struct Credential {
    token: String,
    expires_at: Instant,
}

impl Credential {
    pub fn new(token: String, lifetime: Duration) -> Self {
        Self {
            token,
            expires_at: Instant::now() + lifetime,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Time left before expiry
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// Still usable with at least `margin` to spare
    pub fn is_fresh(&self, margin: Duration) -> bool {
        Instant::now() + margin < self.expires_at
    }

    /// `Authorization` header value
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"***")
            .field("remaining", &self.remaining())
            .finish()
    }
}

/// Result of one credential exchange
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub expires_in: Duration,
}

/// Performs the network exchange that produces a fresh token
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn exchange(&self) -> Result<TokenGrant>;
}

/// OAuth2 client-credentials grant against the identity platform
pub struct ClientCredentials {
    http_client: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    scope: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: String,
}

impl ClientCredentials {
    /// Build the exchange from configuration; missing values are an
    /// authentication failure, not something to retry.
    pub fn from_config(graph: &GraphConfig, http_client: Client) -> Result<Self> {
        if graph.tenant_id.is_empty() || graph.client_id.is_empty() || graph.client_secret.is_empty() {
            return Err(Error::Authentication(
                "tenant_id, client_id and client_secret are required".to_string(),
            ));
        }

        Ok(Self {
            http_client,
            token_url: format!(
                "{}/{}/oauth2/v2.0/token",
                graph.authority_host.trim_end_matches('/'),
                graph.tenant_id
            ),
            client_id: graph.client_id.clone(),
            client_secret: graph.client_secret.clone(),
            scope: graph.scope.clone(),
        })
    }

    pub fn token_url(&self) -> &str {
        &self.token_url
    }
}

#[async_trait]
impl TokenExchange for ClientCredentials {
    async fn exchange(&self) -> Result<TokenGrant> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", self.scope.as_str()),
        ];

        let response = self
            .http_client
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::Authentication(format!("token request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Authentication(format!("token response unreadable: {}", e)))?;

        if !status.is_success() {
            let detail = serde_json::from_str::<TokenErrorResponse>(&body)
                .map(|e| format!("{}: {}", e.error, e.error_description))
                .unwrap_or(body);
            return Err(Error::Authentication(format!(
                "HTTP {}: {}",
                status.as_u16(),
                detail
            )));
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| Error::Authentication(format!("malformed token response: {}", e)))?;

        Ok(TokenGrant {
            access_token: token.access_token,
            expires_in: Duration::from_secs(token.expires_in),
        })
    }
}

/// Process-wide credential cache with expiry-aware refresh
pub struct TokenCache {
    exchange: Arc<dyn TokenExchange>,
    margin: Duration,
    cached: RwLock<Option<CachedCredential>>,
    refresh: Mutex<()>,
}

/// Cached token with the margin that applies to it
struct CachedCredential {
    credential: Credential,
    margin: Duration,
}

/// The configured margin, capped at half the token lifetime so a
/// short-lived token is still reused for a while
fn effective_margin(margin: Duration, lifetime: Duration) -> Duration {
    margin.min(lifetime / 2)
}

impl TokenCache {
    /// `margin` is how long before expiry a token stops being handed out
    pub fn new(exchange: Arc<dyn TokenExchange>, margin: Duration) -> Self {
        Self {
            exchange,
            margin,
            cached: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    /// Client-credentials cache with the configured expiry margin
    pub fn from_config(config: &ConfigFile, http_client: Client) -> Result<Self> {
        let exchange = ClientCredentials::from_config(&config.graph, http_client)?;
        Ok(Self::new(
            Arc::new(exchange),
            Duration::from_secs(config.advanced().token_expiry_margin),
        ))
    }

    /// A credential guaranteed to be outside the expiry margin
    pub async fn credential(&self) -> Result<Credential> {
        if let Some(credential) = self.fresh_cached().await {
            return Ok(credential);
        }

        let _guard = self.refresh.lock().await;

        // Another caller may have refreshed while we waited for the lock
        if let Some(credential) = self.fresh_cached().await {
            return Ok(credential);
        }

        debug!("Requesting new access token");
        let grant = self.exchange.exchange().await?;
        if grant.expires_in.is_zero() {
            return Err(Error::Authentication(
                "token endpoint returned an already expired token".to_string(),
            ));
        }

        let credential = Credential::new(grant.access_token, grant.expires_in);
        let margin = effective_margin(self.margin, grant.expires_in);
        if margin < self.margin {
            debug!(
                expires_in_secs = grant.expires_in.as_secs(),
                margin_secs = margin.as_secs(),
                "Token lifetime shorter than the expiry margin, using half its lifetime"
            );
        }
        info!(expires_in_secs = grant.expires_in.as_secs(), "Access token refreshed");
        *self.cached.write().await = Some(CachedCredential {
            credential: credential.clone(),
            margin,
        });
        Ok(credential)
    }

    /// Drop the cached token, e.g. after the remote answered 401
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }

    async fn fresh_cached(&self) -> Option<Credential> {
        self.cached
            .read()
            .await
            .as_ref()
            .filter(|c| c.credential.is_fresh(c.margin))
            .map(|c| c.credential.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingExchange {
        calls: AtomicU32,
        lifetime: Duration,
        delay: Duration,
    }

    impl CountingExchange {
        fn new(lifetime: Duration) -> Self {
            Self {
                calls: AtomicU32::new(0),
                lifetime,
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl TokenExchange for CountingExchange {
        async fn exchange(&self) -> Result<TokenGrant> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(TokenGrant {
                access_token: format!("token-{}", n),
                expires_in: self.lifetime,
            })
        }
    }

    struct FailingExchange;

    #[async_trait]
    impl TokenExchange for FailingExchange {
        async fn exchange(&self) -> Result<TokenGrant> {
            Err(Error::Authentication("invalid_client".to_string()))
        }
    }

    #[tokio::test]
    async fn test_fresh_token_is_reused() {
        let exchange = Arc::new(CountingExchange::new(Duration::from_secs(3600)));
        let cache = TokenCache::new(exchange.clone(), Duration::from_secs(300));

        let first = cache.credential().await.unwrap();
        let second = cache.credential().await.unwrap();

        assert_eq!(first.token(), "token-0");
        assert_eq!(second.token(), "token-0");
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_short_lived_token_uses_clamped_margin() {
        // lifetime shorter than the margin: still reused for half its life
        let exchange = Arc::new(CountingExchange::new(Duration::from_secs(60)));
        let cache = TokenCache::new(exchange.clone(), Duration::from_secs(300));

        assert_eq!(cache.credential().await.unwrap().token(), "token-0");
        assert_eq!(cache.credential().await.unwrap().token(), "token-0");
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_token_inside_margin_is_refreshed() {
        // clamped margin is 50ms, so the token is already inside it
        let exchange = Arc::new(CountingExchange::new(Duration::from_millis(100)));
        let cache = TokenCache::new(exchange.clone(), Duration::from_secs(300));

        assert_eq!(cache.credential().await.unwrap().token(), "token-0");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.credential().await.unwrap().token(), "token-1");
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_effective_margin() {
        let margin = Duration::from_secs(300);
        assert_eq!(effective_margin(margin, Duration::from_secs(3600)), margin);
        assert_eq!(effective_margin(margin, Duration::from_secs(60)), Duration::from_secs(30));
        assert_eq!(effective_margin(margin, Duration::from_secs(600)), margin);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_exchange() {
        let exchange = Arc::new(CountingExchange {
            delay: Duration::from_millis(50),
            ..CountingExchange::new(Duration::from_secs(3600))
        });
        let cache = Arc::new(TokenCache::new(exchange.clone(), Duration::from_secs(300)));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.credential().await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().token(), "token-0");
        }
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_exchange() {
        let exchange = Arc::new(CountingExchange::new(Duration::from_secs(3600)));
        let cache = TokenCache::new(exchange.clone(), Duration::from_secs(300));

        cache.credential().await.unwrap();
        cache.invalidate().await;
        assert_eq!(cache.credential().await.unwrap().token(), "token-1");
    }

    #[tokio::test]
    async fn test_exchange_failure_is_auth_error() {
        let cache = TokenCache::new(Arc::new(FailingExchange), Duration::from_secs(300));
        assert!(matches!(cache.credential().await, Err(Error::Authentication(_))));
    }

    #[tokio::test]
    async fn test_zero_lifetime_rejected() {
        let exchange = Arc::new(CountingExchange::new(Duration::ZERO));
        let cache = TokenCache::new(exchange, Duration::ZERO);
        assert!(matches!(cache.credential().await, Err(Error::Authentication(_))));
    }

    #[test]
    fn test_client_credentials_requires_secret() {
        let graph = GraphConfig {
            tenant_id: "tenant".to_string(),
            client_id: "client".to_string(),
            client_secret: String::new(),
            site_id: None,
            drive_id: None,
            authority_host: "https://login.microsoftonline.com".to_string(),
            base_url: "https://graph.microsoft.com/v1.0".to_string(),
            scope: "https://graph.microsoft.com/.default".to_string(),
        };
        assert!(matches!(
            ClientCredentials::from_config(&graph, Client::new()),
            Err(Error::Authentication(_))
        ));
    }

    #[test]
    fn test_token_url() {
        let graph = GraphConfig {
            tenant_id: "contoso".to_string(),
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            site_id: None,
            drive_id: None,
            authority_host: "https://login.microsoftonline.com/".to_string(),
            base_url: "https://graph.microsoft.com/v1.0".to_string(),
            scope: "https://graph.microsoft.com/.default".to_string(),
        };
        let exchange = ClientCredentials::from_config(&graph, Client::new()).unwrap();
        assert_eq!(
            exchange.token_url(),
            "https://login.microsoftonline.com/contoso/oauth2/v2.0/token"
        );
    }

    #[test]
    fn test_credential_debug_hides_token() {
        let credential = Credential::new("secret-token".to_string(), Duration::from_secs(10));
        assert!(!format!("{:?}", credential).contains("secret-token"));
    }
}
