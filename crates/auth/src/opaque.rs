//! Opaque bearer tokens resolved through the identity provider's userinfo endpoint.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use reqwest::StatusCode;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::resolver::ResolutionStrategy;
use crate::AuthError;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CACHE_ENTRIES: usize = 10_000;

#[derive(Debug, Clone)]
pub struct OpaqueTokenResolverConfig {
    pub userinfo_url: String,
    pub cache_ttl: Duration,
    pub request_timeout: Duration,
}

impl OpaqueTokenResolverConfig {
    #[must_use]
    pub fn new(userinfo_url: impl Into<String>) -> Self {
        Self {
            userinfo_url: userinfo_url.into(),
            cache_ttl: DEFAULT_CACHE_TTL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OpaqueTokenError {
    #[error("userinfo request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("userinfo endpoint rejected the token with status {0}")]
    Rejected(StatusCode),
    #[error("userinfo endpoint unavailable: status {0}")]
    Unavailable(StatusCode),
    #[error("userinfo response has no subject")]
    MissingSubject,
}

impl From<OpaqueTokenError> for AuthError {
    fn from(value: OpaqueTokenError) -> Self {
        match value {
            OpaqueTokenError::Request(_) | OpaqueTokenError::Unavailable(_) => {
                AuthError::UpstreamUnavailable
            }
            OpaqueTokenError::Rejected(_) | OpaqueTokenError::MissingSubject => {
                AuthError::Unauthenticated
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    #[serde(default)]
    sub: Option<String>,
}

struct CachedSubject {
    subject: String,
    expires_at: Instant,
}

/// Exchanges opaque tokens for a subject. Successful lookups are cached for
/// `cache_ttl`; failures are never cached.
pub struct OpaqueTokenResolver {
    userinfo_url: String,
    http_client: reqwest::Client,
    cache_ttl: Duration,
    cache: RwLock<HashMap<String, CachedSubject>>,
}

impl OpaqueTokenResolver {
    #[must_use]
    pub fn new(config: OpaqueTokenResolverConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            userinfo_url: config.userinfo_url,
            http_client,
            cache_ttl: config.cache_ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn lookup(&self, token: &str) -> Result<String, OpaqueTokenError> {
        let cache_key = cache_key(token);
        if let Some(subject) = self.cached(&cache_key).await {
            return Ok(subject);
        }

        let subject = self.fetch_subject(token).await?;
        self.store(cache_key, subject.clone()).await;
        Ok(subject)
    }

    async fn cached(&self, cache_key: &str) -> Option<String> {
        let cache = self.cache.read().await;
        let entry = cache.get(cache_key)?;
        (entry.expires_at > Instant::now()).then(|| entry.subject.clone())
    }

    async fn store(&self, cache_key: String, subject: String) {
        let now = Instant::now();
        let mut cache = self.cache.write().await;
        if cache.len() >= MAX_CACHE_ENTRIES {
            cache.retain(|_, entry| entry.expires_at > now);
            if cache.len() >= MAX_CACHE_ENTRIES {
                cache.clear();
            }
        }
        cache.insert(
            cache_key,
            CachedSubject {
                subject,
                expires_at: now + self.cache_ttl,
            },
        );
    }

    async fn fetch_subject(&self, token: &str) -> Result<String, OpaqueTokenError> {
        let response = self
            .http_client
            .get(&self.userinfo_url)
            .bearer_auth(token)
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(OpaqueTokenError::Unavailable(status));
        }
        if !status.is_success() {
            return Err(OpaqueTokenError::Rejected(status));
        }

        let userinfo: UserInfo = response
            .json()
            .await
            .map_err(|_| OpaqueTokenError::MissingSubject)?;
        userinfo
            .sub
            .filter(|subject| !subject.is_empty())
            .ok_or(OpaqueTokenError::MissingSubject)
    }
}

#[async_trait]
impl ResolutionStrategy for OpaqueTokenResolver {
    fn name(&self) -> &'static str {
        "opaque"
    }

    async fn resolve(&self, token: &str) -> Result<String, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingCredential);
        }
        self.lookup(token).await.map_err(AuthError::from)
    }
}

fn cache_key(token: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(token.as_bytes()))
}
