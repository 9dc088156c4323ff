use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::{AuthContext, AuthError, TokenValidator};

pub const DEFAULT_STRATEGY_TIMEOUT: Duration = Duration::from_secs(5);

/// One way of turning a bearer credential into a subject identifier.
#[async_trait]
pub trait ResolutionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn resolve(&self, token: &str) -> Result<String, AuthError>;
}

/// Ordered chain of strategies. The first strategy that yields a subject wins;
/// each attempt is bounded by `timeout`.
pub struct CredentialResolver {
    strategies: Vec<Arc<dyn ResolutionStrategy>>,
    timeout: Duration,
}

impl CredentialResolver {
    #[must_use]
    pub fn new(strategies: Vec<Arc<dyn ResolutionStrategy>>) -> Self {
        Self {
            strategies,
            timeout: DEFAULT_STRATEGY_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies
            .iter()
            .map(|strategy| strategy.name())
            .collect()
    }

    /// Resolves `token` to an [`AuthContext`]. Every failure, including an
    /// unreachable identity provider, surfaces as [`AuthError::Unauthenticated`].
    pub async fn resolve(&self, token: &str) -> Result<AuthContext, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingCredential);
        }

        for strategy in &self.strategies {
            match tokio::time::timeout(self.timeout, strategy.resolve(token)).await {
                Ok(Ok(user_id)) => {
                    return Ok(AuthContext {
                        user_id,
                        resolved_by: strategy.name(),
                    });
                }
                Ok(Err(error)) => {
                    tracing::debug!(strategy = strategy.name(), error = %error, "credential strategy failed");
                }
                Err(_) => {
                    tracing::debug!(
                        strategy = strategy.name(),
                        timeout_ms = self.timeout.as_millis() as u64,
                        "credential strategy timed out"
                    );
                }
            }
        }

        Err(AuthError::Unauthenticated)
    }
}

#[async_trait]
impl TokenValidator for CredentialResolver {
    async fn validate_token(&self, token: &str) -> Result<AuthContext, AuthError> {
        self.resolve(token).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::jwt::{JwtVerifier, JwtVerifierConfig};
    use crate::opaque::{OpaqueTokenResolver, OpaqueTokenResolverConfig};
    use crate::test_support::{
        mock_jwks_server, mock_userinfo_server, test_claims, TestKeyPair, ISSUER,
    };

    struct Fixed {
        name: &'static str,
        outcome: Result<&'static str, AuthError>,
        delay: Duration,
        calls: AtomicUsize,
    }

    fn chain(strategies: &[&Arc<Fixed>]) -> Vec<Arc<dyn ResolutionStrategy>> {
        strategies
            .iter()
            .map(|strategy| Arc::clone(strategy) as Arc<dyn ResolutionStrategy>)
            .collect()
    }

    impl Fixed {
        fn new(name: &'static str, outcome: Result<&'static str, AuthError>) -> Arc<Self> {
            Arc::new(Self {
                name,
                outcome,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            })
        }

        fn slow(name: &'static str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name,
                outcome: Ok("too-late"),
                delay,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ResolutionStrategy for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn resolve(&self, _token: &str) -> Result<String, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.outcome.clone().map(str::to_owned)
        }
    }

    #[tokio::test]
    async fn first_success_short_circuits() {
        let first = Fixed::new("first", Ok("user-1"));
        let second = Fixed::new("second", Ok("user-2"));
        let resolver = CredentialResolver::new(chain(&[&first, &second]));

        let context = resolver.resolve("token").await.expect("resolve");
        assert_eq!(context.user_id, "user-1");
        assert_eq!(context.resolved_by, "first");
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn falls_through_to_later_strategy() {
        let first = Fixed::new("first", Err(AuthError::Unauthenticated));
        let second = Fixed::new("second", Ok("user-2"));
        let resolver = CredentialResolver::new(chain(&[&first, &second]));

        let context = resolver.resolve("token").await.expect("resolve");
        assert_eq!(context.user_id, "user-2");
        assert_eq!(context.resolved_by, "second");
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn upstream_failures_collapse_to_unauthenticated() {
        let first = Fixed::new("first", Err(AuthError::UpstreamUnavailable));
        let second = Fixed::new("second", Err(AuthError::Unauthenticated));
        let resolver = CredentialResolver::new(chain(&[&first, &second]));

        assert_eq!(
            resolver.resolve("token").await,
            Err(AuthError::Unauthenticated)
        );
    }

    #[tokio::test]
    async fn empty_token_is_missing_credential() {
        let strategy = Fixed::new("first", Ok("user-1"));
        let resolver = CredentialResolver::new(chain(&[&strategy]));

        assert_eq!(resolver.resolve("").await, Err(AuthError::MissingCredential));
        assert_eq!(strategy.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_strategy_is_bounded_by_timeout() {
        let slow = Fixed::slow("slow", Duration::from_secs(30));
        let fallback = Fixed::new("fallback", Ok("user-9"));
        let resolver = CredentialResolver::new(chain(&[&slow, &fallback]))
            .with_timeout(Duration::from_millis(100));

        let context = resolver.resolve("token").await.expect("resolve");
        assert_eq!(context.resolved_by, "fallback");

        let only_slow = CredentialResolver::new(chain(&[&slow]))
            .with_timeout(Duration::from_millis(100));
        assert_eq!(
            only_slow.resolve("token").await,
            Err(AuthError::Unauthenticated)
        );
    }

    fn tamper(token: &str) -> String {
        let mut bytes = token.as_bytes().to_vec();
        let index = bytes.len() - 20;
        bytes[index] = if bytes[index] == b'A' { b'B' } else { b'A' };
        String::from_utf8(bytes).expect("ascii token")
    }

    #[tokio::test]
    async fn tampered_signature_falls_back_to_opaque_lookup() {
        let key = TestKeyPair::new("key-1", 7);
        let jwks = mock_jwks_server(vec![key.jwk()]).await;
        let token = key.sign_token(&test_claims(ISSUER, "user-123"));
        let tampered = tamper(&token);
        let userinfo = mock_userinfo_server(&[(tampered.as_str(), "user-opaque")]).await;

        let signed: Arc<dyn ResolutionStrategy> = Arc::new(JwtVerifier::new(JwtVerifierConfig {
            issuer: ISSUER.to_owned(),
            jwks_url: jwks.url.clone(),
            audiences: Vec::new(),
            refresh_ttl: Duration::from_secs(60),
        }));
        let opaque: Arc<dyn ResolutionStrategy> = Arc::new(OpaqueTokenResolver::new(
            OpaqueTokenResolverConfig::new(format!("{}/userinfo", userinfo.url)),
        ));
        let resolver = CredentialResolver::new(vec![signed, opaque])
            .with_timeout(Duration::from_secs(2));
        assert_eq!(resolver.strategy_names(), vec!["signed", "opaque"]);

        let context = resolver.validate_token(&token).await.expect("signed");
        assert_eq!(context.user_id, "user-123");
        assert_eq!(context.resolved_by, "signed");
        assert_eq!(userinfo.calls.load(Ordering::SeqCst), 0);

        let context = resolver
            .validate_token(&tampered)
            .await
            .expect("tampered token resolved by userinfo");
        assert_eq!(context.user_id, "user-opaque");
        assert_eq!(context.resolved_by, "opaque");
        assert_eq!(userinfo.calls.load(Ordering::SeqCst), 1);

        let unknown_to_userinfo = tamper(&key.sign_token(&test_claims(ISSUER, "user-456")));
        assert_eq!(
            resolver.validate_token(&unknown_to_userinfo).await,
            Err(AuthError::Unauthenticated)
        );
        assert_eq!(userinfo.calls.load(Ordering::SeqCst), 2);
    }
}
