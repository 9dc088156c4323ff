#![forbid(unsafe_code)]

use async_trait::async_trait;

pub mod identity;
pub mod jwt;
pub mod opaque;
pub mod resolver;

pub use identity::{bearer_token, resolve_identity, ResolutionMode};
pub use opaque::{OpaqueTokenError, OpaqueTokenResolver, OpaqueTokenResolverConfig};
pub use resolver::{CredentialResolver, ResolutionStrategy};

/// A successfully resolved bearer credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: String,
    pub resolved_by: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("authentication required")]
    MissingCredential,
    #[error("invalid or expired credential")]
    Unauthenticated,
    #[error("identity provider unavailable")]
    UpstreamUnavailable,
    #[error("invalid session identifier")]
    InvalidSessionId,
}

#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate_token(&self, token: &str) -> Result<AuthContext, AuthError>;
}

#[cfg(test)]
pub(crate) mod test_support;
