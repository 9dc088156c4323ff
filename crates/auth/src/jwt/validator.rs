#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use serde::{Deserialize, Serialize};

use super::jwks::{JwksClient, KeyFamily};
use crate::resolver::ResolutionStrategy;
use crate::AuthError;

const DEFAULT_REFRESH_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Default)]
pub struct JwtVerifierConfig {
    pub issuer: String,
    pub jwks_url: String,
    /// Accepted audiences. Empty disables the audience check.
    pub audiences: Vec<String>,
    pub refresh_ttl: Duration,
}

/// Verifies signed bearer credentials from a single trusted issuer.
pub struct JwtVerifier {
    issuer: String,
    jwks: JwksClient,
    audiences: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub iss: String,
    #[serde(default)]
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<AudienceClaim>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AudienceClaim {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum JwtValidationError {
    #[error("missing authorization token")]
    MissingToken,
    #[error("invalid token")]
    InvalidToken,
    #[error("token has expired")]
    ExpiredToken,
    #[error("token is not valid yet")]
    ImmatureToken,
    #[error("untrusted token issuer")]
    UntrustedIssuer,
    #[error("signing keys unavailable")]
    KeySetUnavailable,
}

impl JwtVerifier {
    #[must_use]
    pub fn new(config: JwtVerifierConfig) -> Self {
        let refresh_ttl = if config.refresh_ttl.is_zero() {
            DEFAULT_REFRESH_TTL
        } else {
            config.refresh_ttl
        };

        Self {
            issuer: normalize_issuer(&config.issuer),
            jwks: JwksClient::new(config.jwks_url, refresh_ttl),
            audiences: config.audiences,
        }
    }

    pub fn set_http_client(&mut self, http_client: reqwest::Client) {
        self.jwks.set_http_client(http_client);
    }

    /// Verifies `token` against the issuer key set and returns its claims.
    pub async fn verify(&self, token: &str) -> Result<Claims, JwtValidationError> {
        if token.is_empty() {
            return Err(JwtValidationError::MissingToken);
        }

        let header = decode_header(token).map_err(|_| JwtValidationError::InvalidToken)?;
        let family = key_family(header.alg).ok_or(JwtValidationError::InvalidToken)?;

        let unverified_issuer = extract_unverified_issuer(token)?;
        if normalize_issuer(&unverified_issuer) != self.issuer {
            return Err(JwtValidationError::UntrustedIssuer);
        }

        let decoding_key = self
            .jwks
            .get_key(header.kid.as_deref(), family)
            .await
            .map_err(|error| {
                if error.is_unavailable() {
                    JwtValidationError::KeySetUnavailable
                } else {
                    JwtValidationError::InvalidToken
                }
            })?;

        let mut validation = Validation::new(header.alg);
        validation.validate_aud = false;
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        let token_data =
            decode::<Claims>(token, &decoding_key, &validation).map_err(map_decode_error)?;
        let claims = token_data.claims;

        let now = unix_now().map_err(|_| JwtValidationError::InvalidToken)?;
        if let Some(exp) = claims.exp {
            if now >= exp {
                return Err(JwtValidationError::ExpiredToken);
            }
        }
        if let Some(nbf) = claims.nbf {
            if now < nbf {
                return Err(JwtValidationError::ImmatureToken);
            }
        }

        if normalize_issuer(&claims.iss) != self.issuer {
            return Err(JwtValidationError::UntrustedIssuer);
        }

        if !self.audiences.is_empty() && !audience_matches(claims.aud.as_ref(), &self.audiences) {
            return Err(JwtValidationError::InvalidToken);
        }

        if claims.sub.is_empty() {
            return Err(JwtValidationError::InvalidToken);
        }

        Ok(claims)
    }
}

#[async_trait]
impl ResolutionStrategy for JwtVerifier {
    fn name(&self) -> &'static str {
        "signed"
    }

    async fn resolve(&self, token: &str) -> Result<String, AuthError> {
        let claims = self.verify(token).await.map_err(AuthError::from)?;
        Ok(claims.sub)
    }
}

impl From<JwtValidationError> for AuthError {
    fn from(value: JwtValidationError) -> Self {
        match value {
            JwtValidationError::MissingToken => AuthError::MissingCredential,
            JwtValidationError::KeySetUnavailable => AuthError::UpstreamUnavailable,
            JwtValidationError::InvalidToken
            | JwtValidationError::ExpiredToken
            | JwtValidationError::ImmatureToken
            | JwtValidationError::UntrustedIssuer => AuthError::Unauthenticated,
        }
    }
}

pub fn normalize_issuer(issuer: &str) -> String {
    issuer.trim_end_matches('/').to_owned()
}

fn key_family(algorithm: Algorithm) -> Option<KeyFamily> {
    match algorithm {
        Algorithm::ES256 => Some(KeyFamily::Ec),
        Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => Some(KeyFamily::Rsa),
        _ => None,
    }
}

fn map_decode_error(error: jsonwebtoken::errors::Error) -> JwtValidationError {
    if matches!(
        error.kind(),
        jsonwebtoken::errors::ErrorKind::ExpiredSignature
    ) {
        JwtValidationError::ExpiredToken
    } else {
        JwtValidationError::InvalidToken
    }
}

fn extract_unverified_issuer(token: &str) -> Result<String, JwtValidationError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or(JwtValidationError::InvalidToken)?;
    let payload = URL_SAFE_NO_PAD
        .decode(payload.as_bytes())
        .map_err(|_| JwtValidationError::InvalidToken)?;
    let claims: UnverifiedClaims =
        serde_json::from_slice(&payload).map_err(|_| JwtValidationError::InvalidToken)?;
    let issuer = claims.iss.ok_or(JwtValidationError::UntrustedIssuer)?;
    Ok(issuer)
}

fn audience_matches(audience: Option<&AudienceClaim>, expected: &[String]) -> bool {
    match audience {
        Some(AudienceClaim::One(value)) => expected.iter().any(|candidate| candidate == value),
        Some(AudienceClaim::Many(values)) => values
            .iter()
            .any(|value| expected.iter().any(|candidate| candidate == value)),
        None => false,
    }
}

fn unix_now() -> Result<u64, std::time::SystemTimeError> {
    Ok(std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)?
        .as_secs())
}

#[derive(Debug, Deserialize)]
struct UnverifiedClaims {
    iss: Option<String>,
}
