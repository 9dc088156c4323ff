#![forbid(unsafe_code)]

mod jwks;
mod validator;

pub use jwks::{parse_jwk, JwksClient, JwksError, KeyFamily, JWK, JWKS, MAX_JWKS_SIZE};
pub use validator::{
    normalize_issuer, AudienceClaim, Claims, JwtValidationError, JwtVerifier, JwtVerifierConfig,
};
