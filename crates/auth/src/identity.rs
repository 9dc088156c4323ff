use codedrop_core::owner::validate_session_id;
use codedrop_core::CallerIdentity;

use crate::{AuthError, TokenValidator};

/// Whether a request may proceed without a resolvable bearer credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionMode {
    /// A valid bearer credential is mandatory.
    Required,
    /// A failed or absent credential leaves the caller anonymous.
    Optional,
}

/// Extracts the token from an `Authorization: Bearer <token>` value.
#[must_use]
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let (scheme, token) = header_value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Builds the caller identity from an optional bearer token and an optional
/// session identifier.
pub async fn resolve_identity(
    validator: &dyn TokenValidator,
    mode: ResolutionMode,
    bearer: Option<&str>,
    session_id: Option<&str>,
) -> Result<CallerIdentity, AuthError> {
    let session_id = match session_id {
        Some(raw) => Some(
            validate_session_id(raw)
                .map_err(|_| AuthError::InvalidSessionId)?
                .to_owned(),
        ),
        None => None,
    };

    let user_id = match (bearer, mode) {
        (None, ResolutionMode::Required) => return Err(AuthError::MissingCredential),
        (None, ResolutionMode::Optional) => None,
        (Some(token), ResolutionMode::Required) => {
            Some(validator.validate_token(token).await?.user_id)
        }
        (Some(token), ResolutionMode::Optional) => match validator.validate_token(token).await {
            Ok(context) => Some(context.user_id),
            Err(error) => {
                tracing::debug!(error = %error, "ignoring unresolvable credential");
                None
            }
        },
    };

    Ok(CallerIdentity {
        user_id,
        session_id,
    })
}
