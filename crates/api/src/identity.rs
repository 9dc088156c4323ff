use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use codedrop_auth::{bearer_token, resolve_identity, AuthError, ResolutionMode};
use codedrop_core::CallerIdentity;

use crate::{ApiState, HttpFailure};

pub(crate) const SESSION_ID_HEADER: &str = "x-session-id";

pub(crate) fn authorization_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
}

fn session_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
}

/// Resolves the caller from the `Authorization` and `X-Session-Id` headers.
pub(crate) async fn caller_identity(
    state: &ApiState,
    headers: &HeaderMap,
    mode: ResolutionMode,
) -> Result<CallerIdentity, HttpFailure> {
    resolve_credentials(
        state,
        mode,
        authorization_bearer(headers),
        session_header(headers),
    )
    .await
}

pub(crate) async fn resolve_credentials(
    state: &ApiState,
    mode: ResolutionMode,
    bearer: Option<&str>,
    session_id: Option<&str>,
) -> Result<CallerIdentity, HttpFailure> {
    resolve_identity(state.validator(), mode, bearer, session_id)
        .await
        .map_err(auth_failure)
}

pub(crate) fn auth_failure(error: AuthError) -> HttpFailure {
    match error {
        AuthError::InvalidSessionId => HttpFailure::new(StatusCode::BAD_REQUEST, "Invalid session ID"),
        AuthError::MissingCredential
        | AuthError::Unauthenticated
        | AuthError::UpstreamUnavailable => {
            tracing::debug!(error = %error, "request not authenticated");
            HttpFailure::new(StatusCode::UNAUTHORIZED, "Authentication required")
        }
    }
}
