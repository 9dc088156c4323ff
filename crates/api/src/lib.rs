#![forbid(unsafe_code)]

use std::borrow::Cow;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use codedrop_auth::TokenValidator;
use codedrop_core::protocol::ErrorResponse;
use codedrop_realtime::broker::ConnectionRegistry;
use codedrop_storage::{BlobStore, FileStorage, Storage};

mod download;
mod files;
mod identity;
pub mod ratelimit;
mod ws;

#[cfg(test)]
mod test_support;

pub use ratelimit::{FixedWindowLimiter, RateLimitConfig, RateLimitError};

pub const DEFAULT_MAX_FILE_SIZE: usize = 100 * 1024 * 1024;
pub const DEFAULT_FILE_LIFETIME_DAYS: i64 = 7;
/// Room for multipart framing on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadLimits {
    pub max_file_size: usize,
    pub file_lifetime: chrono::Duration,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            file_lifetime: chrono::Duration::days(DEFAULT_FILE_LIFETIME_DAYS),
        }
    }
}

#[derive(Clone)]
pub struct ApiState {
    storage: Arc<dyn Storage>,
    blobs: Arc<dyn BlobStore>,
    validator: Arc<dyn TokenValidator>,
    registry: Arc<ConnectionRegistry>,
    limiter: Arc<FixedWindowLimiter>,
    upload_limits: UploadLimits,
}

impl ApiState {
    #[must_use]
    pub fn new(
        storage: Arc<dyn Storage>,
        blobs: Arc<dyn BlobStore>,
        validator: Arc<dyn TokenValidator>,
    ) -> Self {
        Self {
            storage,
            blobs,
            validator,
            registry: Arc::new(ConnectionRegistry::default()),
            limiter: Arc::new(FixedWindowLimiter::new(RateLimitConfig::default())),
            upload_limits: UploadLimits::default(),
        }
    }

    #[must_use]
    pub fn with_registry(mut self, registry: Arc<ConnectionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<FixedWindowLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    #[must_use]
    pub fn with_upload_limits(mut self, upload_limits: UploadLimits) -> Self {
        self.upload_limits = upload_limits;
        self
    }

    #[must_use]
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    #[must_use]
    pub fn rate_limiter(&self) -> Arc<FixedWindowLimiter> {
        Arc::clone(&self.limiter)
    }

    pub(crate) fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    pub(crate) fn blobs(&self) -> &dyn BlobStore {
        self.blobs.as_ref()
    }

    pub(crate) fn validator(&self) -> &dyn TokenValidator {
        self.validator.as_ref()
    }

    pub(crate) fn upload_limits(&self) -> UploadLimits {
        self.upload_limits
    }
}

/// Every route lives under `/api`. Serve with
/// `into_make_service_with_connect_info::<SocketAddr>()` so the rate limiter
/// can fall back to the peer address.
pub fn router(state: ApiState) -> Router {
    let limiter = state.rate_limiter();
    let upload_body_limit = state
        .upload_limits
        .max_file_size
        .saturating_add(MULTIPART_OVERHEAD);

    let api = Router::new()
        .route("/health", get(health))
        .route(
            "/upload",
            post(files::upload_file).layer(DefaultBodyLimit::max(upload_body_limit)),
        )
        .route("/files", get(files::list_files))
        .route("/files/{id}/stats", get(files::file_stats))
        .route(
            "/download/{code}",
            get(download::download_metadata).merge(
                post(download::download_file)
                    .route_layer(from_fn_with_state(limiter, ratelimit::rate_limit_middleware)),
            ),
        )
        .route("/migrate-session", post(files::migrate_session))
        .route("/ws", get(ws::websocket_upgrade));

    Router::new().nest("/api", api).with_state(state)
}

async fn health(State(state): State<ApiState>) -> StatusCode {
    match state.storage.ping().await {
        Ok(()) => StatusCode::OK,
        Err(error) => {
            tracing::warn!(error = %error, "health check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// A status plus the message rendered as `{"error": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HttpFailure {
    pub status: StatusCode,
    pub message: Cow<'static, str>,
}

impl HttpFailure {
    pub(crate) fn new(status: StatusCode, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub(crate) fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    }
}

impl IntoResponse for HttpFailure {
    fn into_response(self) -> Response {
        error_response(self.status, self.message)
    }
}

pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}
