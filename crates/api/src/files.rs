use axum::extract::multipart::{Field, MultipartError};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use codedrop_auth::ResolutionMode;
use codedrop_core::owner::validate_session_id;
use codedrop_core::protocol::{
    DownloadEntry, FileListResponse, FileStatsResponse, FileSummary, MigrateSessionRequest,
    MigrateSessionResponse, UploadResponse,
};
use codedrop_core::record::DEFAULT_MIME_TYPE;
use codedrop_core::{CallerIdentity, NewFileRecord};
use codedrop_storage::{blob_location, BlobStore, DownloadStorage, FileStorage};
use uuid::Uuid;

use crate::identity::caller_identity;
use crate::{ApiState, HttpFailure};

const UPLOAD_FIELD: &str = "file";
const MAX_FILENAME_LENGTH: usize = 512;

fn identity_required() -> HttpFailure {
    HttpFailure::new(
        StatusCode::BAD_REQUEST,
        "Authentication or session ID required",
    )
}

fn no_file() -> HttpFailure {
    HttpFailure::new(StatusCode::BAD_REQUEST, "No file provided")
}

fn too_large(max_file_size: usize) -> HttpFailure {
    HttpFailure::new(
        StatusCode::PAYLOAD_TOO_LARGE,
        format!("File too large. Maximum size is {max_file_size} bytes"),
    )
}

struct UploadedPart {
    filename: String,
    content_type: Option<String>,
    payload: Bytes,
}

fn multipart_failure(error: MultipartError, max_file_size: usize) -> HttpFailure {
    if error.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return too_large(max_file_size);
    }
    tracing::debug!(error = %error, "malformed multipart body");
    HttpFailure::new(StatusCode::BAD_REQUEST, "Malformed multipart body")
}

async fn read_part(mut field: Field<'_>, max_file_size: usize) -> Result<UploadedPart, HttpFailure> {
    let filename = field
        .file_name()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(ToOwned::to_owned)
        .ok_or_else(no_file)?;
    if filename.chars().count() > MAX_FILENAME_LENGTH {
        return Err(HttpFailure::new(
            StatusCode::BAD_REQUEST,
            format!("Filename must be at most {MAX_FILENAME_LENGTH} characters"),
        ));
    }
    let content_type = field.content_type().map(ToOwned::to_owned);

    let mut payload = BytesMut::new();
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|error| multipart_failure(error, max_file_size))?
    {
        if payload.len() + chunk.len() > max_file_size {
            return Err(too_large(max_file_size));
        }
        payload.extend_from_slice(&chunk);
    }

    Ok(UploadedPart {
        filename,
        content_type,
        payload: payload.freeze(),
    })
}

/// Extension lookup first, then the declared part type, then the generic fallback.
fn resolve_mime_type(filename: &str, declared: Option<&str>) -> String {
    mime_guess::from_path(filename)
        .first_raw()
        .map(ToOwned::to_owned)
        .or_else(|| {
            declared
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToOwned::to_owned)
        })
        .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_owned())
}

pub(crate) async fn upload_file(
    State(state): State<ApiState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), HttpFailure> {
    let identity = caller_identity(&state, &headers, ResolutionMode::Optional).await?;
    let owner = identity.owner_key().ok_or_else(identity_required)?;
    let limits = state.upload_limits();

    let mut part = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|error| multipart_failure(error, limits.max_file_size))?
    {
        if field.name() == Some(UPLOAD_FIELD) {
            part = Some(read_part(field, limits.max_file_size).await?);
            break;
        }
    }
    let part = part.ok_or_else(no_file)?;

    let id = Uuid::new_v4();
    let location = blob_location(id, &part.filename);
    let size = i64::try_from(part.payload.len()).map_err(|_| too_large(limits.max_file_size))?;
    let created_at = Utc::now();
    let new_file = NewFileRecord {
        id,
        mime_type: resolve_mime_type(&part.filename, part.content_type.as_deref()),
        filename: part.filename,
        location,
        size,
        created_at,
        expires_at: created_at + limits.file_lifetime,
        owner,
    };

    if let Err(error) = state.blobs().put(&new_file.location, part.payload).await {
        tracing::error!(file_id = %id, error = %error, "failed to store uploaded bytes");
        return Err(HttpFailure::internal());
    }

    let record = match state.storage().insert_file(&new_file).await {
        Ok(record) => record,
        Err(error) => {
            tracing::error!(file_id = %id, error = %error, "failed to insert file record");
            if let Err(cleanup) = state.blobs().remove(&new_file.location).await {
                tracing::warn!(file_id = %id, error = %cleanup, "failed to remove orphaned upload");
            }
            return Err(HttpFailure::internal());
        }
    };

    tracing::info!(
        file_id = %record.id,
        code = %record.code,
        size = record.size,
        owner = %record.owner,
        "file uploaded"
    );
    Ok((StatusCode::CREATED, Json(UploadResponse::from(&record))))
}

async fn identified_caller(
    state: &ApiState,
    headers: &HeaderMap,
) -> Result<CallerIdentity, HttpFailure> {
    let identity = caller_identity(state, headers, ResolutionMode::Optional).await?;
    if identity.is_anonymous() {
        return Err(identity_required());
    }
    Ok(identity)
}

pub(crate) async fn list_files(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<FileListResponse>, HttpFailure> {
    let identity = identified_caller(&state, &headers).await?;
    let records = state
        .storage()
        .list_for_owner(identity.user_id.as_deref(), identity.session_id.as_deref())
        .await
        .map_err(|error| {
            tracing::error!(error = %error, "failed to list files");
            HttpFailure::internal()
        })?;
    Ok(Json(FileListResponse {
        files: records.iter().map(FileSummary::from).collect(),
    }))
}

pub(crate) async fn file_stats(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<FileStatsResponse>, HttpFailure> {
    let identity = identified_caller(&state, &headers).await?;
    let not_found = || HttpFailure::new(StatusCode::NOT_FOUND, "File not found");

    let file_id = Uuid::parse_str(&id).map_err(|_| not_found())?;
    let record = state
        .storage()
        .get_file(file_id)
        .await
        .map_err(|error| {
            tracing::error!(file_id = %file_id, error = %error, "failed to load file");
            HttpFailure::internal()
        })?
        .ok_or_else(not_found)?;
    if !identity.owns(&record.owner) {
        return Err(HttpFailure::new(StatusCode::FORBIDDEN, "Access denied"));
    }

    let history = state
        .storage()
        .download_history(file_id)
        .await
        .map_err(|error| {
            tracing::error!(file_id = %file_id, error = %error, "failed to load download history");
            HttpFailure::internal()
        })?;
    Ok(Json(FileStatsResponse {
        file_id,
        filename: record.filename,
        download_count: record.download_count,
        downloads: history.iter().map(DownloadEntry::from).collect(),
    }))
}

/// Reassigns every file of an anonymous session to the authenticated caller.
pub(crate) async fn migrate_session(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Result<Json<MigrateSessionRequest>, JsonRejection>,
) -> Result<Json<MigrateSessionResponse>, HttpFailure> {
    let identity = caller_identity(&state, &headers, ResolutionMode::Required).await?;
    let Some(user_id) = identity.user_id else {
        return Err(HttpFailure::new(
            StatusCode::UNAUTHORIZED,
            "Authentication required",
        ));
    };

    let invalid = || HttpFailure::new(StatusCode::BAD_REQUEST, "Missing or invalid sessionId");
    let Json(request) = body.map_err(|_| invalid())?;
    let raw = request.session_id.ok_or_else(invalid)?;
    let session_id = validate_session_id(&raw).map_err(|_| invalid())?;

    let migrated = state
        .storage()
        .migrate_session(session_id, &user_id)
        .await
        .map_err(|error| {
            tracing::error!(error = %error, "failed to migrate session files");
            HttpFailure::internal()
        })?;
    tracing::info!(user_id = %user_id, migrated, "session files migrated");
    Ok(Json(MigrateSessionResponse { migrated }))
}
