use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::code::PublicCode;
use crate::record::{DownloadEvent, FileRecord};

/// Body of a successful upload (`201 Created`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    #[serde(rename = "id")]
    pub id: Uuid,
    #[serde(rename = "code")]
    pub code: PublicCode,
    #[serde(rename = "filename")]
    pub filename: String,
    #[serde(rename = "fileSize")]
    pub file_size: i64,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    #[serde(rename = "uploadedAt")]
    pub uploaded_at: DateTime<Utc>,
    #[serde(rename = "expiresAt")]
    pub expires_at: DateTime<Utc>,
}

impl From<&FileRecord> for UploadResponse {
    fn from(record: &FileRecord) -> Self {
        Self {
            id: record.id,
            code: record.code,
            filename: record.filename.clone(),
            file_size: record.size,
            mime_type: record.mime_type.clone(),
            uploaded_at: record.created_at,
            expires_at: record.expires_at,
        }
    }
}

/// One entry of the owner's file listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSummary {
    #[serde(rename = "id")]
    pub id: Uuid,
    #[serde(rename = "code")]
    pub code: PublicCode,
    #[serde(rename = "filename")]
    pub filename: String,
    #[serde(rename = "fileSize")]
    pub file_size: i64,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    #[serde(rename = "uploadedAt")]
    pub uploaded_at: DateTime<Utc>,
    #[serde(rename = "expiresAt")]
    pub expires_at: DateTime<Utc>,
    #[serde(rename = "downloadCount")]
    pub download_count: i64,
}

impl From<&FileRecord> for FileSummary {
    fn from(record: &FileRecord) -> Self {
        Self {
            id: record.id,
            code: record.code,
            filename: record.filename.clone(),
            file_size: record.size,
            mime_type: record.mime_type.clone(),
            uploaded_at: record.created_at,
            expires_at: record.expires_at,
            download_count: record.download_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileListResponse {
    #[serde(rename = "files")]
    pub files: Vec<FileSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadEntry {
    #[serde(rename = "downloadedAt")]
    pub downloaded_at: DateTime<Utc>,
}

impl From<&DownloadEvent> for DownloadEntry {
    fn from(event: &DownloadEvent) -> Self {
        Self {
            downloaded_at: event.downloaded_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStatsResponse {
    #[serde(rename = "fileId")]
    pub file_id: Uuid,
    #[serde(rename = "filename")]
    pub filename: String,
    #[serde(rename = "downloadCount")]
    pub download_count: i64,
    #[serde(rename = "downloads")]
    pub downloads: Vec<DownloadEntry>,
}

/// Metadata shown before a download is confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadMetadataResponse {
    #[serde(rename = "filename")]
    pub filename: String,
    #[serde(rename = "fileSize")]
    pub file_size: i64,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateSessionRequest {
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateSessionResponse {
    #[serde(rename = "migrated")]
    pub migrated: u64,
}

/// ErrorResponse represents an error response from HTTP JSON APIs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(rename = "error")]
    pub error: String,
}
