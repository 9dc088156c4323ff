use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::code::PublicCode;
use crate::owner::OwnerKey;

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// One uploaded artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub id: Uuid,
    pub internal_id: i64,
    pub code: PublicCode,
    pub filename: String,
    pub location: String,
    pub size: i64,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub owner: OwnerKey,
    pub download_count: i64,
}

impl FileRecord {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Everything needed to insert a record; the identifier and code are assigned by storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFileRecord {
    pub id: Uuid,
    pub filename: String,
    pub location: String,
    pub size: i64,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub owner: OwnerKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadEvent {
    pub file_id: Uuid,
    pub downloaded_at: DateTime<Utc>,
    pub client_address: Option<String>,
}
