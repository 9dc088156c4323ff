#![forbid(unsafe_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use codedrop_core::{DownloadEvent, FileRecord, NewFileRecord, PublicCode};
use uuid::Uuid;

pub mod blob;
pub mod postgres;
pub mod reaper;

pub use blob::{blob_location, BlobStore, BlobStoreError, ObjectStoreBlobStore};
pub use postgres::PostgresStorage;
pub use reaper::ExpiryReaper;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("file not found")]
    FileNotFound,
    #[error("no free public code after {0} attempts")]
    CodeSpaceExhausted(u32),
    #[error("stored record is invalid: {0}")]
    InvalidRecord(String),
    #[error("file size must be non-negative")]
    InvalidFileSize,
    #[error("database error: {0}")]
    Database(String),
    #[error("migration error: {0}")]
    Migration(String),
    #[error("DATABASE_URL is not set")]
    MissingDatabaseUrl,
}

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// Result of counting one download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReceipt {
    pub download_count: i64,
    pub downloaded_at: DateTime<Utc>,
}

/// Minimal view of an expired record, enough to remove its bytes and row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredFile {
    pub id: Uuid,
    pub code: PublicCode,
    pub location: String,
}

// ---------------------------------------------------------------------------
// Domain-specific storage traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait FileStorage: Send + Sync {
    async fn ping(&self) -> Result<(), StorageError>;
    /// Draws the next identifier, derives the public code and inserts the record.
    async fn insert_file(&self, file: &NewFileRecord) -> Result<FileRecord, StorageError>;
    /// Record with `code` whose expiry is still after `now`.
    async fn find_live_by_code(
        &self,
        code: PublicCode,
        now: DateTime<Utc>,
    ) -> Result<Option<FileRecord>, StorageError>;
    async fn get_file(&self, id: Uuid) -> Result<Option<FileRecord>, StorageError>;
    /// Records owned by `user_id` or by `session_id`, newest first.
    async fn list_for_owner(
        &self,
        user_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<Vec<FileRecord>, StorageError>;
    /// Moves every record of `session_id` to `user_id`. Returns the number moved.
    async fn migrate_session(&self, session_id: &str, user_id: &str) -> Result<u64, StorageError>;
}

#[async_trait]
pub trait DownloadStorage: Send + Sync {
    /// Increments the counter and appends a download event in one transaction.
    async fn record_download(
        &self,
        file_id: Uuid,
        client_address: Option<&str>,
    ) -> Result<DownloadReceipt, StorageError>;
    async fn download_history(&self, file_id: Uuid) -> Result<Vec<DownloadEvent>, StorageError>;
}

#[async_trait]
pub trait ExpiryStorage: Send + Sync {
    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<ExpiredFile>, StorageError>;
    /// Deletes the record and, by cascade, its download events.
    async fn delete_file(&self, id: Uuid) -> Result<bool, StorageError>;
}

/// Unified storage trait combining all domain-specific traits.
pub trait Storage: FileStorage + DownloadStorage + ExpiryStorage {}

impl<T> Storage for T where T: FileStorage + DownloadStorage + ExpiryStorage {}

pub async fn migrate() -> Result<(), StorageError> {
    let database_url =
        std::env::var("DATABASE_URL").map_err(|_| StorageError::MissingDatabaseUrl)?;
    let pool = sqlx::PgPool::connect(&database_url)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;
    migrate_with_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn migrate_with_pool(pool: &sqlx::PgPool) -> Result<(), StorageError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|error| StorageError::Migration(error.to_string()))?;
    Ok(())
}
