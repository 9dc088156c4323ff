use async_trait::async_trait;
use chrono::{DateTime, Utc};
use codedrop_core::{CodeCodec, FileRecord, NewFileRecord, OwnerKey, PublicCode};
use uuid::Uuid;

use super::{database_error, is_unique_violation, PostgresStorage};
use crate::{FileStorage, StorageError};

/// Sequence draws attempted before giving up on finding a free code.
pub(super) const MAX_CODE_ATTEMPTS: u32 = 8;

pub(super) const FILE_COLUMNS: &str = "id, internal_id, code, filename, file_path, file_size, \
     mime_type, uploaded_at, expires_at, user_id, session_id, download_count";

#[derive(sqlx::FromRow)]
pub(super) struct FileRow {
    id: Uuid,
    internal_id: i32,
    code: String,
    filename: String,
    file_path: String,
    file_size: i64,
    mime_type: String,
    uploaded_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    user_id: Option<String>,
    session_id: Option<String>,
    download_count: i32,
}

impl TryFrom<FileRow> for FileRecord {
    type Error = StorageError;

    fn try_from(row: FileRow) -> Result<Self, Self::Error> {
        let code = PublicCode::parse(row.code.trim())
            .map_err(|error| StorageError::InvalidRecord(format!("file {}: {error}", row.id)))?;
        let owner = OwnerKey::from_columns(row.user_id, row.session_id)
            .map_err(|error| StorageError::InvalidRecord(format!("file {}: {error}", row.id)))?;
        Ok(FileRecord {
            id: row.id,
            internal_id: i64::from(row.internal_id),
            code,
            filename: row.filename,
            location: row.file_path,
            size: row.file_size,
            mime_type: row.mime_type,
            created_at: row.uploaded_at,
            expires_at: row.expires_at,
            owner,
            download_count: i64::from(row.download_count),
        })
    }
}

fn into_records(rows: Vec<FileRow>) -> Result<Vec<FileRecord>, StorageError> {
    rows.into_iter().map(FileRecord::try_from).collect()
}

fn is_code_collision(error: &sqlx::Error) -> bool {
    is_unique_violation(error)
        && matches!(
            error,
            sqlx::Error::Database(db_error) if db_error.constraint() == Some("idx_files_code")
        )
}

impl PostgresStorage {
    /// One insert attempt. `Ok(None)` means the drawn code is still held by a live record.
    async fn try_insert_file(
        &self,
        file: &NewFileRecord,
        codec: &CodeCodec,
    ) -> Result<Option<FileRow>, StorageError> {
        let internal_id: i64 = sqlx::query_scalar("SELECT nextval('file_code_seq')")
            .fetch_one(&self.pool)
            .await
            .map_err(database_error)?;
        let code = codec
            .encode(internal_id)
            .map_err(|error| StorageError::InvalidRecord(error.to_string()))?;
        let stored_id = i32::try_from(internal_id)
            .map_err(|_| StorageError::InvalidRecord(format!("identifier {internal_id} out of range")))?;

        let result = sqlx::query_as::<_, FileRow>(&format!(
            r#"
            INSERT INTO files (id, internal_id, code, filename, file_path, file_size,
                               mime_type, uploaded_at, expires_at, user_id, session_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {FILE_COLUMNS}
            "#
        ))
        .bind(file.id)
        .bind(stored_id)
        .bind(code.to_string())
        .bind(&file.filename)
        .bind(&file.location)
        .bind(file.size)
        .bind(&file.mime_type)
        .bind(file.created_at)
        .bind(file.expires_at)
        .bind(file.owner.user_id())
        .bind(file.owner.session_id())
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(Some(row)),
            Err(error) if is_code_collision(&error) => Ok(None),
            Err(error) => Err(database_error(error)),
        }
    }
}

#[async_trait]
impl FileStorage for PostgresStorage {
    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(database_error)?;
        Ok(())
    }

    async fn insert_file(&self, file: &NewFileRecord) -> Result<FileRecord, StorageError> {
        if file.size < 0 {
            return Err(StorageError::InvalidFileSize);
        }

        let codec = CodeCodec::standard();
        for attempt in 1..=MAX_CODE_ATTEMPTS {
            match self.try_insert_file(file, &codec).await? {
                Some(row) => return FileRecord::try_from(row),
                // A record from the previous identifier cycle still holds this code.
                None => {
                    tracing::warn!(attempt, file_id = %file.id, "public code still in use; drawing next identifier");
                }
            }
        }
        Err(StorageError::CodeSpaceExhausted(MAX_CODE_ATTEMPTS))
    }

    async fn find_live_by_code(
        &self,
        code: PublicCode,
        now: DateTime<Utc>,
    ) -> Result<Option<FileRecord>, StorageError> {
        let row = sqlx::query_as::<_, FileRow>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE code = $1 AND expires_at > $2"
        ))
        .bind(code.to_string())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(database_error)?;
        row.map(FileRecord::try_from).transpose()
    }

    async fn get_file(&self, id: Uuid) -> Result<Option<FileRecord>, StorageError> {
        let row = sqlx::query_as::<_, FileRow>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(database_error)?;
        row.map(FileRecord::try_from).transpose()
    }

    async fn list_for_owner(
        &self,
        user_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<Vec<FileRecord>, StorageError> {
        if user_id.is_none() && session_id.is_none() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, FileRow>(&format!(
            r#"
            SELECT {FILE_COLUMNS}
            FROM files
            WHERE ($1::text IS NOT NULL AND user_id = $1)
               OR ($2::text IS NOT NULL AND session_id = $2)
            ORDER BY uploaded_at DESC, internal_id DESC
            "#
        ))
        .bind(user_id)
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(database_error)?;
        into_records(rows)
    }

    async fn migrate_session(&self, session_id: &str, user_id: &str) -> Result<u64, StorageError> {
        let result = sqlx::query(
            "UPDATE files SET user_id = $1, session_id = NULL WHERE session_id = $2",
        )
        .bind(user_id)
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(database_error)?;
        Ok(result.rows_affected())
    }
}
