use async_trait::async_trait;
use chrono::{DateTime, Utc};
use codedrop_core::PublicCode;
use uuid::Uuid;

use super::{database_error, PostgresStorage};
use crate::{ExpiredFile, ExpiryStorage, StorageError};

#[derive(sqlx::FromRow)]
struct ExpiredRow {
    id: Uuid,
    code: String,
    file_path: String,
}

#[async_trait]
impl ExpiryStorage for PostgresStorage {
    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<ExpiredFile>, StorageError> {
        let rows = sqlx::query_as::<_, ExpiredRow>(
            "SELECT id, code, file_path FROM files WHERE expires_at <= $1 ORDER BY expires_at",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(database_error)?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match PublicCode::parse(row.code.trim()) {
                Ok(code) => Some(ExpiredFile {
                    id: row.id,
                    code,
                    location: row.file_path,
                }),
                Err(error) => {
                    tracing::warn!(file_id = %row.id, code = %row.code, error = %error, "skipping expired file with invalid code");
                    None
                }
            })
            .collect())
    }

    async fn delete_file(&self, id: Uuid) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM files WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(database_error)?;
        Ok(result.rows_affected() > 0)
    }
}
