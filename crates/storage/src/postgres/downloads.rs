use std::net::IpAddr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use codedrop_core::DownloadEvent;
use uuid::Uuid;

use super::{database_error, PostgresStorage};
use crate::{DownloadReceipt, DownloadStorage, StorageError};

#[derive(sqlx::FromRow)]
struct DownloadRow {
    file_id: Uuid,
    downloaded_at: DateTime<Utc>,
    client_address: Option<String>,
}

impl From<DownloadRow> for DownloadEvent {
    fn from(row: DownloadRow) -> Self {
        Self {
            file_id: row.file_id,
            downloaded_at: row.downloaded_at,
            client_address: row.client_address,
        }
    }
}

/// Only addresses the `inet` column accepts are stored; anything else is recorded as absent.
fn storable_address(client_address: Option<&str>) -> Option<String> {
    let raw = client_address?.trim();
    match raw.parse::<IpAddr>() {
        Ok(address) => Some(address.to_string()),
        Err(_) => {
            tracing::debug!(client_address = raw, "discarding unparseable client address");
            None
        }
    }
}

#[async_trait]
impl DownloadStorage for PostgresStorage {
    async fn record_download(
        &self,
        file_id: Uuid,
        client_address: Option<&str>,
    ) -> Result<DownloadReceipt, StorageError> {
        let mut tx = self.pool.begin().await.map_err(database_error)?;

        let download_count: i32 = sqlx::query_scalar(
            "UPDATE files SET download_count = download_count + 1 WHERE id = $1 RETURNING download_count",
        )
        .bind(file_id)
        .fetch_one(tx.as_mut())
        .await
        .map_err(|error| match error {
            sqlx::Error::RowNotFound => StorageError::FileNotFound,
            _ => database_error(error),
        })?;

        let downloaded_at: DateTime<Utc> = sqlx::query_scalar(
            r#"
            INSERT INTO downloads (file_id, ip_address)
            VALUES ($1, $2::inet)
            RETURNING downloaded_at
            "#,
        )
        .bind(file_id)
        .bind(storable_address(client_address))
        .fetch_one(tx.as_mut())
        .await
        .map_err(database_error)?;

        tx.commit().await.map_err(database_error)?;
        Ok(DownloadReceipt {
            download_count: i64::from(download_count),
            downloaded_at,
        })
    }

    async fn download_history(&self, file_id: Uuid) -> Result<Vec<DownloadEvent>, StorageError> {
        let rows = sqlx::query_as::<_, DownloadRow>(
            r#"
            SELECT file_id, downloaded_at, host(ip_address) AS client_address
            FROM downloads
            WHERE file_id = $1
            ORDER BY downloaded_at DESC
            "#,
        )
        .bind(file_id)
        .fetch_all(&self.pool)
        .await
        .map_err(database_error)?;
        Ok(rows.into_iter().map(DownloadEvent::from).collect())
    }
}
