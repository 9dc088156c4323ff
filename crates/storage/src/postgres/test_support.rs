use chrono::{Duration, Utc};
use codedrop_core::{NewFileRecord, OwnerKey};
use sqlx::postgres::PgPoolOptions;

use super::PostgresStorage;

// Re-export the storage traits so test modules have every method available on PostgresStorage.
#[allow(unused_imports)]
pub(super) use crate::{DownloadStorage, ExpiryStorage, FileStorage, Storage, StorageError};

pub(super) async fn test_storage() -> Option<PostgresStorage> {
    let database_url = match std::env::var("DATABASE_URL") {
        Ok(value) => value,
        Err(_) => return None,
    };

    // Each test gets its own schema, sequence included, so tests can run in parallel.
    let schema = format!("test_{}", uuid::Uuid::new_v4().simple());
    let mut opts: sqlx::postgres::PgConnectOptions =
        database_url.parse().expect("parse DATABASE_URL");
    opts = opts.options([("search_path", schema.as_str())]);
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect_with(opts)
        .await
        .expect("connect test database");
    sqlx::query(&format!("CREATE SCHEMA \"{schema}\""))
        .execute(&pool)
        .await
        .expect("create test schema");

    crate::migrate_with_pool(&pool)
        .await
        .expect("apply migrations");
    Some(PostgresStorage::from_pool(pool))
}

/// A record owned by `owner` that expires `lifetime` from now.
pub(super) fn new_file(owner: OwnerKey, lifetime: Duration) -> NewFileRecord {
    let id = uuid::Uuid::new_v4();
    let now = Utc::now();
    NewFileRecord {
        id,
        filename: "report.pdf".to_owned(),
        location: crate::blob_location(id, "report.pdf"),
        size: 1024,
        mime_type: "application/pdf".to_owned(),
        created_at: now,
        expires_at: now + lifetime,
        owner,
    }
}
