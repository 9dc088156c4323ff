use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::{BlobStore, ExpiryStorage, StorageError};

pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Retires expired records so their public codes can be issued again.
///
/// Bytes are removed before the row. A crash between the two steps leaves an
/// orphaned blob, never a record pointing at missing bytes.
pub struct ExpiryReaper {
    records: Arc<dyn ExpiryStorage>,
    blobs: Arc<dyn BlobStore>,
}

impl ExpiryReaper {
    #[must_use]
    pub fn new(records: Arc<dyn ExpiryStorage>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { records, blobs }
    }

    pub async fn sweep(&self) -> Result<usize, StorageError> {
        self.sweep_at(Utc::now()).await
    }

    /// Reaps every record whose expiry is at or before `now`. Returns the number of rows deleted.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let expired = self.records.list_expired(now).await?;
        let mut reaped = 0;
        for file in expired {
            match self.blobs.remove(&file.location).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(file_id = %file.id, location = %file.location, "blob already absent");
                }
                Err(error) => {
                    tracing::warn!(file_id = %file.id, location = %file.location, error = %error, "failed to remove blob of expired file");
                }
            }
            match self.records.delete_file(file.id).await {
                Ok(true) => {
                    reaped += 1;
                    tracing::debug!(file_id = %file.id, code = %file.code, "reaped expired file");
                }
                Ok(false) => {}
                Err(error) => {
                    tracing::error!(file_id = %file.id, error = %error, "failed to delete expired file record");
                }
            }
        }
        Ok(reaped)
    }

    /// Sweeps once immediately, then every `interval` until `shutdown` flips.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        match self.sweep().await {
                            Ok(reaped) => tracing::info!(reaped, "expiry sweep finished"),
                            Err(error) => tracing::error!(error = %error, "expiry sweep failed"),
                        }
                    }
                }
            }
        })
    }
}
