use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::to_bytes;
use axum::response::Response;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use codedrop_auth::{AuthContext, AuthError, TokenValidator};
use codedrop_core::{CodeCodec, DownloadEvent, FileRecord, NewFileRecord, OwnerKey, PublicCode};
use codedrop_realtime::broker::{Connection, Delivery};
use codedrop_storage::{
    blob_location, BlobStore, DownloadReceipt, DownloadStorage, ExpiredFile, ExpiryStorage,
    FileStorage, ObjectStoreBlobStore, StorageError,
};
use futures_util::StreamExt;
use object_store::memory::InMemory;
use object_store::ObjectStore;
use uuid::Uuid;

use crate::ApiState;

pub(crate) const SESSION_A: &str = "3fa85f64-5717-4562-b3fc-2c963f66afa6";
pub(crate) const MULTIPART_BOUNDARY: &str = "codedrop-test-boundary";

/// Accepts the bearer `good-token` as `user-1`.
pub(crate) struct StaticValidator;

#[async_trait]
impl TokenValidator for StaticValidator {
    async fn validate_token(&self, token: &str) -> Result<AuthContext, AuthError> {
        match token {
            "good-token" => Ok(AuthContext {
                user_id: "user-1".to_owned(),
                resolved_by: "static",
            }),
            _ => Err(AuthError::Unauthenticated),
        }
    }
}

#[derive(Default)]
struct MemoryState {
    next_internal_id: i64,
    records: Vec<FileRecord>,
    downloads: Vec<DownloadEvent>,
}

/// In-process storage. While unhealthy every call fails with a database error.
pub(crate) struct MemoryStorage {
    healthy: AtomicBool,
    state: Mutex<MemoryState>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            state: Mutex::new(MemoryState::default()),
        }
    }
}

impl MemoryStorage {
    pub(crate) fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    pub(crate) fn records(&self) -> Vec<FileRecord> {
        self.state.lock().expect("lock state").records.clone()
    }

    pub(crate) fn download_addresses(&self, file_id: Uuid) -> Vec<Option<String>> {
        self.state
            .lock()
            .expect("lock state")
            .downloads
            .iter()
            .filter(|event| event.file_id == file_id)
            .map(|event| event.client_address.clone())
            .collect()
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.healthy.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(StorageError::Database("storage offline".to_owned()))
        }
    }
}

#[async_trait]
impl FileStorage for MemoryStorage {
    async fn ping(&self) -> Result<(), StorageError> {
        self.check()
    }

    async fn insert_file(&self, file: &NewFileRecord) -> Result<FileRecord, StorageError> {
        self.check()?;
        let mut state = self.state.lock().expect("lock state");
        state.next_internal_id += 1;
        let internal_id = state.next_internal_id;
        let record = FileRecord {
            id: file.id,
            internal_id,
            code: CodeCodec::standard()
                .encode(internal_id)
                .map_err(|error| StorageError::InvalidRecord(error.to_string()))?,
            filename: file.filename.clone(),
            location: file.location.clone(),
            size: file.size,
            mime_type: file.mime_type.clone(),
            created_at: file.created_at,
            expires_at: file.expires_at,
            owner: file.owner.clone(),
            download_count: 0,
        };
        state.records.push(record.clone());
        Ok(record)
    }

    async fn find_live_by_code(
        &self,
        code: PublicCode,
        now: DateTime<Utc>,
    ) -> Result<Option<FileRecord>, StorageError> {
        self.check()?;
        let state = self.state.lock().expect("lock state");
        Ok(state
            .records
            .iter()
            .find(|record| record.code == code && !record.is_expired(now))
            .cloned())
    }

    async fn get_file(&self, id: Uuid) -> Result<Option<FileRecord>, StorageError> {
        self.check()?;
        let state = self.state.lock().expect("lock state");
        Ok(state.records.iter().find(|record| record.id == id).cloned())
    }

    async fn list_for_owner(
        &self,
        user_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<Vec<FileRecord>, StorageError> {
        self.check()?;
        let state = self.state.lock().expect("lock state");
        let mut records: Vec<_> = state
            .records
            .iter()
            .filter(|record| match &record.owner {
                OwnerKey::User(owner) => user_id == Some(owner.as_str()),
                OwnerKey::Session(owner) => session_id == Some(owner.as_str()),
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            (b.created_at, b.internal_id).cmp(&(a.created_at, a.internal_id))
        });
        Ok(records)
    }

    async fn migrate_session(&self, session_id: &str, user_id: &str) -> Result<u64, StorageError> {
        self.check()?;
        let mut state = self.state.lock().expect("lock state");
        let mut migrated = 0;
        for record in &mut state.records {
            if record.owner.session_id() == Some(session_id) {
                record.owner = OwnerKey::User(user_id.to_owned());
                migrated += 1;
            }
        }
        Ok(migrated)
    }
}

#[async_trait]
impl DownloadStorage for MemoryStorage {
    async fn record_download(
        &self,
        file_id: Uuid,
        client_address: Option<&str>,
    ) -> Result<DownloadReceipt, StorageError> {
        self.check()?;
        let mut state = self.state.lock().expect("lock state");
        let record = state
            .records
            .iter_mut()
            .find(|record| record.id == file_id)
            .ok_or(StorageError::FileNotFound)?;
        record.download_count += 1;
        let receipt = DownloadReceipt {
            download_count: record.download_count,
            downloaded_at: Utc::now(),
        };
        state.downloads.push(DownloadEvent {
            file_id,
            downloaded_at: receipt.downloaded_at,
            client_address: client_address.map(ToOwned::to_owned),
        });
        Ok(receipt)
    }

    async fn download_history(&self, file_id: Uuid) -> Result<Vec<DownloadEvent>, StorageError> {
        self.check()?;
        let state = self.state.lock().expect("lock state");
        let mut events: Vec<_> = state
            .downloads
            .iter()
            .filter(|event| event.file_id == file_id)
            .cloned()
            .collect();
        events.reverse();
        Ok(events)
    }
}

#[async_trait]
impl ExpiryStorage for MemoryStorage {
    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<ExpiredFile>, StorageError> {
        self.check()?;
        let state = self.state.lock().expect("lock state");
        Ok(state
            .records
            .iter()
            .filter(|record| record.is_expired(now))
            .map(|record| ExpiredFile {
                id: record.id,
                code: record.code,
                location: record.location.clone(),
            })
            .collect())
    }

    async fn delete_file(&self, id: Uuid) -> Result<bool, StorageError> {
        self.check()?;
        let mut state = self.state.lock().expect("lock state");
        let before = state.records.len();
        state.records.retain(|record| record.id != id);
        state.downloads.retain(|event| event.file_id != id);
        Ok(state.records.len() != before)
    }
}

/// Realtime connection that keeps every frame it accepts.
pub(crate) struct RecordingConnection {
    frames: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl RecordingConnection {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn frames(&self) -> Vec<String> {
        self.frames.lock().expect("lock frames").clone()
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

impl Connection for RecordingConnection {
    fn send(&self, frame: Arc<str>) -> Delivery {
        if self.is_closed() {
            return Delivery::Closed;
        }
        self.frames
            .lock()
            .expect("lock frames")
            .push(frame.to_string());
        Delivery::Sent
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

pub(crate) struct TestApp {
    pub(crate) state: ApiState,
    pub(crate) storage: Arc<MemoryStorage>,
    objects: Arc<InMemory>,
}

impl TestApp {
    pub(crate) fn new() -> Self {
        Self::with_state(|state| state)
    }

    pub(crate) fn with_state(configure: impl FnOnce(ApiState) -> ApiState) -> Self {
        let storage = Arc::new(MemoryStorage::default());
        let objects = Arc::new(InMemory::new());
        let blobs = Arc::new(ObjectStoreBlobStore::new(
            Arc::clone(&objects) as Arc<dyn ObjectStore>
        ));
        let state = configure(ApiState::new(
            Arc::clone(&storage) as _,
            blobs,
            Arc::new(StaticValidator),
        ));
        Self {
            state,
            storage,
            objects,
        }
    }

    /// Stores `notes.txt` containing `hello`, expiring `lifetime` from now.
    pub(crate) async fn insert(&self, owner: OwnerKey, lifetime: chrono::Duration) -> FileRecord {
        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let location = blob_location(id, "notes.txt");
        self.state
            .blobs()
            .put(&location, Bytes::from_static(b"hello"))
            .await
            .expect("put blob");
        self.storage
            .insert_file(&NewFileRecord {
                id,
                filename: "notes.txt".to_owned(),
                location,
                size: 5,
                mime_type: "text/plain".to_owned(),
                created_at,
                expires_at: created_at + lifetime,
                owner,
            })
            .await
            .expect("insert record")
    }

    pub(crate) async fn blob_bytes(&self, location: &str) -> Option<Bytes> {
        self.state.blobs().get(location).await.ok()
    }

    pub(crate) async fn blob_count(&self) -> usize {
        self.objects.list(None).count().await
    }
}

pub(crate) fn multipart_body(field: &str, filename: &str, content_type: &str, payload: &[u8]) -> Vec<u8> {
    let mut body = format!(
        "--{MULTIPART_BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(payload);
    body.extend_from_slice(format!("\r\n--{MULTIPART_BOUNDARY}--\r\n").as_bytes());
    body
}

pub(crate) async fn body_json(response: Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("json body")
}
