//! File bytes, kept in an [`ObjectStore`] under an opaque location string.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use uuid::Uuid;

const MAX_EXTENSION_LENGTH: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum BlobStoreError {
    #[error("blob not found")]
    NotFound,
    #[error("invalid blob location: {0}")]
    InvalidLocation(String),
    #[error("object store error: {0}")]
    Backend(#[from] object_store::Error),
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, location: &str, payload: Bytes) -> Result<(), BlobStoreError>;
    async fn get(&self, location: &str) -> Result<Bytes, BlobStoreError>;
    /// Removes the blob. Returns false when nothing was stored at `location`.
    async fn remove(&self, location: &str) -> Result<bool, BlobStoreError>;
}

pub struct ObjectStoreBlobStore {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreBlobStore {
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn local_filesystem(path: &std::path::Path) -> Result<Self, object_store::Error> {
        let local = LocalFileSystem::new_with_prefix(path)?;
        Ok(Self {
            store: Arc::new(local),
        })
    }
}

fn object_path(location: &str) -> Result<ObjectPath, BlobStoreError> {
    ObjectPath::parse(location)
        .map_err(|error| BlobStoreError::InvalidLocation(format!("{location}: {error}")))
}

fn map_not_found(error: object_store::Error) -> BlobStoreError {
    if matches!(error, object_store::Error::NotFound { .. }) {
        BlobStoreError::NotFound
    } else {
        BlobStoreError::Backend(error)
    }
}

#[async_trait]
impl BlobStore for ObjectStoreBlobStore {
    async fn put(&self, location: &str, payload: Bytes) -> Result<(), BlobStoreError> {
        let path = object_path(location)?;
        self.store.put(&path, PutPayload::from(payload)).await?;
        Ok(())
    }

    async fn get(&self, location: &str) -> Result<Bytes, BlobStoreError> {
        let path = object_path(location)?;
        let result = self.store.get(&path).await.map_err(map_not_found)?;
        result.bytes().await.map_err(map_not_found)
    }

    async fn remove(&self, location: &str) -> Result<bool, BlobStoreError> {
        let path = object_path(location)?;
        match self.store.delete(&path).await.map_err(map_not_found) {
            Ok(()) => Ok(true),
            Err(BlobStoreError::NotFound) => Ok(false),
            Err(error) => Err(error),
        }
    }
}

/// Location for the bytes of file `id`: a two-character fan-out directory,
/// then the identifier with the original extension.
#[must_use]
pub fn blob_location(id: Uuid, filename: &str) -> String {
    let id = id.to_string();
    format!("{}/{id}{}", &id[..2], extension(filename))
}

fn extension(filename: &str) -> String {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let Some((stem, ext)) = name.rsplit_once('.') else {
        return String::new();
    };
    if stem.is_empty()
        || ext.is_empty()
        || ext.len() > MAX_EXTENSION_LENGTH
        || !ext.bytes().all(|byte| byte.is_ascii_alphanumeric())
    {
        return String::new();
    }
    format!(".{}", ext.to_ascii_lowercase())
}
