use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const EVENT_CONNECTED: &str = "connected";
pub const EVENT_FILE_DOWNLOADED: &str = "file:downloaded";

/// Close code sent when an owner already holds the maximum number of sockets.
pub const CLOSE_TOO_MANY_CONNECTIONS: u16 = 4003;

/// Realtime frame sent to a connection: `{"event": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    pub event: String,
    pub data: T,
}

impl<T: Serialize> EventEnvelope<T> {
    pub fn new(event: impl Into<String>, data: T) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedData {
    #[serde(rename = "ownerKey")]
    pub owner_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDownloadedData {
    #[serde(rename = "fileId")]
    pub file_id: Uuid,
    pub filename: String,
    #[serde(rename = "downloadedAt")]
    pub downloaded_at: DateTime<Utc>,
    #[serde(rename = "newDownloadCount")]
    pub new_download_count: i64,
}
