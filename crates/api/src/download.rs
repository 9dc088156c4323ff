use axum::extract::{Extension, Path, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use codedrop_core::protocol::{DownloadMetadataResponse, FileDownloadedData, EVENT_FILE_DOWNLOADED};
use codedrop_core::record::DEFAULT_MIME_TYPE;
use codedrop_core::{FileRecord, PublicCode};
use codedrop_storage::{BlobStore, BlobStoreError, DownloadStorage, FileStorage, StorageError};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::ratelimit::ClientAddress;
use crate::{ApiState, HttpFailure};

/// Characters left unescaped in filename parameters: alphanumerics and `-_.!~*'()`.
const FILENAME_ESCAPES: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

fn not_found() -> HttpFailure {
    HttpFailure::new(StatusCode::NOT_FOUND, "File not found or expired")
}

async fn live_file(state: &ApiState, raw_code: &str) -> Result<FileRecord, HttpFailure> {
    let code = PublicCode::parse(raw_code).map_err(|_| not_found())?;
    state
        .storage()
        .find_live_by_code(code, Utc::now())
        .await
        .map_err(|error| {
            tracing::error!(code = %code, error = %error, "failed to look up file by code");
            HttpFailure::internal()
        })?
        .ok_or_else(not_found)
}

pub(crate) async fn download_metadata(
    State(state): State<ApiState>,
    Path(code): Path<String>,
) -> Result<Json<DownloadMetadataResponse>, HttpFailure> {
    let record = live_file(&state, &code).await?;
    Ok(Json(DownloadMetadataResponse {
        filename: record.filename,
        file_size: record.size,
        mime_type: record.mime_type,
    }))
}

/// Streams the file, counts the download and tells the owner's live connections.
pub(crate) async fn download_file(
    State(state): State<ApiState>,
    Path(code): Path<String>,
    client: Option<Extension<ClientAddress>>,
) -> Result<Response, HttpFailure> {
    let record = live_file(&state, &code).await?;

    let payload = match state.blobs().get(&record.location).await {
        Ok(payload) => payload,
        Err(BlobStoreError::NotFound) => {
            tracing::warn!(file_id = %record.id, location = %record.location, "file bytes missing");
            return Err(HttpFailure::new(StatusCode::NOT_FOUND, "File data not found"));
        }
        Err(error) => {
            tracing::error!(file_id = %record.id, error = %error, "failed to read file bytes");
            return Err(HttpFailure::internal());
        }
    };

    let client_address = client.and_then(|Extension(ClientAddress(address))| address);
    let receipt = match state
        .storage()
        .record_download(record.id, client_address.as_deref())
        .await
    {
        Ok(receipt) => receipt,
        // Reaped between lookup and count.
        Err(StorageError::FileNotFound) => return Err(not_found()),
        Err(error) => {
            tracing::error!(file_id = %record.id, error = %error, "failed to record download");
            return Err(HttpFailure::internal());
        }
    };

    let delivered = state.registry().notify(
        &record.owner,
        EVENT_FILE_DOWNLOADED,
        &FileDownloadedData {
            file_id: record.id,
            filename: record.filename.clone(),
            downloaded_at: receipt.downloaded_at,
            new_download_count: receipt.download_count,
        },
    );
    tracing::info!(
        file_id = %record.id,
        code = %record.code,
        download_count = receipt.download_count,
        notified = delivered,
        "file downloaded"
    );

    let content_type = HeaderValue::from_str(&record.mime_type)
        .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_MIME_TYPE));
    Ok((
        [
            (CONTENT_TYPE, content_type),
            (CONTENT_DISPOSITION, content_disposition(&record.filename)),
            (CONTENT_LENGTH, HeaderValue::from(payload.len())),
        ],
        payload,
    )
        .into_response())
}

fn content_disposition(filename: &str) -> HeaderValue {
    let encoded = utf8_percent_encode(filename, FILENAME_ESCAPES).to_string();
    HeaderValue::from_str(&format!(
        "attachment; filename=\"{encoded}\"; filename*=UTF-8''{encoded}"
    ))
    .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::Duration;
    use codedrop_core::OwnerKey;
    use codedrop_realtime::broker::{Connection, Delivery};
    use codedrop_storage::FileStorage as _;
    use tower::ServiceExt;

    use super::*;
    use crate::router;
    use crate::test_support::{body_json, RecordingConnection, TestApp, SESSION_A};
    use crate::{FixedWindowLimiter, RateLimitConfig};

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).expect("request")
    }

    fn post(uri: &str, forwarded_for: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("x-forwarded-for", forwarded_for)
            .body(Body::empty())
            .expect("request")
    }

    #[test]
    fn content_disposition_escapes_filename() {
        assert_eq!(
            content_disposition("report final.pdf"),
            "attachment; filename=\"report%20final.pdf\"; filename*=UTF-8''report%20final.pdf"
        );
        assert_eq!(
            content_disposition("naïve \"quote\".txt"),
            "attachment; filename=\"na%C3%AFve%20%22quote%22.txt\"; filename*=UTF-8''na%C3%AFve%20%22quote%22.txt"
        );
    }

    #[tokio::test]
    async fn metadata_describes_live_files_only() {
        let app = TestApp::new();
        let live = app
            .insert(OwnerKey::Session(SESSION_A.to_owned()), Duration::days(1))
            .await;
        let expired = app
            .insert(OwnerKey::Session(SESSION_A.to_owned()), -Duration::seconds(1))
            .await;

        let response = router(app.state.clone())
            .oneshot(get(&format!("/api/download/{}", live.code)))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["filename"], live.filename);
        assert_eq!(body["fileSize"], live.size);
        assert_eq!(body["mimeType"], live.mime_type);

        for code in [expired.code.to_string(), "12345".to_owned(), "abcdef".to_owned()] {
            let response = router(app.state.clone())
                .oneshot(get(&format!("/api/download/{code}")))
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "code {code}");
            assert_eq!(body_json(response).await["error"], "File not found or expired");
        }
    }

    #[tokio::test]
    async fn download_streams_bytes_counts_and_notifies_owner() {
        let app = TestApp::new();
        let owner = OwnerKey::Session(SESSION_A.to_owned());
        let record = app.insert(owner.clone(), Duration::days(1)).await;
        let connection = RecordingConnection::new();
        app.state
            .registry()
            .register(owner, Arc::clone(&connection) as Arc<dyn Connection>)
            .expect("register");

        let response = router(app.state.clone())
            .oneshot(post(&format!("/api/download/{}", record.code), "198.51.100.7"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers().clone();
        assert_eq!(headers[CONTENT_TYPE], "text/plain");
        assert_eq!(headers[CONTENT_LENGTH], "5");
        assert!(headers[CONTENT_DISPOSITION]
            .to_str()
            .expect("ascii")
            .starts_with("attachment;"));
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        assert_eq!(&bytes[..], b"hello");

        let stored = app
            .storage
            .get_file(record.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(stored.download_count, 1);
        assert_eq!(
            app.storage.download_addresses(record.id),
            vec![Some("198.51.100.7".to_owned())]
        );

        let frames = connection.frames();
        assert_eq!(frames.len(), 1);
        let event: serde_json::Value = serde_json::from_str(&frames[0]).expect("json frame");
        assert_eq!(event["event"], "file:downloaded");
        assert_eq!(event["data"]["fileId"], record.id.to_string());
        assert_eq!(event["data"]["newDownloadCount"], 1);
    }

    #[tokio::test]
    async fn missing_bytes_leave_counter_untouched() {
        let app = TestApp::new();
        let record = app
            .insert(OwnerKey::Session(SESSION_A.to_owned()), Duration::days(1))
            .await;
        app.state
            .blobs()
            .remove(&record.location)
            .await
            .expect("remove blob");

        let response = router(app.state.clone())
            .oneshot(post(&format!("/api/download/{}", record.code), "198.51.100.7"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"], "File data not found");
        let stored = app
            .storage
            .get_file(record.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(stored.download_count, 0);
    }

    #[tokio::test]
    async fn downloads_are_rate_limited_per_client() {
        let app = TestApp::with_state(|state| {
            state.with_rate_limiter(Arc::new(FixedWindowLimiter::new(RateLimitConfig {
                window: std::time::Duration::from_secs(60),
                max_requests: 2,
            })))
        });
        let record = app
            .insert(OwnerKey::Session(SESSION_A.to_owned()), Duration::days(1))
            .await;
        let uri = format!("/api/download/{}", record.code);

        for _ in 0..2 {
            let response = router(app.state.clone())
                .oneshot(post(&uri, "203.0.113.1"))
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = router(app.state.clone())
            .oneshot(post(&uri, "203.0.113.1"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("retry-after"));
        assert_eq!(
            body_json(response).await["error"],
            "Too many requests. Please try again later."
        );

        let response = router(app.state.clone())
            .oneshot(post(&uri, "203.0.113.2"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let response = router(app.state.clone())
            .oneshot(get(&uri))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK, "metadata is not limited");
    }

    #[tokio::test]
    async fn closed_connections_are_skipped() {
        let app = TestApp::new();
        let owner = OwnerKey::Session(SESSION_A.to_owned());
        let record = app.insert(owner.clone(), Duration::days(1)).await;
        let connection = RecordingConnection::new();
        connection.close();
        app.state
            .registry()
            .register(owner.clone(), Arc::clone(&connection) as Arc<dyn Connection>)
            .expect("register");

        let response = router(app.state.clone())
            .oneshot(post(&format!("/api/download/{}", record.code), "198.51.100.7"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(connection.frames().is_empty());
        assert_eq!(connection.send(Arc::from("x")), Delivery::Closed);
        assert!(!app.state.registry().contains_owner(&owner));
    }
}
