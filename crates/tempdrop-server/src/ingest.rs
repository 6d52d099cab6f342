//! Upload gateway: streams a multipart batch into the content store and
//! registers it only once every file is durably written.

use crate::error::AppError;
use crate::server::SharedState;
use crate::types::{file_views, FileView};
use axum::{
    extract::{multipart::MultipartRejection, Multipart, State},
    http::{header, HeaderMap},
    response::Json,
};
use ephemeral_registry::{ObjectId, ObjectRecord, StoreError};
use futures::TryStreamExt;
use std::io;
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;
use tracing::{debug, error, info, warn};

/// Multipart field carrying uploaded files
pub const FILES_FIELD: &str = "files";

/// Allowance for multipart framing when pre-checking `Content-Length`
const MULTIPART_OVERHEAD: u64 = 64 * 1024;

/// `POST /upload`
pub async fn upload(
    State(state): State<SharedState>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Vec<FileView>>, AppError> {
    if let Some(length) = content_length(&headers) {
        if length > state.max_batch_bytes.saturating_add(MULTIPART_OVERHEAD) {
            warn!(length, limit = state.max_batch_bytes, "Upload rejected before reading body");
            return Err(too_large(state.max_batch_bytes));
        }
    }

    let mut multipart = multipart.map_err(|rejection| AppError::BadRequest(rejection.body_text()))?;

    let mut batch = Vec::new();
    if let Err(e) = receive(&state, &mut multipart, &mut batch).await {
        discard(&state, &batch).await;
        return Err(e);
    }

    if batch.is_empty() {
        return Err(AppError::BadRequest("No files uploaded".to_string()));
    }

    if let Err(e) = state.registry.add(batch.clone()).await {
        discard(&state, &batch).await;
        return Err(match e {
            StoreError::Validation(msg) => AppError::Internal(msg),
            other => AppError::Store(other),
        });
    }

    info!(
        count = batch.len(),
        bytes = batch.iter().map(|r| r.size).sum::<u64>(),
        "Upload batch stored"
    );
    Ok(Json(file_views(&batch)))
}

/// Stream every file field into the content store, pushing a record for
/// each one written. Records are pushed as soon as content exists so the
/// caller can roll the whole batch back.
async fn receive(
    state: &SharedState,
    multipart: &mut Multipart,
    batch: &mut Vec<ObjectRecord>,
) -> Result<(), AppError> {
    let mut used: u64 = 0;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("Invalid multipart body: {}", e)))?
    {
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        if field.name() != Some(FILES_FIELD) {
            debug!(field = ?field.name(), "Ignoring unexpected file field");
            continue;
        }

        let budget = state.max_batch_bytes - used;
        let id = ObjectId::generate();
        let stream = field.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()));
        // One byte past the budget is enough to detect an overrun
        let mut reader = StreamReader::new(Box::pin(stream)).take(budget.saturating_add(1));

        let size = match state.registry.store().write(id.as_str(), &mut reader).await {
            Ok(size) => size,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                return Err(AppError::BadRequest(format!("Invalid multipart body: {}", e)));
            }
            Err(e) => {
                error!(id = %id, error = %e, "Failed to store uploaded file");
                return Err(AppError::Store(StoreError::from(e)));
            }
        };

        batch.push(ObjectRecord::new(id, &file_name, size, state.object_ttl));

        if size > budget {
            warn!(limit = state.max_batch_bytes, "Upload batch exceeded size limit");
            return Err(too_large(state.max_batch_bytes));
        }
        used += size;
    }

    Ok(())
}

/// Delete the content of a batch that will not be registered
async fn discard(state: &SharedState, batch: &[ObjectRecord]) {
    for record in batch {
        if let Err(e) = state.registry.store().delete(&record.content_location).await {
            error!(id = %record.id, error = %e, "Failed to delete content of rejected upload");
        }
    }
    if !batch.is_empty() {
        debug!(count = batch.len(), "Rolled back upload batch");
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

fn too_large(limit: u64) -> AppError {
    AppError::BadRequest(format!(
        "Upload exceeds the batch limit of {} bytes",
        limit
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::create_router;
    use crate::testing::{body_json, test_state, upload_request, BOUNDARY};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use ephemeral_registry::RegistryEvent;
    use tower::ServiceExt;

    const MB: usize = 1024 * 1024;

    async fn assert_nothing_stored(state: &SharedState) {
        assert!(state.registry.list().await.is_empty());
        assert!(state.registry.store().locations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_registers_batch() {
        let (state, _dir) = test_state(MB as u64).await;
        let (_, mut rx) = state.registry.subscribe().await;

        let response = create_router(state.clone())
            .oneshot(upload_request(&[("a.txt", b"alpha"), ("b.png", b"\x89PNG")], true))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let files: Vec<FileView> = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].file_name, "a.txt");
        assert_eq!(files[0].size, 5);
        assert_eq!(files[1].file_name, "b.png");
        assert_eq!(files[1].size, 4);
        assert_eq!(files[0].expires_at - files[0].upload_time, 7_200_000);

        let live = state.registry.list().await;
        assert_eq!(file_views(&live), files);
        assert_eq!(state.registry.store().locations().await.unwrap().len(), 2);

        match rx.try_recv().unwrap() {
            RegistryEvent::Added(records) => assert_eq!(records, live),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_batch_rejected_by_content_length() {
        let (state, _dir) = test_state(4 * MB as u64).await;
        let a = vec![1u8; 2 * MB];
        let b = vec![2u8; 3 * MB];

        let response = create_router(state.clone())
            .oneshot(upload_request(&[("a.bin", &a), ("b.bin", &b)], true))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_nothing_stored(&state).await;
    }

    #[tokio::test]
    async fn test_oversized_batch_rejected_while_streaming() {
        let (state, _dir) = test_state(4 * MB as u64).await;
        let a = vec![1u8; 2 * MB];
        let b = vec![2u8; 3 * MB];

        let response = create_router(state.clone())
            .oneshot(upload_request(&[("a.bin", &a), ("b.bin", &b)], false))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("batch limit"));
        assert_nothing_stored(&state).await;
    }

    #[tokio::test]
    async fn test_batch_exactly_at_limit_is_accepted() {
        let (state, _dir) = test_state(1000).await;
        let a = vec![1u8; 400];
        let b = vec![2u8; 600];

        let response = create_router(state.clone())
            .oneshot(upload_request(&[("a.bin", &a), ("b.bin", &b)], false))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.registry.list().await.len(), 2);
    }

    #[tokio::test]
    async fn test_upload_without_files_is_rejected() {
        let (state, _dir) = test_state(MB as u64).await;

        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nhello\r\n--{b}--\r\n",
            b = BOUNDARY
        );
        let request = Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap();

        let response = create_router(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_nothing_stored(&state).await;
    }

    #[tokio::test]
    async fn test_non_multipart_body_is_rejected() {
        let (state, _dir) = test_state(MB as u64).await;
        let request = Request::builder()
            .method("POST")
            .uri("/upload")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();

        let response = create_router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_upload_name_is_sanitized() {
        let (state, _dir) = test_state(MB as u64).await;

        let response = create_router(state.clone())
            .oneshot(upload_request(&[("../../etc/passwd", b"root")], true))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let live = state.registry.list().await;
        assert_eq!(live[0].display_name, "passwd");
        assert_eq!(live[0].content_location, live[0].id.as_str());
    }

    #[tokio::test]
    async fn test_ledger_failure_discards_content() {
        let (state, dir) = test_state(MB as u64).await;
        // A non-empty directory where the ledger lives makes every persist fail
        let ledger = dir.path().join("uploads.json");
        let _ = std::fs::remove_file(&ledger);
        std::fs::create_dir_all(ledger.join("occupied")).unwrap();

        let response = create_router(state.clone())
            .oneshot(upload_request(&[("a.txt", b"alpha")], true))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_nothing_stored(&state).await;
    }
}
