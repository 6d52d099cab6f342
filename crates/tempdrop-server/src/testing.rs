//! Shared helpers for router tests

use crate::config::Config;
use crate::server::{ServerState, SharedState};
use axum::body::Body;
use axum::http::{header, Request, Response};
use ephemeral_registry::{Broadcaster, FsContentStore, Ledger, Registry, RetryPolicy};
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

pub const BOUNDARY: &str = "tempdrop-test-boundary";

/// Fresh registry in a temp directory with the given batch ceiling
pub async fn test_state(max_batch_bytes: u64) -> (SharedState, TempDir) {
    let dir = tempdir().unwrap();
    let state = state_in(&dir, max_batch_bytes).await;
    (state, dir)
}

/// Open (or reopen) the registry stored in `dir`
pub async fn state_in(dir: &TempDir, max_batch_bytes: u64) -> SharedState {
    let config = Config {
        upload_dir: dir.path().join("uploads"),
        ledger_path: dir.path().join("uploads.json"),
        max_batch_bytes,
        ..Config::default()
    };

    let store = FsContentStore::new(&config.upload_dir);
    store.init().await.unwrap();
    let registry = Registry::open(
        Ledger::new(&config.ledger_path),
        Arc::new(store),
        Broadcaster::new(config.event_buffer),
        RetryPolicy::default(),
    )
    .await
    .unwrap();

    Arc::new(ServerState::new(Arc::new(registry), &config))
}

/// Multipart body with one `files` part per entry
pub fn multipart_body(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, content) in files {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"files\"; filename=\"{}\"\r\n",
                name
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(content);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

/// `POST /upload` request, optionally without a `Content-Length` header
pub fn upload_request(files: &[(&str, &[u8])], with_length: bool) -> Request<Body> {
    let body = multipart_body(files);
    let mut builder = Request::builder()
        .method("POST")
        .uri("/upload")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        );
    if with_length {
        builder = builder.header(header::CONTENT_LENGTH, body.len());
    }
    builder.body(Body::from(body)).unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}
