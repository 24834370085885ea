#![cfg(feature = "server")]

use blobpart::client::{ChunkUploader, HttpMultipartClient, MultipartApi, UploadOptions};
use blobpart::storage::{
  AdapterRegistry, CreateOptions, ErrorKind, LocalMultipartStorage, MultipartServer,
  StorageErrorCode, UploadCoordinator,
};
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

const TOKEN: &str = "test-token";

struct TestServer {
  _dir: TempDir,
  root: PathBuf,
  server: MultipartServer,
  endpoint: String,
}

async fn start_server(max_part_size: u64) -> TestServer {
  let dir = TempDir::new().unwrap();
  let storage = LocalMultipartStorage::new(dir.path());
  storage.init().await.unwrap();

  let registry = AdapterRegistry::new().with("fs", Arc::new(storage));
  let coordinator = UploadCoordinator::new(registry, "fs").unwrap();
  let server = MultipartServer::new(coordinator, max_part_size, Some(TOKEN.to_string()));
  let addr = server.start("127.0.0.1:0").await.unwrap();

  TestServer {
    root: dir.path().to_path_buf(),
    _dir: dir,
    server,
    endpoint: format!("http://{}", addr),
  }
}

fn client(server: &TestServer) -> HttpMultipartClient {
  HttpMultipartClient::new(&server.endpoint).with_token(TOKEN)
}

// =============================================================================
// End-to-End Tests
// =============================================================================

#[tokio::test]
async fn test_chunked_upload_over_http() {
  let server = start_server(1024 * 1024).await;
  let data: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();

  let uploader = ChunkUploader::new(
    Arc::new(client(&server)),
    UploadOptions {
      part_size: 128 * 1024,
      concurrency: 2,
      max_retry: 3,
    },
  );
  let object = uploader
    .upload(
      &Bytes::from(data.clone()),
      "videos/my clip.bin",
      CreateOptions::default().with_metadata("owner", "alice"),
      |_| {},
    )
    .await
    .unwrap();

  assert_eq!(object.pathname, "videos/my clip.bin");
  assert_eq!(object.size, 300_000);
  assert!(object.etag.ends_with("-3"));
  assert_eq!(object.custom_metadata.get("owner").map(String::as_str), Some("alice"));

  let written = std::fs::read(server.root.join("videos/my clip.bin")).unwrap();
  assert_eq!(written, data);

  server.server.stop().await.unwrap();
}

#[tokio::test]
async fn test_protocol_verbs_over_http() {
  let server = start_server(1024 * 1024).await;
  let api = client(&server);

  let session = api
    .create(
      "notes.txt",
      CreateOptions::default().with_content_type("text/plain"),
    )
    .await
    .unwrap();
  assert_eq!(session.pathname, "notes.txt");

  let part = api
    .upload_part("notes.txt", &session.upload_id, 1, Bytes::from_static(b"hi"))
    .await
    .unwrap();
  assert_eq!(part.part_number, 1);

  let object = api
    .complete("notes.txt", &session.upload_id, vec![part])
    .await
    .unwrap();
  assert_eq!(object.content_type, "text/plain");
  assert_eq!(object.size, 2);
}

// =============================================================================
// Error Mapping Tests
// =============================================================================

#[tokio::test]
async fn test_unknown_session_maps_to_not_found() {
  let server = start_server(1024 * 1024).await;

  let err = client(&server)
    .upload_part(
      "ghost.bin",
      "6f2b9a0e-8d1c-4c3e-9a57-1f0e2d3c4b5a",
      1,
      Bytes::from_static(b"x"),
    )
    .await
    .unwrap_err();

  assert_eq!(err.code, StorageErrorCode::NoSuchUpload);
  assert_eq!(err.kind(), ErrorKind::NotFound);
  assert_eq!(err.backend.as_deref(), Some("fs"));
}

#[tokio::test]
async fn test_missing_token_rejected() {
  let server = start_server(1024 * 1024).await;

  let err = HttpMultipartClient::new(&server.endpoint)
    .create("a.txt", CreateOptions::default())
    .await
    .unwrap_err();
  assert_eq!(err.code, StorageErrorCode::AccessDenied);

  let err = HttpMultipartClient::new(&server.endpoint)
    .with_token("wrong")
    .create("a.txt", CreateOptions::default())
    .await
    .unwrap_err();
  assert_eq!(err.code, StorageErrorCode::AccessDenied);
}

#[tokio::test]
async fn test_unknown_backend_query_param() {
  let server = start_server(1024 * 1024).await;

  let err = client(&server)
    .with_backend("gcs")
    .create("a.txt", CreateOptions::default())
    .await
    .unwrap_err();
  assert_eq!(err.code, StorageErrorCode::InvalidArgument);

  let session = client(&server)
    .with_backend("fs")
    .create("a.txt", CreateOptions::default())
    .await
    .unwrap();
  assert!(!session.upload_id.is_empty());
}

#[tokio::test]
async fn test_oversized_part_rejected() {
  let server = start_server(64).await;
  let api = client(&server);

  let session = api
    .create("big.bin", CreateOptions::default())
    .await
    .unwrap();
  let err = api
    .upload_part(
      "big.bin",
      &session.upload_id,
      1,
      Bytes::from(vec![0u8; 100]),
    )
    .await
    .unwrap_err();
  assert_eq!(err.code, StorageErrorCode::EntityTooLarge);
}

#[tokio::test]
async fn test_invalid_part_number_over_http() {
  let server = start_server(1024 * 1024).await;
  let session = client(&server)
    .create("n.bin", CreateOptions::default())
    .await
    .unwrap();

  let response = reqwest::Client::new()
    .put(format!("{}/multipart/upload/n.bin", server.endpoint))
    .bearer_auth(TOKEN)
    .query(&[("uploadId", session.upload_id.as_str()), ("partNumber", "0")])
    .body("x")
    .send()
    .await
    .unwrap();

  assert_eq!(response.status().as_u16(), 400);
  let body: serde_json::Value = response.json().await.unwrap();
  assert_eq!(body["code"], "InvalidPartNumber");
}

// =============================================================================
// Abort Tests
// =============================================================================

#[tokio::test]
async fn test_abort_returns_no_content() {
  let server = start_server(1024 * 1024).await;
  let session = client(&server)
    .create("gone.bin", CreateOptions::default())
    .await
    .unwrap();

  for _ in 0..2 {
    let response = reqwest::Client::new()
      .delete(format!("{}/multipart/abort/gone.bin", server.endpoint))
      .bearer_auth(TOKEN)
      .query(&[("uploadId", session.upload_id.as_str())])
      .send()
      .await
      .unwrap();
    assert_eq!(response.status().as_u16(), 204);
  }

  assert!(!server.root.join("gone.bin$").exists());
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_server_stop() {
  let server = start_server(1024).await;
  assert!(server.server.is_running());
  assert!(server.server.local_addr().is_some());

  server.server.stop().await.unwrap();
  assert!(!server.server.is_running());

  let err = client(&server)
    .create("late.txt", CreateOptions::default())
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Backend);
}
