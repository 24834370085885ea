use blobpart::storage::{
  calculate_etag, CreateOptions, ErrorKind, LocalMultipartStorage, MultipartBackend,
  MultipartUpload, SessionSidecar, StorageErrorCode, UploadedPart,
};
use bytes::Bytes;
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

async fn storage() -> (TempDir, LocalMultipartStorage) {
  let dir = TempDir::new().unwrap();
  let storage = LocalMultipartStorage::new(dir.path());
  storage.init().await.unwrap();
  (dir, storage)
}

fn upload_uuid(upload_id: &str) -> Uuid {
  Uuid::parse_str(upload_id).unwrap()
}

fn read_sidecar(storage: &LocalMultipartStorage, pathname: &str) -> SessionSidecar {
  let raw = std::fs::read(storage.sidecar_path(pathname)).unwrap();
  serde_json::from_slice(&raw).unwrap()
}

// =============================================================================
// Round Trip Tests
// =============================================================================

#[tokio::test]
async fn test_round_trip_out_of_order() {
  let (_dir, storage) = storage().await;
  let upload = storage
    .create("videos/clip.bin", CreateOptions::default())
    .await
    .unwrap();

  let chunks: Vec<Vec<u8>> = vec![vec![b'a'; 1000], vec![b'b'; 1000], vec![b'c'; 10]];

  let mut parts = Vec::new();
  for n in [3u32, 1, 2] {
    let data = Bytes::from(chunks[n as usize - 1].clone());
    parts.push(upload.upload_part(n, data).await.unwrap());
  }

  let object = upload.complete(parts).await.unwrap();

  let expected: Vec<u8> = chunks.concat();
  let written = std::fs::read(storage.object_path("videos/clip.bin")).unwrap();
  assert_eq!(written, expected);
  assert_eq!(object.size, 2010);
  assert_eq!(object.pathname, "videos/clip.bin");
  assert_eq!(object.content_type, "application/octet-stream");
  assert!(object.etag.ends_with("-3"));

  // Session artifacts are gone
  assert!(!storage.sidecar_path("videos/clip.bin").exists());
  assert!(!storage.upload_dir(&upload_uuid(upload.upload_id())).exists());
}

#[tokio::test]
async fn test_complete_carries_create_options() {
  let (_dir, storage) = storage().await;
  let options = CreateOptions::default()
    .with_content_type("video/mp4")
    .with_metadata("owner", "alice");
  let upload = storage.create("movie.mp4", options).await.unwrap();

  let part = upload
    .upload_part(1, Bytes::from_static(b"frames"))
    .await
    .unwrap();
  let object = upload.complete(vec![part]).await.unwrap();

  assert_eq!(object.content_type, "video/mp4");
  assert_eq!(object.custom_metadata.get("owner").unwrap(), "alice");
}

#[tokio::test]
async fn test_single_empty_part_produces_empty_object() {
  let (_dir, storage) = storage().await;
  let upload = storage
    .create("empty.txt", CreateOptions::default())
    .await
    .unwrap();

  let part = upload.upload_part(1, Bytes::new()).await.unwrap();
  assert_eq!(part.etag, calculate_etag(b""));

  let object = upload.complete(vec![part]).await.unwrap();
  assert_eq!(object.size, 0);
  assert_eq!(
    std::fs::read(storage.object_path("empty.txt")).unwrap(),
    Vec::<u8>::new()
  );
}

// =============================================================================
// Completion Validation Tests
// =============================================================================

#[tokio::test]
async fn test_gap_is_rejected_and_nothing_materialised() {
  let (_dir, storage) = storage().await;
  let upload = storage
    .create("gap.bin", CreateOptions::default())
    .await
    .unwrap();

  let mut parts = Vec::new();
  for n in [1u32, 2, 4] {
    parts.push(
      upload
        .upload_part(n, Bytes::from(vec![n as u8; 16]))
        .await
        .unwrap(),
    );
  }

  let err = upload.complete(parts).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Completion);
  assert!(err.message.contains("Part 3"));
  assert!(!storage.object_path("gap.bin").exists());

  // The session survives a rejected completion
  assert!(storage.resume("gap.bin", upload.upload_id()).await.is_ok());
}

#[tokio::test]
async fn test_empty_parts_list_is_validation_error() {
  let (_dir, storage) = storage().await;
  let upload = storage
    .create("none.bin", CreateOptions::default())
    .await
    .unwrap();

  let err = upload.complete(Vec::new()).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_part_never_uploaded_is_rejected() {
  let (_dir, storage) = storage().await;
  let upload = storage
    .create("missing.bin", CreateOptions::default())
    .await
    .unwrap();
  let first = upload
    .upload_part(1, Bytes::from_static(b"one"))
    .await
    .unwrap();

  let phantom = UploadedPart {
    part_number: 2,
    etag: calculate_etag(b"two"),
  };
  let err = upload.complete(vec![first, phantom]).await.unwrap_err();
  assert_eq!(err.code, StorageErrorCode::InvalidPart);
}

#[tokio::test]
async fn test_tampered_part_file_fails_digest_check() {
  let (_dir, storage) = storage().await;
  let upload = storage
    .create("tamper.bin", CreateOptions::default())
    .await
    .unwrap();
  let part = upload
    .upload_part(1, Bytes::from_static(b"original"))
    .await
    .unwrap();

  let part_file = storage
    .upload_dir(&upload_uuid(upload.upload_id()))
    .join("00001");
  std::fs::write(&part_file, b"modified").unwrap();

  let err = upload.complete(vec![part]).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Completion);
  assert!(!storage.object_path("tamper.bin").exists());
}

#[tokio::test]
async fn test_completed_session_is_terminal() {
  let (_dir, storage) = storage().await;
  let upload = storage
    .create("once.bin", CreateOptions::default())
    .await
    .unwrap();
  let part = upload
    .upload_part(1, Bytes::from_static(b"data"))
    .await
    .unwrap();
  upload.complete(vec![part.clone()]).await.unwrap();

  let err = upload.complete(vec![part]).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::NotFound);

  let err = storage
    .resume("once.bin", upload.upload_id())
    .await
    .err()
    .unwrap();
  assert_eq!(err.code, StorageErrorCode::NoSuchUpload);
}

// =============================================================================
// Part Upload Tests
// =============================================================================

#[tokio::test]
async fn test_reupload_overwrites_part() {
  let (_dir, storage) = storage().await;
  let upload = storage
    .create("retry.bin", CreateOptions::default())
    .await
    .unwrap();

  let p1 = upload
    .upload_part(1, Bytes::from_static(b"head-"))
    .await
    .unwrap();
  let stale = upload
    .upload_part(2, Bytes::from_static(b"first"))
    .await
    .unwrap();
  let fresh = upload
    .upload_part(2, Bytes::from_static(b"second"))
    .await
    .unwrap();
  assert_ne!(stale.etag, fresh.etag);

  let sidecar = read_sidecar(&storage, "retry.bin");
  assert_eq!(sidecar.parts.len(), 2);
  assert_eq!(sidecar.etag_of(2), Some(fresh.etag.as_str()));

  // The stale etag no longer matches the recorded part
  let err = upload
    .complete(vec![p1.clone(), stale])
    .await
    .unwrap_err();
  assert_eq!(err.code, StorageErrorCode::InvalidPart);

  upload.complete(vec![p1, fresh]).await.unwrap();
  assert_eq!(
    std::fs::read(storage.object_path("retry.bin")).unwrap(),
    b"head-second"
  );
}

#[tokio::test]
async fn test_invalid_part_numbers_rejected() {
  let (_dir, storage) = storage().await;
  let upload = storage
    .create("n.bin", CreateOptions::default())
    .await
    .unwrap();

  let err = upload.upload_part(0, Bytes::new()).await.unwrap_err();
  assert_eq!(err.code, StorageErrorCode::InvalidPartNumber);
  assert!(!err.is_retryable());

  let err = upload.upload_part(10_001, Bytes::new()).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_unknown_upload_ids_are_not_found() {
  let (_dir, storage) = storage().await;
  storage
    .create("known.bin", CreateOptions::default())
    .await
    .unwrap();

  for id in [Uuid::new_v4().to_string(), "not-a-uuid".to_string()] {
    let err = storage.resume("known.bin", &id).await.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = storage
      .write_part("known.bin", &id, 1, b"x")
      .await
      .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
  }

  let err = storage
    .resume("never-created.bin", &Uuid::new_v4().to_string())
    .await
    .err()
    .unwrap();
  assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_nested_pathname_sidecar_layout() {
  let (_dir, storage) = storage().await;
  let upload = storage
    .create("a/b/c/deep.bin", CreateOptions::default())
    .await
    .unwrap();
  upload
    .upload_part(7, Bytes::from_static(b"seven"))
    .await
    .unwrap();

  let sidecar = read_sidecar(&storage, "a/b/c/deep.bin");
  assert_eq!(sidecar.pathname, "a/b/c/deep.bin");
  assert_eq!(sidecar.upload_id, upload.upload_id());
  assert_eq!(sidecar.parts, vec![(7, calculate_etag(b"seven"))]);

  let part_file = storage
    .upload_dir(&upload_uuid(upload.upload_id()))
    .join("00007");
  assert_eq!(std::fs::read(part_file).unwrap(), b"seven");
}

// =============================================================================
// Abort Tests
// =============================================================================

#[tokio::test]
async fn test_abort_removes_every_artifact() {
  let (_dir, storage) = storage().await;
  let upload = storage
    .create("abort.bin", CreateOptions::default())
    .await
    .unwrap();
  upload
    .upload_part(1, Bytes::from_static(b"one"))
    .await
    .unwrap();
  upload
    .upload_part(2, Bytes::from_static(b"two"))
    .await
    .unwrap();

  upload.abort().await.unwrap();

  assert!(!storage.upload_dir(&upload_uuid(upload.upload_id())).exists());
  assert!(!storage.sidecar_path("abort.bin").exists());
  assert!(!storage.object_path("abort.bin").exists());

  let err = storage
    .resume("abort.bin", upload.upload_id())
    .await
    .err()
    .unwrap();
  assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_abort_is_idempotent() {
  let (_dir, storage) = storage().await;
  let upload = storage
    .create("twice.bin", CreateOptions::default())
    .await
    .unwrap();

  upload.abort().await.unwrap();
  upload.abort().await.unwrap();

  // Unknown and malformed ids are no-ops as well
  MultipartBackend::abort(&storage, "twice.bin", &Uuid::new_v4().to_string())
    .await
    .unwrap();
  MultipartBackend::abort(&storage, "twice.bin", "garbage")
    .await
    .unwrap();
}

#[tokio::test]
async fn test_part_after_abort_is_rejected_and_not_left_behind() {
  let (_dir, storage) = storage().await;
  let upload = storage
    .create("late.bin", CreateOptions::default())
    .await
    .unwrap();
  upload.abort().await.unwrap();

  let err = upload
    .upload_part(1, Bytes::from_static(b"late"))
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::NotFound);
  assert!(!storage.upload_dir(&upload_uuid(upload.upload_id())).exists());
}

#[tokio::test]
async fn test_abort_of_old_session_keeps_newer_sidecar() {
  let (_dir, storage) = storage().await;
  let old = storage
    .create("shared.bin", CreateOptions::default())
    .await
    .unwrap();
  let new = storage
    .create("shared.bin", CreateOptions::default())
    .await
    .unwrap();

  old.abort().await.unwrap();

  let sidecar = read_sidecar(&storage, "shared.bin");
  assert_eq!(sidecar.upload_id, new.upload_id());
}

// =============================================================================
// Session Supersession Tests
// =============================================================================

#[tokio::test]
async fn test_create_supersedes_previous_session() {
  let (_dir, storage) = storage().await;
  let first = storage
    .create("doc.pdf", CreateOptions::default())
    .await
    .unwrap();
  first
    .upload_part(1, Bytes::from_static(b"draft"))
    .await
    .unwrap();

  let second = storage
    .create("doc.pdf", CreateOptions::default())
    .await
    .unwrap();
  assert_ne!(first.upload_id(), second.upload_id());

  assert!(!storage.upload_dir(&upload_uuid(first.upload_id())).exists());
  let err = storage
    .resume("doc.pdf", first.upload_id())
    .await
    .err()
    .unwrap();
  assert_eq!(err.kind(), ErrorKind::NotFound);

  let part = second
    .upload_part(1, Bytes::from_static(b"final"))
    .await
    .unwrap();
  second.complete(vec![part]).await.unwrap();
  assert_eq!(
    std::fs::read(storage.object_path("doc.pdf")).unwrap(),
    b"final"
  );
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_part_uploads_never_lose_sidecar_entries() {
  let (_dir, storage) = storage().await;
  let storage = Arc::new(storage);
  let upload = storage
    .create("concurrent.bin", CreateOptions::default())
    .await
    .unwrap();
  let upload_id = upload.upload_id().to_string();

  let count = 48u32;
  let mut handles = Vec::new();
  for n in 1..=count {
    let storage = storage.clone();
    let upload_id = upload_id.clone();
    handles.push(tokio::spawn(async move {
      let data = vec![n as u8; 512];
      storage
        .write_part("concurrent.bin", &upload_id, n, &data)
        .await
    }));
  }

  let mut parts = Vec::new();
  for handle in handles {
    parts.push(handle.await.unwrap().unwrap());
  }

  let sidecar = read_sidecar(&storage, "concurrent.bin");
  assert_eq!(sidecar.parts.len(), count as usize);
  let numbers: Vec<u32> = sidecar.parts.iter().map(|(n, _)| *n).collect();
  assert_eq!(numbers, (1..=count).collect::<Vec<_>>());

  let object = upload.complete(parts).await.unwrap();
  assert_eq!(object.size, 512 * count as u64);

  let written = std::fs::read(storage.object_path("concurrent.bin")).unwrap();
  for (i, chunk) in written.chunks(512).enumerate() {
    assert!(chunk.iter().all(|b| *b == (i + 1) as u8));
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_writes_of_one_part_keep_etag_and_bytes_in_step() {
  let (_dir, storage) = storage().await;
  let storage = Arc::new(storage);
  let upload = storage
    .create("race.bin", CreateOptions::default())
    .await
    .unwrap();
  let upload_id = upload.upload_id().to_string();
  let part_file = storage
    .upload_dir(&upload_uuid(&upload_id))
    .join("00001");

  for round in 0..16u8 {
    let mut handles = Vec::new();
    for writer in 0..2u8 {
      let storage = storage.clone();
      let upload_id = upload_id.clone();
      handles.push(tokio::spawn(async move {
        let data = vec![round * 2 + writer; 4096];
        storage.write_part("race.bin", &upload_id, 1, &data).await
      }));
    }
    for handle in handles {
      handle.await.unwrap().unwrap();
    }

    let on_disk = std::fs::read(&part_file).unwrap();
    let sidecar = read_sidecar(&storage, "race.bin");
    assert_eq!(sidecar.etag_of(1), Some(calculate_etag(&on_disk).as_str()));
  }

  let sidecar = read_sidecar(&storage, "race.bin");
  let object = upload
    .complete(vec![UploadedPart {
      part_number: 1,
      etag: sidecar.etag_of(1).unwrap().to_string(),
    }])
    .await
    .unwrap();
  assert_eq!(object.size, 4096);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_uploads_on_distinct_pathnames() {
  let (_dir, storage) = storage().await;
  let storage = Arc::new(storage);

  let mut handles = Vec::new();
  for i in 0..8 {
    let storage = storage.clone();
    handles.push(tokio::spawn(async move {
      let pathname = format!("batch/{}.bin", i);
      let upload = storage
        .create(&pathname, CreateOptions::default())
        .await
        .unwrap();
      let a = upload
        .upload_part(2, Bytes::from(format!("{}-tail", i)))
        .await
        .unwrap();
      let b = upload
        .upload_part(1, Bytes::from(format!("{}-head|", i)))
        .await
        .unwrap();
      upload.complete(vec![a, b]).await.unwrap();
      pathname
    }));
  }

  for (i, handle) in handles.into_iter().enumerate() {
    let pathname = handle.await.unwrap();
    assert_eq!(
      std::fs::read_to_string(storage.object_path(&pathname)).unwrap(),
      format!("{}-head|{}-tail", i, i)
    );
  }
}
