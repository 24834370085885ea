use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use super::backend::{
  calculate_etag, calculate_multipart_etag, ordered_parts, MultipartBackend, MultipartUpload,
  StorageResult, MAX_PART_NUMBER,
};
use super::error::StorageError;
use super::types::{
  BlobObject, CreateOptions, SessionSidecar, UploadedPart, DEFAULT_CONTENT_TYPE,
};
use crate::security::{PARTS_DIR, SIDECAR_SUFFIX};

const COPY_BUFFER_SIZE: usize = 64 * 1024;
const STAGING_DIR: &str = "staging";

/// Multipart uploads simulated on a plain directory tree.
///
/// Layout under `base_path`:
///
/// ```text
/// {pathname}                          final object
/// {pathname}$                         session sidecar (JSON)
/// .multipart/{upload_id}/{part:05}    part payloads
/// .multipart/staging/{uuid}           temp files renamed into place
/// ```
///
/// Every sidecar rewrite happens under a per-sidecar async mutex, so concurrent
/// part uploads cannot drop each other's entries. Part payloads are staged outside
/// the mutex and renamed into their slot under it, in the same critical section as
/// the sidecar merge, so the last writer of a part number owns both its file and its
/// recorded etag.
#[derive(Clone)]
pub struct LocalMultipartStorage {
  base_path: PathBuf,
  locks: Arc<SessionLocks>,
}

impl LocalMultipartStorage {
  pub fn new(base_path: impl AsRef<Path>) -> Self {
    Self {
      base_path: base_path.as_ref().to_path_buf(),
      locks: Arc::new(SessionLocks::default()),
    }
  }

  /// Initialize storage directory structure
  pub async fn init(&self) -> StorageResult<()> {
    fs::create_dir_all(&self.base_path).await?;
    fs::create_dir_all(self.staging_dir()).await?;
    Ok(())
  }

  pub fn base_path(&self) -> &Path {
    &self.base_path
  }

  /// Get storage path for a completed object
  pub fn object_path(&self, pathname: &str) -> PathBuf {
    self.base_path.join(pathname)
  }

  /// Get storage path for a session sidecar
  pub fn sidecar_path(&self, pathname: &str) -> PathBuf {
    self
      .base_path
      .join(format!("{}{}", pathname, SIDECAR_SUFFIX))
  }

  /// Get the directory holding an upload's parts
  pub fn upload_dir(&self, upload_id: &Uuid) -> PathBuf {
    self.base_path.join(PARTS_DIR).join(upload_id.to_string())
  }

  /// Get storage path for a multipart part
  fn part_path(&self, upload_id: &Uuid, part_number: u32) -> PathBuf {
    self
      .upload_dir(upload_id)
      .join(format!("{:05}", part_number))
  }

  fn staging_dir(&self) -> PathBuf {
    self.base_path.join(PARTS_DIR).join(STAGING_DIR)
  }

  fn staging_path(&self) -> PathBuf {
    self.staging_dir().join(Uuid::new_v4().to_string())
  }

  /// Write `data` to a fresh staging file and return its path
  async fn stage(&self, data: &[u8]) -> std::io::Result<PathBuf> {
    let staging = self.staging_path();
    let written = async {
      let mut file = File::create(&staging).await?;
      file.write_all(data).await?;
      file.flush().await
    }
    .await;

    match written {
      Ok(()) => Ok(staging),
      Err(e) => {
        let _ = remove_file_if_exists(&staging).await;
        Err(e)
      }
    }
  }

  /// Write `data` to a staging file and rename it onto `path`.
  async fn write_staged(&self, path: &Path, data: &[u8]) -> std::io::Result<()> {
    let staging = self.stage(data).await?;
    if let Err(e) = fs::rename(&staging, path).await {
      let _ = remove_file_if_exists(&staging).await;
      return Err(e);
    }
    Ok(())
  }

  async fn read_sidecar(&self, pathname: &str) -> StorageResult<Option<SessionSidecar>> {
    match fs::read(self.sidecar_path(pathname)).await {
      Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
      Err(e) if is_not_found(&e) => Ok(None),
      Err(e) => Err(e.into()),
    }
  }

  async fn write_sidecar(&self, sidecar: &SessionSidecar) -> StorageResult<()> {
    let path = self.sidecar_path(&sidecar.pathname);
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).await?;
    }
    let raw = serde_json::to_vec(sidecar)?;
    self.write_staged(&path, &raw).await?;
    Ok(())
  }

  /// Load the sidecar for `pathname` and check it belongs to `upload_id`
  async fn load_session(&self, pathname: &str, upload_id: &str) -> StorageResult<SessionSidecar> {
    match self.read_sidecar(pathname).await? {
      Some(sidecar) if sidecar.upload_id == upload_id => Ok(sidecar),
      _ => Err(StorageError::no_such_upload(upload_id)),
    }
  }

  async fn lock_session(&self, pathname: &str) -> SessionGuard<'_> {
    let key = self.sidecar_path(pathname);
    let handle = self.locks.handle(&key);
    let guard = handle.clone().lock_owned().await;
    SessionGuard {
      locks: &self.locks,
      key,
      handle,
      guard: Some(guard),
    }
  }

  /// Start a session: fresh upload id, empty part directory, sidecar with no parts.
  ///
  /// A previous session on the same pathname is superseded and its parts removed.
  pub async fn create_upload(
    &self,
    pathname: &str,
    options: CreateOptions,
  ) -> StorageResult<SessionSidecar> {
    let upload_id = Uuid::new_v4();
    let _guard = self.lock_session(pathname).await;

    match self.read_sidecar(pathname).await {
      Ok(Some(previous)) => {
        tracing::warn!(
          "Superseding multipart upload {} on {}",
          previous.upload_id,
          pathname
        );
        if let Some(previous_id) = parse_upload_id(&previous.upload_id) {
          remove_dir_if_exists(&self.upload_dir(&previous_id)).await?;
        }
      }
      Ok(None) => {}
      Err(e) => tracing::warn!("Overwriting unreadable sidecar for {}: {}", pathname, e),
    }

    fs::create_dir_all(self.staging_dir()).await?;
    fs::create_dir_all(self.upload_dir(&upload_id)).await?;

    let sidecar = SessionSidecar::new(pathname, &upload_id.to_string(), options);
    self.write_sidecar(&sidecar).await?;

    tracing::info!("Created multipart upload {} for {}", upload_id, pathname);
    Ok(sidecar)
  }

  /// Load an existing session
  pub async fn get_session(&self, pathname: &str, upload_id: &str) -> StorageResult<SessionSidecar> {
    if parse_upload_id(upload_id).is_none() {
      return Err(StorageError::no_such_upload(upload_id));
    }
    self.load_session(pathname, upload_id).await
  }

  /// Store a part payload, then merge its etag into the sidecar
  pub async fn write_part(
    &self,
    pathname: &str,
    upload_id: &str,
    part_number: u32,
    data: &[u8],
  ) -> StorageResult<UploadedPart> {
    if part_number == 0 || part_number > MAX_PART_NUMBER {
      return Err(StorageError::invalid_part_number(part_number as i64));
    }
    let id = parse_upload_id(upload_id).ok_or_else(|| StorageError::no_such_upload(upload_id))?;

    // Refuse payloads for unknown sessions before touching disk
    self.load_session(pathname, upload_id).await?;

    let etag = calculate_etag(data);
    let part_path = self.part_path(&id, part_number);
    let staging = self.stage(data).await?;

    // The rename and the sidecar merge happen together, so the recorded etag always
    // describes the bytes left on disk
    let stored = {
      let _guard = self.lock_session(pathname).await;
      self
        .store_part(pathname, upload_id, &staging, &part_path, part_number, &etag)
        .await
    };

    if let Err(e) = stored {
      let _ = remove_file_if_exists(&staging).await;
      return Err(e);
    }

    tracing::debug!(
      "Stored part {} of upload {} ({} bytes)",
      part_number,
      upload_id,
      data.len()
    );
    Ok(UploadedPart { part_number, etag })
  }

  /// Move a staged payload into its part slot and record it. Caller holds the session lock.
  async fn store_part(
    &self,
    pathname: &str,
    upload_id: &str,
    staging: &Path,
    part_path: &Path,
    part_number: u32,
    etag: &str,
  ) -> StorageResult<()> {
    let mut sidecar = self.load_session(pathname, upload_id).await?;

    if let Err(e) = fs::rename(staging, part_path).await {
      // The part directory only disappears when the session ends
      return Err(if is_not_found(&e) {
        StorageError::no_such_upload(upload_id)
      } else {
        e.into()
      });
    }

    sidecar.upsert_part(part_number, etag.to_string());
    self.write_sidecar(&sidecar).await
  }

  /// Concatenate the parts into the destination object and end the session
  pub async fn complete_upload(
    &self,
    pathname: &str,
    upload_id: &str,
    parts: Vec<UploadedPart>,
  ) -> StorageResult<BlobObject> {
    let ordered = ordered_parts(parts)?;
    let id = parse_upload_id(upload_id).ok_or_else(|| StorageError::no_such_upload(upload_id))?;

    let _guard = self.lock_session(pathname).await;
    let sidecar = self.load_session(pathname, upload_id).await?;

    let mut part_etags = Vec::with_capacity(ordered.len());
    for part in &ordered {
      match sidecar.etag_of(part.part_number) {
        Some(etag) if etag == part.etag.trim_matches('"') => part_etags.push(etag.to_string()),
        Some(_) => {
          return Err(StorageError::invalid_part(format!(
            "Part {} ETag does not match",
            part.part_number
          )))
        }
        None => {
          return Err(StorageError::invalid_part(format!(
            "Part {} was never uploaded",
            part.part_number
          )))
        }
      }
    }

    let staging = self.staging_path();
    let size = match self.concatenate_parts(&id, &ordered, &part_etags, &staging).await {
      Ok(size) => size,
      Err(e) => {
        let _ = remove_file_if_exists(&staging).await;
        return Err(e);
      }
    };

    let object_path = self.object_path(pathname);
    let placed = async {
      if let Some(parent) = object_path.parent() {
        fs::create_dir_all(parent).await?;
      }
      fs::rename(&staging, &object_path).await
    }
    .await;
    if let Err(e) = placed {
      let _ = remove_file_if_exists(&staging).await;
      return Err(e.into());
    }

    // The session is terminal once the sidecar is gone
    remove_file_if_exists(&self.sidecar_path(pathname)).await?;
    if let Err(e) = remove_dir_if_exists(&self.upload_dir(&id)).await {
      tracing::warn!("Failed to remove parts of upload {}: {}", upload_id, e);
    }

    tracing::info!(
      "Completed multipart upload {} for {} ({} parts, {} bytes)",
      upload_id,
      pathname,
      ordered.len(),
      size
    );

    Ok(BlobObject {
      pathname: pathname.to_string(),
      content_type: sidecar
        .content_type
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
      size,
      etag: calculate_multipart_etag(&part_etags),
      uploaded_at: Utc::now(),
      custom_metadata: sidecar.custom_metadata,
    })
  }

  /// Stream each part into `staging` strictly in order, checking every part's digest
  async fn concatenate_parts(
    &self,
    upload_id: &Uuid,
    ordered: &[UploadedPart],
    part_etags: &[String],
    staging: &Path,
  ) -> StorageResult<u64> {
    let mut out = File::create(staging).await?;
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    for (part, expected) in ordered.iter().zip(part_etags) {
      let mut input = match File::open(self.part_path(upload_id, part.part_number)).await {
        Ok(file) => file,
        Err(e) if is_not_found(&e) => {
          return Err(StorageError::invalid_part(format!(
            "Part {} data is missing",
            part.part_number
          )))
        }
        Err(e) => return Err(e.into()),
      };

      let mut digest = md5::Context::new();
      loop {
        let n = input.read(&mut buf).await?;
        if n == 0 {
          break;
        }
        digest.consume(&buf[..n]);
        out.write_all(&buf[..n]).await?;
        total += n as u64;
      }

      if format!("{:x}", digest.compute()) != *expected {
        return Err(StorageError::invalid_part(format!(
          "Part {} content does not match its ETag",
          part.part_number
        )));
      }
    }

    out.flush().await?;
    out.sync_all().await?;
    Ok(total)
  }

  /// Remove the part directory and the session's sidecar. Missing files are fine.
  pub async fn abort_upload(&self, pathname: &str, upload_id: &str) -> StorageResult<()> {
    let Some(id) = parse_upload_id(upload_id) else {
      tracing::debug!("Ignoring abort for malformed upload id {}", upload_id);
      return Ok(());
    };

    let _guard = self.lock_session(pathname).await;
    remove_dir_if_exists(&self.upload_dir(&id)).await?;

    // A newer session on the same pathname keeps its sidecar
    if let Some(sidecar) = self.read_sidecar(pathname).await? {
      if sidecar.upload_id == upload_id {
        remove_file_if_exists(&self.sidecar_path(pathname)).await?;
      }
    }

    tracing::info!("Aborted multipart upload {} for {}", upload_id, pathname);
    Ok(())
  }
}

#[async_trait]
impl MultipartBackend for LocalMultipartStorage {
  async fn create(
    &self,
    pathname: &str,
    options: CreateOptions,
  ) -> StorageResult<Box<dyn MultipartUpload>> {
    let sidecar = self.create_upload(pathname, options).await?;
    Ok(Box::new(LocalUpload {
      storage: self.clone(),
      pathname: sidecar.pathname,
      upload_id: sidecar.upload_id,
    }))
  }

  async fn resume(
    &self,
    pathname: &str,
    upload_id: &str,
  ) -> StorageResult<Box<dyn MultipartUpload>> {
    let sidecar = self.get_session(pathname, upload_id).await?;
    Ok(Box::new(LocalUpload {
      storage: self.clone(),
      pathname: sidecar.pathname,
      upload_id: sidecar.upload_id,
    }))
  }

  /// Cleans the part directory even when the sidecar is already gone
  async fn abort(&self, pathname: &str, upload_id: &str) -> StorageResult<()> {
    self.abort_upload(pathname, upload_id).await
  }

  fn name(&self) -> &'static str {
    "fs"
  }
}

/// Session handle returned by [`LocalMultipartStorage`]
struct LocalUpload {
  storage: LocalMultipartStorage,
  pathname: String,
  upload_id: String,
}

#[async_trait]
impl MultipartUpload for LocalUpload {
  fn pathname(&self) -> &str {
    &self.pathname
  }

  fn upload_id(&self) -> &str {
    &self.upload_id
  }

  async fn upload_part(&self, part_number: u32, data: Bytes) -> StorageResult<UploadedPart> {
    self
      .storage
      .write_part(&self.pathname, &self.upload_id, part_number, &data)
      .await
  }

  async fn complete(&self, parts: Vec<UploadedPart>) -> StorageResult<BlobObject> {
    self
      .storage
      .complete_upload(&self.pathname, &self.upload_id, parts)
      .await
  }

  async fn abort(&self) -> StorageResult<()> {
    self
      .storage
      .abort_upload(&self.pathname, &self.upload_id)
      .await
  }
}

/// Async mutexes guarding sidecar rewrites, keyed by sidecar path
#[derive(Default)]
struct SessionLocks {
  locks: Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
}

impl SessionLocks {
  fn handle(&self, key: &Path) -> Arc<AsyncMutex<()>> {
    self
      .locks
      .lock()
      .entry(key.to_path_buf())
      .or_default()
      .clone()
  }

  /// Drop the table entry unless another task still holds or awaits it
  fn release(&self, key: &Path, handle: &Arc<AsyncMutex<()>>) {
    let mut locks = self.locks.lock();
    let unused = locks
      .get(key)
      .is_some_and(|current| Arc::ptr_eq(current, handle) && Arc::strong_count(handle) <= 2);
    if unused {
      locks.remove(key);
    }
  }

  #[cfg(test)]
  fn len(&self) -> usize {
    self.locks.lock().len()
  }
}

struct SessionGuard<'a> {
  locks: &'a SessionLocks,
  key: PathBuf,
  handle: Arc<AsyncMutex<()>>,
  guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SessionGuard<'_> {
  fn drop(&mut self) {
    self.guard.take();
    self.locks.release(&self.key, &self.handle);
  }
}

/// Upload ids are canonical hyphenated UUIDs; anything else names no session
fn parse_upload_id(upload_id: &str) -> Option<Uuid> {
  Uuid::parse_str(upload_id)
    .ok()
    .filter(|id| id.to_string() == upload_id)
}

fn is_not_found(e: &std::io::Error) -> bool {
  e.kind() == std::io::ErrorKind::NotFound
}

async fn remove_file_if_exists(path: &Path) -> std::io::Result<()> {
  match fs::remove_file(path).await {
    Err(e) if !is_not_found(&e) => Err(e),
    _ => Ok(()),
  }
}

async fn remove_dir_if_exists(path: &Path) -> std::io::Result<()> {
  match fs::remove_dir_all(path).await {
    Err(e) if !is_not_found(&e) => Err(e),
    _ => Ok(()),
  }
}
