use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

use super::backend::{validate_part_number, MultipartBackend, StorageResult};
use super::error::StorageError;
use super::registry::AdapterRegistry;
use super::types::{BlobObject, CreateOptions, MultipartSession, UploadedPart};
use crate::client::MultipartApi;
use crate::security::validate_pathname;

/// Routes the four multipart verbs to the adapter a request names.
///
/// Holds no session state of its own; every call resolves the adapter, validates its
/// input and forwards. Errors come back tagged with the backend that produced them.
#[derive(Clone)]
pub struct UploadCoordinator {
  registry: Arc<AdapterRegistry>,
  default_backend: String,
}

impl UploadCoordinator {
  /// Fails when `default_backend` is not registered
  pub fn new(registry: AdapterRegistry, default_backend: impl Into<String>) -> StorageResult<Self> {
    let default_backend = default_backend.into();
    if !registry.contains(&default_backend) {
      return Err(StorageError::invalid_argument(format!(
        "Default backend '{}' is not registered (available: {})",
        default_backend,
        registry.tags().join(", ")
      )));
    }
    Ok(Self {
      registry: Arc::new(registry),
      default_backend,
    })
  }

  pub fn default_backend(&self) -> &str {
    &self.default_backend
  }

  pub fn registry(&self) -> &AdapterRegistry {
    &self.registry
  }

  fn adapter(&self, backend: Option<&str>) -> StorageResult<(String, Arc<dyn MultipartBackend>)> {
    let tag = backend
      .filter(|b| !b.is_empty())
      .unwrap_or(self.default_backend.as_str());
    let adapter = self.registry.get(tag).ok_or_else(|| {
      StorageError::invalid_argument(format!("Unknown storage backend: {}", tag))
    })?;
    Ok((tag.to_string(), adapter))
  }

  fn check_pathname(pathname: &str) -> StorageResult<()> {
    validate_pathname(pathname)
      .map_err(|e| StorageError::invalid_argument(e.to_string()).with_resource(pathname))
  }

  pub async fn create(
    &self,
    backend: Option<&str>,
    pathname: &str,
    options: CreateOptions,
  ) -> StorageResult<MultipartSession> {
    let (tag, adapter) = self.adapter(backend)?;
    Self::check_pathname(pathname).map_err(|e| e.with_backend(&tag))?;

    let upload = adapter
      .create(pathname, options)
      .await
      .map_err(|e| e.with_backend(&tag))?;
    Ok(upload.session())
  }

  /// `part_number` is taken as it arrives off the wire and range-checked here
  pub async fn upload_part(
    &self,
    backend: Option<&str>,
    pathname: &str,
    upload_id: &str,
    part_number: i64,
    data: Bytes,
  ) -> StorageResult<UploadedPart> {
    let (tag, adapter) = self.adapter(backend)?;
    let part_number = Self::check_pathname(pathname)
      .and_then(|_| validate_part_number(part_number))
      .map_err(|e| e.with_backend(&tag))?;

    let result = async {
      let upload = adapter.resume(pathname, upload_id).await?;
      upload.upload_part(part_number, data).await
    }
    .await;
    result.map_err(|e| e.with_backend(&tag))
  }

  pub async fn complete(
    &self,
    backend: Option<&str>,
    pathname: &str,
    upload_id: &str,
    parts: Vec<UploadedPart>,
  ) -> StorageResult<BlobObject> {
    let (tag, adapter) = self.adapter(backend)?;
    Self::check_pathname(pathname).map_err(|e| e.with_backend(&tag))?;

    let result = async {
      let upload = adapter.resume(pathname, upload_id).await?;
      upload.complete(parts).await
    }
    .await;
    result.map_err(|e| e.with_backend(&tag))
  }

  /// Idempotent: aborting an unknown or finished session succeeds
  pub async fn abort(
    &self,
    backend: Option<&str>,
    pathname: &str,
    upload_id: &str,
  ) -> StorageResult<()> {
    let (tag, adapter) = self.adapter(backend)?;
    Self::check_pathname(pathname).map_err(|e| e.with_backend(&tag))?;

    adapter
      .abort(pathname, upload_id)
      .await
      .map_err(|e| e.with_backend(&tag))
  }
}

#[async_trait]
impl MultipartApi for UploadCoordinator {
  async fn create(
    &self,
    pathname: &str,
    options: CreateOptions,
  ) -> StorageResult<MultipartSession> {
    UploadCoordinator::create(self, None, pathname, options).await
  }

  async fn upload_part(
    &self,
    pathname: &str,
    upload_id: &str,
    part_number: u32,
    data: Bytes,
  ) -> StorageResult<UploadedPart> {
    UploadCoordinator::upload_part(self, None, pathname, upload_id, part_number as i64, data).await
  }

  async fn complete(
    &self,
    pathname: &str,
    upload_id: &str,
    parts: Vec<UploadedPart>,
  ) -> StorageResult<BlobObject> {
    UploadCoordinator::complete(self, None, pathname, upload_id, parts).await
  }

  async fn abort(&self, pathname: &str, upload_id: &str) -> StorageResult<()> {
    UploadCoordinator::abort(self, None, pathname, upload_id).await
  }
}
