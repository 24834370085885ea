//! Pass-through to another blobpart server

use async_trait::async_trait;
use bytes::Bytes;

use crate::client::{HttpMultipartClient, MultipartApi};
use crate::storage::backend::{MultipartBackend, MultipartUpload, StorageResult};
use crate::storage::config::HubConfig;
use crate::storage::types::{BlobObject, CreateOptions, UploadedPart};

/// Backend forwarding every verb over HTTP to an upstream server
pub struct HubMultipartBackend {
  client: HttpMultipartClient,
}

impl HubMultipartBackend {
  pub fn new(config: &HubConfig) -> Self {
    let mut client = HttpMultipartClient::new(&config.endpoint);
    if let Some(ref token) = config.token {
      client = client.with_token(token);
    }
    if let Some(ref backend) = config.backend {
      client = client.with_backend(backend);
    }
    Self { client }
  }

  pub fn from_client(client: HttpMultipartClient) -> Self {
    Self { client }
  }
}

#[async_trait]
impl MultipartBackend for HubMultipartBackend {
  async fn create(
    &self,
    pathname: &str,
    options: CreateOptions,
  ) -> StorageResult<Box<dyn MultipartUpload>> {
    let session = self.client.create(pathname, options).await?;
    tracing::info!(
      "Created upstream multipart upload {} for {} at {}",
      session.upload_id,
      session.pathname,
      self.client.endpoint()
    );
    Ok(Box::new(HubUpload {
      client: self.client.clone(),
      pathname: session.pathname,
      upload_id: session.upload_id,
    }))
  }

  /// The wire protocol has no lookup verb; an unknown session surfaces on first use
  async fn resume(
    &self,
    pathname: &str,
    upload_id: &str,
  ) -> StorageResult<Box<dyn MultipartUpload>> {
    Ok(Box::new(HubUpload {
      client: self.client.clone(),
      pathname: pathname.to_string(),
      upload_id: upload_id.to_string(),
    }))
  }

  fn name(&self) -> &'static str {
    "hub"
  }
}

struct HubUpload {
  client: HttpMultipartClient,
  pathname: String,
  upload_id: String,
}

#[async_trait]
impl MultipartUpload for HubUpload {
  fn pathname(&self) -> &str {
    &self.pathname
  }

  fn upload_id(&self) -> &str {
    &self.upload_id
  }

  async fn upload_part(&self, part_number: u32, data: Bytes) -> StorageResult<UploadedPart> {
    self
      .client
      .upload_part(&self.pathname, &self.upload_id, part_number, data)
      .await
  }

  async fn complete(&self, parts: Vec<UploadedPart>) -> StorageResult<BlobObject> {
    self
      .client
      .complete(&self.pathname, &self.upload_id, parts)
      .await
  }

  async fn abort(&self) -> StorageResult<()> {
    self.client.abort(&self.pathname, &self.upload_id).await
  }
}
