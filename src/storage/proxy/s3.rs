//! Native multipart through the AWS SDK

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};

use crate::storage::backend::{ordered_parts, MultipartBackend, MultipartUpload, StorageResult};
use crate::storage::config::S3Config;
use crate::storage::error::{StorageError, StorageErrorCode};
use crate::storage::types::{BlobObject, CreateOptions, UploadedPart, DEFAULT_CONTENT_TYPE};

/// Backend delegating every verb to S3's own multipart API
pub struct S3MultipartBackend {
  client: S3Client,
  bucket: String,
}

impl S3MultipartBackend {
  pub fn new(config: &S3Config) -> Self {
    let credentials = Credentials::new(
      &config.access_key_id,
      &config.secret_access_key,
      None,
      None,
      "blobpart-s3",
    );

    let mut s3_config = S3ConfigBuilder::new()
      .behavior_version(BehaviorVersion::latest())
      .region(Region::new(config.region.clone()))
      .credentials_provider(credentials);

    if !config.endpoint.is_empty() {
      s3_config = s3_config.endpoint_url(&config.endpoint);
    }

    // Force path style for MinIO and self-hosted S3
    if config.force_path_style {
      s3_config = s3_config.force_path_style(true);
    }

    Self {
      client: S3Client::from_conf(s3_config.build()),
      bucket: config.bucket.clone(),
    }
  }

  fn handle(&self, pathname: &str, upload_id: &str) -> Box<dyn MultipartUpload> {
    Box::new(S3Upload {
      client: self.client.clone(),
      bucket: self.bucket.clone(),
      pathname: pathname.to_string(),
      upload_id: upload_id.to_string(),
    })
  }
}

#[async_trait]
impl MultipartBackend for S3MultipartBackend {
  async fn create(
    &self,
    pathname: &str,
    options: CreateOptions,
  ) -> StorageResult<Box<dyn MultipartUpload>> {
    let metadata: Option<HashMap<String, String>> = (!options.custom_metadata.is_empty())
      .then(|| options.custom_metadata.into_iter().collect());

    let output = self
      .client
      .create_multipart_upload()
      .bucket(&self.bucket)
      .key(pathname)
      .set_content_type(options.content_type)
      .set_metadata(metadata)
      .send()
      .await
      .map_err(|e| sdk_error("CreateMultipartUpload", e))?;

    let upload_id = output
      .upload_id()
      .ok_or_else(|| StorageError::unavailable("CreateMultipartUpload returned no UploadId"))?;

    tracing::info!("Created S3 multipart upload {} for {}", upload_id, pathname);
    Ok(self.handle(pathname, upload_id))
  }

  async fn resume(
    &self,
    pathname: &str,
    upload_id: &str,
  ) -> StorageResult<Box<dyn MultipartUpload>> {
    self
      .client
      .list_parts()
      .bucket(&self.bucket)
      .key(pathname)
      .upload_id(upload_id)
      .max_parts(1)
      .send()
      .await
      .map_err(|e| sdk_error("ListParts", e).with_resource(upload_id))?;

    Ok(self.handle(pathname, upload_id))
  }

  fn name(&self) -> &'static str {
    "s3"
  }
}

struct S3Upload {
  client: S3Client,
  bucket: String,
  pathname: String,
  upload_id: String,
}

#[async_trait]
impl MultipartUpload for S3Upload {
  fn pathname(&self) -> &str {
    &self.pathname
  }

  fn upload_id(&self) -> &str {
    &self.upload_id
  }

  async fn upload_part(&self, part_number: u32, data: Bytes) -> StorageResult<UploadedPart> {
    let output = self
      .client
      .upload_part()
      .bucket(&self.bucket)
      .key(&self.pathname)
      .upload_id(&self.upload_id)
      .part_number(part_number as i32)
      .body(ByteStream::from(data))
      .send()
      .await
      .map_err(|e| sdk_error("UploadPart", e))?;

    let etag = output
      .e_tag()
      .map(|s| s.trim_matches('"').to_string())
      .ok_or_else(|| StorageError::unavailable("UploadPart returned no ETag"))?;

    Ok(UploadedPart { part_number, etag })
  }

  async fn complete(&self, parts: Vec<UploadedPart>) -> StorageResult<BlobObject> {
    let completed: Vec<CompletedPart> = ordered_parts(parts)?
      .into_iter()
      .map(|part| {
        CompletedPart::builder()
          .part_number(part.part_number as i32)
          .e_tag(format!("\"{}\"", part.etag.trim_matches('"')))
          .build()
      })
      .collect();

    let output = self
      .client
      .complete_multipart_upload()
      .bucket(&self.bucket)
      .key(&self.pathname)
      .upload_id(&self.upload_id)
      .multipart_upload(
        CompletedMultipartUpload::builder()
          .set_parts(Some(completed))
          .build(),
      )
      .send()
      .await
      .map_err(|e| sdk_error("CompleteMultipartUpload", e))?;

    let head = self
      .client
      .head_object()
      .bucket(&self.bucket)
      .key(&self.pathname)
      .send()
      .await
      .map_err(|e| sdk_error("HeadObject", e))?;

    let etag = output
      .e_tag()
      .or(head.e_tag())
      .map(|s| s.trim_matches('"').to_string())
      .unwrap_or_default();

    tracing::info!(
      "Completed S3 multipart upload {} for {}",
      self.upload_id,
      self.pathname
    );

    Ok(BlobObject {
      pathname: self.pathname.clone(),
      content_type: head
        .content_type()
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string(),
      size: head.content_length().unwrap_or(0).max(0) as u64,
      etag,
      uploaded_at: Utc::now(),
      custom_metadata: head
        .metadata()
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_else(BTreeMap::new),
    })
  }

  async fn abort(&self) -> StorageResult<()> {
    let result = self
      .client
      .abort_multipart_upload()
      .bucket(&self.bucket)
      .key(&self.pathname)
      .upload_id(&self.upload_id)
      .send()
      .await;

    match result.map_err(|e| sdk_error("AbortMultipartUpload", e)) {
      Ok(_) => {
        tracing::info!(
          "Aborted S3 multipart upload {} for {}",
          self.upload_id,
          self.pathname
        );
        Ok(())
      }
      Err(e) if e.code == StorageErrorCode::NoSuchUpload => Ok(()),
      Err(e) => Err(e),
    }
  }
}

/// Map an SDK failure onto the storage taxonomy using the service error code
fn sdk_error<E, R>(operation: &str, err: SdkError<E, R>) -> StorageError
where
  E: ProvideErrorMetadata + std::error::Error + 'static,
  R: std::fmt::Debug,
{
  let code = err
    .as_service_error()
    .and_then(|e| e.code())
    .map(str::to_string);
  StorageError::from_remote(
    code.as_deref(),
    format!("{} failed: {}", operation, DisplayErrorContext(&err)),
  )
}
