//! Client side of the multipart protocol: the four wire verbs and the chunk uploader

mod http;
mod uploader;

use async_trait::async_trait;
use bytes::Bytes;

use crate::storage::{BlobObject, CreateOptions, MultipartSession, StorageResult, UploadedPart};

pub use http::HttpMultipartClient;
pub use uploader::{
  part_count, part_range, ChunkUploader, FileSource, PartSource, UploadError, UploadOptions,
};

/// The multipart wire protocol, independent of transport
#[async_trait]
pub trait MultipartApi: Send + Sync {
  async fn create(&self, pathname: &str, options: CreateOptions)
    -> StorageResult<MultipartSession>;

  async fn upload_part(
    &self,
    pathname: &str,
    upload_id: &str,
    part_number: u32,
    data: Bytes,
  ) -> StorageResult<UploadedPart>;

  async fn complete(
    &self,
    pathname: &str,
    upload_id: &str,
    parts: Vec<UploadedPart>,
  ) -> StorageResult<BlobObject>;

  async fn abort(&self, pathname: &str, upload_id: &str) -> StorageResult<()>;
}
