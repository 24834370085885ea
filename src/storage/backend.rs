//! Multipart backend traits shared by the filesystem, S3, signed-REST and hub adapters

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;

use super::error::{ErrorKind, StorageError};
use super::types::{BlobObject, CreateOptions, MultipartSession, UploadedPart};

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Highest part number accepted by any backend
pub const MAX_PART_NUMBER: u32 = 10_000;

/// A backend able to run multipart uploads
#[async_trait]
pub trait MultipartBackend: Send + Sync {
  /// Start a new upload for `pathname`
  async fn create(
    &self,
    pathname: &str,
    options: CreateOptions,
  ) -> StorageResult<Box<dyn MultipartUpload>>;

  /// Reattach to an existing upload. Unknown sessions fail with `NoSuchUpload`.
  async fn resume(&self, pathname: &str, upload_id: &str)
    -> StorageResult<Box<dyn MultipartUpload>>;

  /// Abort by id. A session that no longer exists counts as aborted.
  async fn abort(&self, pathname: &str, upload_id: &str) -> StorageResult<()> {
    match self.resume(pathname, upload_id).await {
      Ok(upload) => upload.abort().await,
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
      Err(e) => Err(e),
    }
  }

  /// Get a human-readable name for this backend
  fn name(&self) -> &'static str;
}

/// Handle on one in-progress multipart upload
#[async_trait]
pub trait MultipartUpload: Send + Sync {
  fn pathname(&self) -> &str;

  fn upload_id(&self) -> &str;

  /// Store one part. Uploading the same part number again replaces its content.
  async fn upload_part(&self, part_number: u32, data: Bytes) -> StorageResult<UploadedPart>;

  /// Assemble the parts in part-number order and discard the session
  async fn complete(&self, parts: Vec<UploadedPart>) -> StorageResult<BlobObject>;

  /// Discard every artifact of the session. Safe to call more than once.
  async fn abort(&self) -> StorageResult<()>;

  fn session(&self) -> MultipartSession {
    MultipartSession {
      pathname: self.pathname().to_string(),
      upload_id: self.upload_id().to_string(),
    }
  }
}

/// Check a part number coming off the wire
pub fn validate_part_number(part_number: i64) -> StorageResult<u32> {
  if !(1..=MAX_PART_NUMBER as i64).contains(&part_number) {
    return Err(StorageError::invalid_part_number(part_number));
  }
  Ok(part_number as u32)
}

/// Sort a completion request by part number and verify it covers `1..=N`.
///
/// A part listed twice keeps its last etag. An empty list is a validation error;
/// a gap is a completion error naming the first missing part.
pub fn ordered_parts(parts: Vec<UploadedPart>) -> StorageResult<Vec<UploadedPart>> {
  if parts.is_empty() {
    return Err(StorageError::invalid_argument(
      "At least one part is required to complete an upload",
    ));
  }

  let mut by_number = BTreeMap::new();
  for part in parts {
    validate_part_number(part.part_number as i64)?;
    by_number.insert(part.part_number, part);
  }

  for (expected, actual) in (1u32..).zip(by_number.keys()) {
    if expected != *actual {
      return Err(StorageError::new(
        super::error::StorageErrorCode::InvalidPartOrder,
        format!("Part {} is missing from the completion request", expected),
      ));
    }
  }

  Ok(by_number.into_values().collect())
}

/// Calculate MD5 ETag for data
pub fn calculate_etag(data: &[u8]) -> String {
  let digest = md5::compute(data);
  format!("{:x}", digest)
}

/// Calculate multipart ETag (MD5 of MD5s + part count)
pub fn calculate_multipart_etag<S: AsRef<str>>(part_etags: &[S]) -> String {
  let mut combined = Vec::new();
  for etag in part_etags {
    if let Ok(bytes) = hex::decode(etag.as_ref()) {
      combined.extend_from_slice(&bytes);
    }
  }
  let digest = md5::compute(&combined);
  format!("{:x}-{}", digest, part_etags.len())
}

/// Percent-encode a pathname segment by segment, keeping the `/` separators
pub fn encode_pathname(pathname: &str) -> String {
  pathname
    .split('/')
    .map(|segment| urlencoding::encode(segment).into_owned())
    .collect::<Vec<_>>()
    .join("/")
}

#[cfg(test)]
mod tests {
  use super::*;

  fn part(n: u32, etag: &str) -> UploadedPart {
    UploadedPart {
      part_number: n,
      etag: etag.into(),
    }
  }

  #[test]
  fn test_ordered_parts_sorts_out_of_order_input() {
    let parts = ordered_parts(vec![part(3, "c"), part(1, "a"), part(2, "b")]).unwrap();
    let numbers: Vec<u32> = parts.iter().map(|p| p.part_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
  }

  #[test]
  fn test_ordered_parts_rejects_gap() {
    let err = ordered_parts(vec![part(1, "a"), part(2, "b"), part(4, "d")]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Completion);
    assert!(err.message.contains("Part 3"));
  }

  #[test]
  fn test_ordered_parts_rejects_missing_first_part() {
    let err = ordered_parts(vec![part(2, "b")]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Completion);
  }

  #[test]
  fn test_ordered_parts_rejects_empty() {
    let err = ordered_parts(Vec::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
  }

  #[test]
  fn test_ordered_parts_duplicate_keeps_last() {
    let parts = ordered_parts(vec![part(1, "a"), part(2, "old"), part(2, "new")]).unwrap();
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[1].etag, "new");
  }

  #[test]
  fn test_validate_part_number() {
    assert_eq!(validate_part_number(1).unwrap(), 1);
    assert_eq!(validate_part_number(10_000).unwrap(), 10_000);
    assert_eq!(
      validate_part_number(0).unwrap_err().kind(),
      ErrorKind::Validation
    );
    assert!(validate_part_number(-4).is_err());
    assert!(validate_part_number(10_001).is_err());
  }

  #[test]
  fn test_multipart_etag_counts_parts() {
    let e1 = calculate_etag(b"hello");
    let e2 = calculate_etag(b"world");
    let etag = calculate_multipart_etag(&[e1, e2]);
    assert!(etag.ends_with("-2"));
    assert_eq!(etag.len(), 32 + 2);
  }

  #[test]
  fn test_encode_pathname_keeps_separators() {
    assert_eq!(encode_pathname("a b/c+d.txt"), "a%20b/c%2Bd.txt");
    assert_eq!(encode_pathname("plain/key"), "plain/key");
  }
}
