use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Content type used when a session did not declare one
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Options captured when a multipart upload is created
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOptions {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub content_type: Option<String>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub custom_metadata: BTreeMap<String, String>,
}

impl CreateOptions {
  pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
    self.content_type = Some(content_type.into());
    self
  }

  pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.custom_metadata.insert(key.into(), value.into());
    self
  }
}

/// Identity of an in-progress multipart upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartSession {
  pub pathname: String,
  pub upload_id: String,
}

/// A part accepted by a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedPart {
  pub part_number: u32,
  pub etag: String,
}

/// Request body for completing a multipart upload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompleteMultipartRequest {
  #[serde(default)]
  pub parts: Vec<UploadedPart>,
}

/// Object materialised by a completed upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobObject {
  pub pathname: String,
  pub content_type: String,
  pub size: u64,
  pub etag: String,
  pub uploaded_at: DateTime<Utc>,
  #[serde(default)]
  pub custom_metadata: BTreeMap<String, String>,
}

/// Session state persisted by the filesystem driver next to the destination path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSidecar {
  pub pathname: String,
  pub upload_id: String,
  #[serde(default)]
  pub content_type: Option<String>,
  #[serde(default)]
  pub custom_metadata: BTreeMap<String, String>,
  /// `[partNumber, etag]` pairs kept sorted by part number
  #[serde(default)]
  pub parts: Vec<(u32, String)>,
}

impl SessionSidecar {
  pub fn new(pathname: &str, upload_id: &str, options: CreateOptions) -> Self {
    Self {
      pathname: pathname.to_string(),
      upload_id: upload_id.to_string(),
      content_type: options.content_type,
      custom_metadata: options.custom_metadata,
      parts: Vec::new(),
    }
  }

  /// Record a part, replacing any earlier etag for the same part number
  pub fn upsert_part(&mut self, part_number: u32, etag: String) {
    match self.parts.binary_search_by_key(&part_number, |(n, _)| *n) {
      Ok(idx) => self.parts[idx].1 = etag,
      Err(idx) => self.parts.insert(idx, (part_number, etag)),
    }
  }

  pub fn etag_of(&self, part_number: u32) -> Option<&str> {
    self
      .parts
      .binary_search_by_key(&part_number, |(n, _)| *n)
      .ok()
      .map(|idx| self.parts[idx].1.as_str())
  }

  pub fn session(&self) -> MultipartSession {
    MultipartSession {
      pathname: self.pathname.clone(),
      upload_id: self.upload_id.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_upsert_keeps_parts_sorted_and_unique() {
    let mut sidecar = SessionSidecar::new("a/b.bin", "id", CreateOptions::default());
    sidecar.upsert_part(3, "c".into());
    sidecar.upsert_part(1, "a".into());
    sidecar.upsert_part(2, "b".into());
    sidecar.upsert_part(1, "a2".into());

    assert_eq!(
      sidecar.parts,
      vec![(1, "a2".into()), (2, "b".into()), (3, "c".into())]
    );
    assert_eq!(sidecar.etag_of(1), Some("a2"));
    assert_eq!(sidecar.etag_of(4), None);
  }

  #[test]
  fn test_sidecar_json_layout() {
    let mut sidecar = SessionSidecar::new(
      "docs/report.pdf",
      "u-1",
      CreateOptions::default().with_content_type("application/pdf"),
    );
    sidecar.upsert_part(1, "e1".into());

    let json = serde_json::to_value(&sidecar).unwrap();
    assert_eq!(json["pathname"], "docs/report.pdf");
    assert_eq!(json["uploadId"], "u-1");
    assert_eq!(json["contentType"], "application/pdf");
    assert_eq!(json["parts"], serde_json::json!([[1, "e1"]]));
  }
}
