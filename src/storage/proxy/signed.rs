//! Multipart over SigV4-signed REST calls, for S3-compatible stores without the SDK

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use regex::Regex;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use reqwest::{Method, Response, Url};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use super::sigv4::{build_canonical_query, SigV4Signer};
use crate::storage::backend::{
  encode_pathname, ordered_parts, MultipartBackend, MultipartUpload, StorageResult,
};
use crate::storage::config::SignedConfig;
use crate::storage::error::{ErrorKind, StorageError};
use crate::storage::types::{BlobObject, CreateOptions, UploadedPart, DEFAULT_CONTENT_TYPE};

const META_PREFIX: &str = "x-amz-meta-";

/// Backend speaking the S3 REST multipart protocol directly
pub struct SignedMultipartBackend {
  client: Arc<SignedClient>,
}

impl SignedMultipartBackend {
  pub fn new(config: &SignedConfig) -> StorageResult<Self> {
    Ok(Self {
      client: Arc::new(SignedClient::new(config)?),
    })
  }

  fn handle(&self, pathname: &str, upload_id: &str) -> Box<dyn MultipartUpload> {
    Box::new(SignedUpload {
      client: self.client.clone(),
      pathname: pathname.to_string(),
      upload_id: upload_id.to_string(),
    })
  }
}

#[async_trait]
impl MultipartBackend for SignedMultipartBackend {
  async fn create(
    &self,
    pathname: &str,
    options: CreateOptions,
  ) -> StorageResult<Box<dyn MultipartUpload>> {
    let mut headers = Vec::new();
    if let Some(content_type) = options.content_type {
      headers.push((CONTENT_TYPE.as_str().to_string(), content_type));
    }
    for (key, value) in options.custom_metadata {
      headers.push((format!("{}{}", META_PREFIX, key.to_lowercase()), value));
    }

    let response = self
      .client
      .execute(
        Method::POST,
        pathname,
        &[("uploads", String::new())],
        headers,
        Bytes::new(),
      )
      .await?;
    let body = read_body(response).await?;

    let upload_id = xml_field(&body, "UploadId")
      .filter(|id| !id.is_empty())
      .ok_or_else(|| StorageError::unavailable("CreateMultipartUpload returned no UploadId"))?;

    tracing::info!("Created signed multipart upload {} for {}", upload_id, pathname);
    Ok(self.handle(pathname, &upload_id))
  }

  async fn resume(
    &self,
    pathname: &str,
    upload_id: &str,
  ) -> StorageResult<Box<dyn MultipartUpload>> {
    let query = [
      ("uploadId", upload_id.to_string()),
      ("max-parts", "1".to_string()),
    ];
    self
      .client
      .execute(Method::GET, pathname, &query, Vec::new(), Bytes::new())
      .await
      .map_err(|e| match e.kind() {
        ErrorKind::NotFound => StorageError::no_such_upload(upload_id),
        _ => e,
      })?;

    Ok(self.handle(pathname, upload_id))
  }

  fn name(&self) -> &'static str {
    "signed"
  }
}

struct SignedClient {
  http: reqwest::Client,
  signer: SigV4Signer,
  endpoint: Url,
  host: String,
  bucket: String,
}

impl SignedClient {
  fn new(config: &SignedConfig) -> StorageResult<Self> {
    let endpoint = Url::parse(&config.endpoint).map_err(|e| {
      StorageError::invalid_argument(format!("Invalid signed endpoint {}: {}", config.endpoint, e))
    })?;
    let host = match (endpoint.host_str(), endpoint.port()) {
      (Some(host), Some(port)) => format!("{}:{}", host, port),
      (Some(host), None) => host.to_string(),
      (None, _) => {
        return Err(StorageError::invalid_argument(format!(
          "Signed endpoint has no host: {}",
          config.endpoint
        )))
      }
    };

    Ok(Self {
      http: reqwest::Client::new(),
      signer: SigV4Signer::new(
        &config.access_key_id,
        &config.secret_access_key,
        &config.region,
      ),
      endpoint,
      host,
      bucket: config.bucket.clone(),
    })
  }

  /// Path-style object path, already percent-encoded
  fn object_path(&self, pathname: &str) -> String {
    format!(
      "{}/{}/{}",
      self.endpoint.path().trim_end_matches('/'),
      urlencoding::encode(&self.bucket),
      encode_pathname(pathname)
    )
  }

  /// Sign and send one request; non-2xx responses become storage errors
  async fn execute(
    &self,
    method: Method,
    pathname: &str,
    query: &[(&str, String)],
    headers: Vec<(String, String)>,
    body: Bytes,
  ) -> StorageResult<Response> {
    let path = self.object_path(pathname);
    let signed = self.signer.sign(
      method.as_str(),
      &self.host,
      &path,
      query,
      &headers,
      Utc::now(),
    );

    let canonical_query = build_canonical_query(query);
    let mut url = format!("{}://{}{}", self.endpoint.scheme(), self.host, path);
    if !canonical_query.is_empty() {
      url.push('?');
      url.push_str(&canonical_query);
    }

    let mut request = self.http.request(method.clone(), &url).body(body);
    for (name, value) in &signed {
      request = request.header(name.as_str(), value.as_str());
    }

    let response = request
      .send()
      .await
      .map_err(|e| StorageError::unavailable(format!("{} {} failed: {}", method, path, e)))?;

    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(remote_error(status.as_u16(), &body))
  }
}

struct SignedUpload {
  client: Arc<SignedClient>,
  pathname: String,
  upload_id: String,
}

#[async_trait]
impl MultipartUpload for SignedUpload {
  fn pathname(&self) -> &str {
    &self.pathname
  }

  fn upload_id(&self) -> &str {
    &self.upload_id
  }

  async fn upload_part(&self, part_number: u32, data: Bytes) -> StorageResult<UploadedPart> {
    let query = [
      ("partNumber", part_number.to_string()),
      ("uploadId", self.upload_id.clone()),
    ];
    let response = self
      .client
      .execute(Method::PUT, &self.pathname, &query, Vec::new(), data)
      .await?;

    let etag = response
      .headers()
      .get(ETAG)
      .and_then(|v| v.to_str().ok())
      .map(|v| v.trim_matches('"').to_string())
      .ok_or_else(|| StorageError::unavailable("UploadPart returned no ETag"))?;

    tracing::debug!("Uploaded part {} of {}", part_number, self.upload_id);
    Ok(UploadedPart { part_number, etag })
  }

  async fn complete(&self, parts: Vec<UploadedPart>) -> StorageResult<BlobObject> {
    let parts = ordered_parts(parts)?;
    let query = [("uploadId", self.upload_id.clone())];
    let response = self
      .client
      .execute(
        Method::POST,
        &self.pathname,
        &query,
        vec![(CONTENT_TYPE.as_str().to_string(), "application/xml".to_string())],
        Bytes::from(completion_body(&parts)),
      )
      .await?;

    // Completion can fail after the 200 status line has been sent
    let body = read_body(response).await?;
    if body.contains("<Error>") {
      return Err(remote_error(200, &body));
    }
    let completed_etag = xml_field(&body, "ETag");

    let head = self
      .client
      .execute(Method::HEAD, &self.pathname, &[], Vec::new(), Bytes::new())
      .await?;
    let headers = head.headers();
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let size = header(CONTENT_LENGTH.as_str())
      .and_then(|v| v.parse::<u64>().ok())
      .unwrap_or(0);
    let content_type = header(CONTENT_TYPE.as_str())
      .unwrap_or(DEFAULT_CONTENT_TYPE)
      .to_string();
    let etag = completed_etag
      .or_else(|| header(ETAG.as_str()).map(|v| v.trim_matches('"').to_string()))
      .unwrap_or_default();
    let custom_metadata: BTreeMap<String, String> = headers
      .iter()
      .filter_map(|(name, value)| {
        let key = name.as_str().strip_prefix(META_PREFIX)?;
        Some((key.to_string(), value.to_str().ok()?.to_string()))
      })
      .collect();

    tracing::info!(
      "Completed signed multipart upload {} for {}",
      self.upload_id,
      self.pathname
    );

    Ok(BlobObject {
      pathname: self.pathname.clone(),
      content_type,
      size,
      etag,
      uploaded_at: Utc::now(),
      custom_metadata,
    })
  }

  async fn abort(&self) -> StorageResult<()> {
    let query = [("uploadId", self.upload_id.clone())];
    let result = self
      .client
      .execute(Method::DELETE, &self.pathname, &query, Vec::new(), Bytes::new())
      .await;

    match result {
      Ok(_) => {
        tracing::info!(
          "Aborted signed multipart upload {} for {}",
          self.upload_id,
          self.pathname
        );
        Ok(())
      }
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
      Err(e) => Err(e),
    }
  }
}

async fn read_body(response: Response) -> StorageResult<String> {
  response
    .text()
    .await
    .map_err(|e| StorageError::unavailable(format!("Failed to read response body: {}", e)))
}

fn completion_body(parts: &[UploadedPart]) -> String {
  let mut body = String::from("<CompleteMultipartUpload>");
  for part in parts {
    body.push_str(&format!(
      "<Part><PartNumber>{}</PartNumber><ETag>\"{}\"</ETag></Part>",
      part.part_number,
      escape_xml(part.etag.trim_matches('"'))
    ));
  }
  body.push_str("</CompleteMultipartUpload>");
  body
}

/// Build an error from an S3 XML error document, falling back to the HTTP status
fn remote_error(status: u16, body: &str) -> StorageError {
  let code = xml_field(body, "Code").or_else(|| {
    match status {
      400 => Some("InvalidRequest"),
      403 => Some("AccessDenied"),
      404 => Some("NoSuchKey"),
      413 => Some("EntityTooLarge"),
      _ => None,
    }
    .map(String::from)
  });
  let message = xml_field(body, "Message")
    .unwrap_or_else(|| format!("Remote store returned HTTP {}", status));
  StorageError::from_remote(code.as_deref(), message)
}

/// Leaf elements `<Tag>text</Tag>`; the closing name is compared in `xml_field`
static LEAF_ELEMENT: OnceLock<Regex> = OnceLock::new();

/// Text of the first `<tag>` element, entities decoded and surrounding quotes removed
fn xml_field(body: &str, tag: &str) -> Option<String> {
  let pattern = LEAF_ELEMENT.get_or_init(|| {
    Regex::new(r"<([A-Za-z][A-Za-z0-9]*)>([^<]*)</([A-Za-z][A-Za-z0-9]*)>")
      .expect("leaf element pattern is valid")
  });
  let raw = pattern
    .captures_iter(body)
    .find(|c| &c[1] == tag && &c[3] == tag)?
    .get(2)?
    .as_str();
  Some(unescape_xml(raw).trim_matches('"').to_string())
}

fn unescape_xml(value: &str) -> String {
  value
    .replace("&quot;", "\"")
    .replace("&#34;", "\"")
    .replace("&apos;", "'")
    .replace("&#39;", "'")
    .replace("&lt;", "<")
    .replace("&gt;", ">")
    .replace("&amp;", "&")
}

fn escape_xml(value: &str) -> String {
  value
    .replace('&', "&amp;")
    .replace('<', "&lt;")
    .replace('>', "&gt;")
    .replace('"', "&quot;")
}
