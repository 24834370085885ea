use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{RequestBuilder, Response, StatusCode};

use super::MultipartApi;
use crate::storage::{
  encode_pathname, BlobObject, CompleteMultipartRequest, CreateOptions, ErrorBody,
  MultipartSession, StorageError, StorageErrorCode, StorageResult, UploadedPart,
};

/// [`MultipartApi`] over HTTP against a blobpart server
#[derive(Clone)]
pub struct HttpMultipartClient {
  http: reqwest::Client,
  endpoint: String,
  token: Option<String>,
  backend: Option<String>,
}

impl HttpMultipartClient {
  pub fn new(endpoint: impl Into<String>) -> Self {
    let endpoint = endpoint.into();
    Self {
      http: reqwest::Client::new(),
      endpoint: endpoint.trim_end_matches('/').to_string(),
      token: None,
      backend: None,
    }
  }

  /// Send `Authorization: Bearer <token>` with every request
  pub fn with_token(mut self, token: impl Into<String>) -> Self {
    self.token = Some(token.into());
    self
  }

  /// Ask the server to route every verb to a specific backend
  pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
    self.backend = Some(backend.into());
    self
  }

  pub fn endpoint(&self) -> &str {
    &self.endpoint
  }

  fn url(&self, verb: &str, pathname: &str) -> String {
    format!(
      "{}/multipart/{}/{}",
      self.endpoint,
      verb,
      encode_pathname(pathname)
    )
  }

  fn query(&self, upload_id: Option<&str>) -> Vec<(&'static str, String)> {
    let mut query = Vec::new();
    if let Some(upload_id) = upload_id {
      query.push(("uploadId", upload_id.to_string()));
    }
    if let Some(ref backend) = self.backend {
      query.push(("backend", backend.clone()));
    }
    query
  }

  async fn send(&self, request: RequestBuilder) -> StorageResult<Response> {
    let request = match self.token {
      Some(ref token) => request.bearer_auth(token),
      None => request,
    };

    let response = request
      .send()
      .await
      .map_err(|e| StorageError::unavailable(format!("Request to {} failed: {}", self.endpoint, e)))?;

    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(match serde_json::from_str::<ErrorBody>(&body) {
      Ok(error) => error.into(),
      Err(_) => StorageError::new(
        status_code(status),
        format!("Server returned HTTP {}", status.as_u16()),
      ),
    })
  }

  async fn json<T: serde::de::DeserializeOwned>(response: Response) -> StorageResult<T> {
    response
      .json()
      .await
      .map_err(|e| StorageError::unavailable(format!("Malformed response body: {}", e)))
  }
}

/// Error code for a failed response that carried no JSON error body
fn status_code(status: StatusCode) -> StorageErrorCode {
  match status {
    StatusCode::BAD_REQUEST => StorageErrorCode::InvalidArgument,
    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StorageErrorCode::AccessDenied,
    StatusCode::NOT_FOUND => StorageErrorCode::NoSuchUpload,
    StatusCode::PAYLOAD_TOO_LARGE => StorageErrorCode::EntityTooLarge,
    _ => StorageErrorCode::ServiceUnavailable,
  }
}

#[async_trait]
impl MultipartApi for HttpMultipartClient {
  async fn create(
    &self,
    pathname: &str,
    options: CreateOptions,
  ) -> StorageResult<MultipartSession> {
    let request = self
      .http
      .post(self.url("create", pathname))
      .query(&self.query(None))
      .json(&options);
    Self::json(self.send(request).await?).await
  }

  async fn upload_part(
    &self,
    pathname: &str,
    upload_id: &str,
    part_number: u32,
    data: Bytes,
  ) -> StorageResult<UploadedPart> {
    let mut query = self.query(Some(upload_id));
    query.push(("partNumber", part_number.to_string()));

    let request = self
      .http
      .put(self.url("upload", pathname))
      .query(&query)
      .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
      .body(data);
    Self::json(self.send(request).await?).await
  }

  async fn complete(
    &self,
    pathname: &str,
    upload_id: &str,
    parts: Vec<UploadedPart>,
  ) -> StorageResult<BlobObject> {
    let request = self
      .http
      .post(self.url("complete", pathname))
      .query(&self.query(Some(upload_id)))
      .json(&CompleteMultipartRequest { parts });
    Self::json(self.send(request).await?).await
  }

  async fn abort(&self, pathname: &str, upload_id: &str) -> StorageResult<()> {
    let request = self
      .http
      .delete(self.url("abort", pathname))
      .query(&self.query(Some(upload_id)));
    self.send(request).await?;
    Ok(())
  }
}
