use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad failure class shared by every backend.
///
/// The chunk uploader only retries [`ErrorKind::Backend`] failures; every other kind
/// is surfaced to the caller immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  /// Malformed input from the caller
  Validation,
  /// Unknown upload, pathname or session sidecar
  NotFound,
  /// Part list cannot be assembled into an object
  Completion,
  /// Failure reaching or operating the underlying store
  Backend,
}

/// Storage error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorCode {
  InvalidArgument,
  InvalidPartNumber,
  EntityTooLarge,
  NoSuchUpload,
  NoSuchKey,
  InvalidPart,
  InvalidPartOrder,
  AccessDenied,
  ServiceUnavailable,
  InternalError,
}

impl StorageErrorCode {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::InvalidArgument => "InvalidArgument",
      Self::InvalidPartNumber => "InvalidPartNumber",
      Self::EntityTooLarge => "EntityTooLarge",
      Self::NoSuchUpload => "NoSuchUpload",
      Self::NoSuchKey => "NoSuchKey",
      Self::InvalidPart => "InvalidPart",
      Self::InvalidPartOrder => "InvalidPartOrder",
      Self::AccessDenied => "AccessDenied",
      Self::ServiceUnavailable => "ServiceUnavailable",
      Self::InternalError => "InternalError",
    }
  }

  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::InvalidArgument | Self::InvalidPartNumber | Self::EntityTooLarge => {
        ErrorKind::Validation
      }
      Self::NoSuchUpload | Self::NoSuchKey => ErrorKind::NotFound,
      Self::InvalidPart | Self::InvalidPartOrder => ErrorKind::Completion,
      Self::AccessDenied | Self::ServiceUnavailable | Self::InternalError => ErrorKind::Backend,
    }
  }

  pub fn http_status(&self) -> u16 {
    match self {
      Self::InvalidArgument => 400,
      Self::InvalidPartNumber => 400,
      Self::EntityTooLarge => 413,
      Self::NoSuchUpload => 404,
      Self::NoSuchKey => 404,
      Self::InvalidPart => 400,
      Self::InvalidPartOrder => 400,
      Self::AccessDenied => 403,
      Self::ServiceUnavailable => 503,
      Self::InternalError => 500,
    }
  }

  /// Map an error code reported by a remote store onto the local taxonomy.
  ///
  /// Accepts both our own wire codes and the S3 codes returned by native and
  /// signed-REST backends. Unknown codes are treated as backend failures.
  pub fn from_remote(code: &str) -> Self {
    if let Ok(code) = code.parse() {
      return code;
    }
    match code {
      "NoSuchBucket" => Self::NoSuchKey,
      "EntityTooSmall" => Self::InvalidPart,
      "InvalidRequest" | "MalformedXML" | "KeyTooLongError" => Self::InvalidArgument,
      "InvalidAccessKeyId" | "SignatureDoesNotMatch" | "ExpiredToken" => Self::AccessDenied,
      _ => Self::ServiceUnavailable,
    }
  }
}

impl std::str::FromStr for StorageErrorCode {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "InvalidArgument" => Ok(Self::InvalidArgument),
      "InvalidPartNumber" => Ok(Self::InvalidPartNumber),
      "EntityTooLarge" => Ok(Self::EntityTooLarge),
      "NoSuchUpload" => Ok(Self::NoSuchUpload),
      "NoSuchKey" => Ok(Self::NoSuchKey),
      "InvalidPart" => Ok(Self::InvalidPart),
      "InvalidPartOrder" => Ok(Self::InvalidPartOrder),
      "AccessDenied" => Ok(Self::AccessDenied),
      "ServiceUnavailable" => Ok(Self::ServiceUnavailable),
      "InternalError" => Ok(Self::InternalError),
      _ => Err(format!("Unknown storage error code: {}", s)),
    }
  }
}

/// Multipart storage error
#[derive(Debug, Clone)]
pub struct StorageError {
  pub code: StorageErrorCode,
  pub message: String,
  pub resource: Option<String>,
  /// Backend tag the failing verb was dispatched to
  pub backend: Option<String>,
}

/// JSON error body used on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
  pub code: String,
  pub message: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub resource: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub backend: Option<String>,
}

impl StorageError {
  pub fn new(code: StorageErrorCode, message: impl Into<String>) -> Self {
    Self {
      code,
      message: message.into(),
      resource: None,
      backend: None,
    }
  }

  pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
    self.resource = Some(resource.into());
    self
  }

  /// Record the backend tag unless an upstream hop already did
  pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
    if self.backend.is_none() {
      self.backend = Some(backend.into());
    }
    self
  }

  pub fn kind(&self) -> ErrorKind {
    self.code.kind()
  }

  /// Whether the chunk uploader may retry the failed request
  pub fn is_retryable(&self) -> bool {
    self.kind() == ErrorKind::Backend
  }

  pub fn invalid_argument(message: impl Into<String>) -> Self {
    Self::new(StorageErrorCode::InvalidArgument, message)
  }

  pub fn invalid_part_number(part_number: i64) -> Self {
    Self::new(
      StorageErrorCode::InvalidPartNumber,
      format!(
        "Part number must be an integer between 1 and 10000, got {}",
        part_number
      ),
    )
  }

  pub fn no_such_upload(upload_id: impl Into<String>) -> Self {
    Self::new(
      StorageErrorCode::NoSuchUpload,
      "The specified upload does not exist.",
    )
    .with_resource(upload_id)
  }

  pub fn invalid_part(message: impl Into<String>) -> Self {
    Self::new(StorageErrorCode::InvalidPart, message)
  }

  pub fn access_denied(message: impl Into<String>) -> Self {
    Self::new(StorageErrorCode::AccessDenied, message)
  }

  pub fn unavailable(message: impl Into<String>) -> Self {
    Self::new(StorageErrorCode::ServiceUnavailable, message)
  }

  pub fn internal_error(message: impl Into<String>) -> Self {
    Self::new(StorageErrorCode::InternalError, message)
  }

  /// Build an error from a code string reported by a remote store
  pub fn from_remote(code: Option<&str>, message: impl Into<String>) -> Self {
    let code = code
      .map(StorageErrorCode::from_remote)
      .unwrap_or(StorageErrorCode::ServiceUnavailable);
    Self::new(code, message)
  }

  pub fn to_body(&self) -> ErrorBody {
    ErrorBody {
      code: self.code.as_str().to_string(),
      message: self.message.clone(),
      resource: self.resource.clone(),
      backend: self.backend.clone(),
    }
  }
}

impl From<ErrorBody> for StorageError {
  fn from(body: ErrorBody) -> Self {
    let mut error = StorageError::from_remote(Some(&body.code), body.message);
    error.resource = body.resource;
    error.backend = body.backend;
    error
  }
}

impl From<std::io::Error> for StorageError {
  fn from(e: std::io::Error) -> Self {
    StorageError::internal_error(e.to_string())
  }
}

impl From<serde_json::Error> for StorageError {
  fn from(e: serde_json::Error) -> Self {
    StorageError::internal_error(format!("Corrupt session metadata: {}", e))
  }
}

impl fmt::Display for StorageError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}: {}", self.code.as_str(), self.message)?;
    if let Some(ref resource) = self.resource {
      write!(f, " ({})", resource)?;
    }
    if let Some(ref backend) = self.backend {
      write!(f, " [{}]", backend)?;
    }
    Ok(())
  }
}

impl std::error::Error for StorageError {}

#[cfg(feature = "server")]
impl axum::response::IntoResponse for StorageError {
  fn into_response(self) -> axum::response::Response {
    let status = axum::http::StatusCode::from_u16(self.code.http_status())
      .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
    (status, axum::Json(self.to_body())).into_response()
  }
}
