use axum::{
  body::Bytes,
  extract::{Path, Query, State},
  http::StatusCode,
  response::{IntoResponse, Response},
  Json,
};
use std::collections::HashMap;
use std::sync::Arc;

use crate::storage::error::{StorageError, StorageErrorCode};
use crate::storage::server::MultipartState;
use crate::storage::types::{CompleteMultipartRequest, CreateOptions};

type Params = HashMap<String, String>;

fn backend_param(params: &Params) -> Option<&str> {
  params.get("backend").map(String::as_str)
}

fn upload_id_param(params: &Params) -> Result<&str, StorageError> {
  params
    .get("uploadId")
    .map(String::as_str)
    .filter(|id| !id.is_empty())
    .ok_or_else(|| StorageError::invalid_argument("Missing uploadId"))
}

/// POST /multipart/create/{*pathname} - Start an upload
pub async fn create_upload(
  State(state): State<Arc<MultipartState>>,
  Path(pathname): Path<String>,
  Query(params): Query<Params>,
  body: Bytes,
) -> Result<Response, StorageError> {
  // The options body is optional
  let options: CreateOptions = if body.iter().all(u8::is_ascii_whitespace) {
    CreateOptions::default()
  } else {
    serde_json::from_slice(&body)
      .map_err(|e| StorageError::invalid_argument(format!("Invalid create options: {}", e)))?
  };

  let session = state
    .coordinator
    .create(backend_param(&params), &pathname, options)
    .await?;

  Ok((StatusCode::OK, Json(session)).into_response())
}

/// PUT /multipart/upload/{*pathname}?uploadId=X&partNumber=N - Upload one part
pub async fn upload_part(
  State(state): State<Arc<MultipartState>>,
  Path(pathname): Path<String>,
  Query(params): Query<Params>,
  body: Bytes,
) -> Result<Response, StorageError> {
  let upload_id = upload_id_param(&params)?;

  let part_number: i64 = params
    .get("partNumber")
    .and_then(|s| s.parse().ok())
    .ok_or_else(|| StorageError::invalid_argument("Missing or invalid partNumber"))?;

  if body.len() as u64 > state.max_part_size {
    return Err(StorageError::new(
      StorageErrorCode::EntityTooLarge,
      format!(
        "Part size {} exceeds maximum allowed size {}",
        body.len(),
        state.max_part_size
      ),
    ));
  }

  let part = state
    .coordinator
    .upload_part(
      backend_param(&params),
      &pathname,
      upload_id,
      part_number,
      body,
    )
    .await?;

  Ok((StatusCode::OK, Json(part)).into_response())
}

/// POST /multipart/complete/{*pathname}?uploadId=X - Assemble the object
pub async fn complete_upload(
  State(state): State<Arc<MultipartState>>,
  Path(pathname): Path<String>,
  Query(params): Query<Params>,
  body: Bytes,
) -> Result<Response, StorageError> {
  let upload_id = upload_id_param(&params)?;

  let request: CompleteMultipartRequest = serde_json::from_slice(&body)
    .map_err(|e| StorageError::invalid_argument(format!("Invalid completion request: {}", e)))?;

  let object = state
    .coordinator
    .complete(backend_param(&params), &pathname, upload_id, request.parts)
    .await?;

  Ok((StatusCode::OK, Json(object)).into_response())
}

/// DELETE /multipart/abort/{*pathname}?uploadId=X - Discard the upload
pub async fn abort_upload(
  State(state): State<Arc<MultipartState>>,
  Path(pathname): Path<String>,
  Query(params): Query<Params>,
) -> Result<Response, StorageError> {
  let upload_id = upload_id_param(&params)?;

  state
    .coordinator
    .abort(backend_param(&params), &pathname, upload_id)
    .await?;

  Ok(StatusCode::NO_CONTENT.into_response())
}
