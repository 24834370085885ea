mod multipart;

pub use multipart::*;

use axum::{
  extract::{DefaultBodyLimit, Request, State},
  http::header::AUTHORIZATION,
  middleware::{self, Next},
  response::{IntoResponse, Response},
  routing::{delete, post, put},
  Router,
};
use std::sync::Arc;

use super::error::StorageError;
use super::server::MultipartState;
use crate::security::verify_token;

/// Build the multipart API router
pub fn build_router(state: Arc<MultipartState>) -> Router {
  let body_limit = usize::try_from(state.max_part_size).unwrap_or(usize::MAX);

  Router::new()
    .route("/multipart/create/{*pathname}", post(create_upload))
    .route("/multipart/upload/{*pathname}", put(upload_part))
    .route("/multipart/complete/{*pathname}", post(complete_upload))
    .route("/multipart/abort/{*pathname}", delete(abort_upload))
    .layer(DefaultBodyLimit::max(body_limit))
    .layer(middleware::from_fn_with_state(state.clone(), require_token))
    .with_state(state)
}

/// Reject requests without the configured bearer token
async fn require_token(
  State(state): State<Arc<MultipartState>>,
  request: Request,
  next: Next,
) -> Response {
  if let Some(ref expected) = state.token {
    let presented = request
      .headers()
      .get(AUTHORIZATION)
      .and_then(|v| v.to_str().ok())
      .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
      Some(token) if verify_token(token, expected) => {}
      _ => {
        return StorageError::access_denied("Missing or invalid bearer token").into_response();
      }
    }
  }

  next.run(request).await
}
