//! Security utilities for blobpart
//!
//! This module provides:
//! - Constant-time comparison for access tokens
//! - Pathname validation to prevent path traversal and collisions with
//!   the filesystem driver's reserved names

use sha2::{Digest, Sha256};

/// Suffix marking a session sidecar rather than a real object
pub const SIDECAR_SUFFIX: char = '$';

/// Directory holding part files of in-progress uploads
pub const PARTS_DIR: &str = ".multipart";

/// Constant-time string comparison to prevent timing attacks.
/// Returns true if both strings are equal.
pub fn constant_time_compare(a: &str, b: &str) -> bool {
  if a.len() != b.len() {
    return false;
  }

  let mut result: u8 = 0;
  for (x, y) in a.bytes().zip(b.bytes()) {
    result |= x ^ y;
  }
  result == 0
}

/// Hash a value using SHA-256 and return as hex string
pub fn hash_sha256(value: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(value.as_bytes());
  format!("{:x}", hasher.finalize())
}

/// Compare a presented token against the configured one without leaking timing
pub fn verify_token(presented: &str, expected: &str) -> bool {
  constant_time_compare(&hash_sha256(presented), &hash_sha256(expected))
}

/// Validates a destination pathname before any backend sees it.
pub fn validate_pathname(pathname: &str) -> Result<(), PathnameError> {
  if pathname.is_empty() {
    return Err(PathnameError::Empty);
  }

  if pathname.contains("..") {
    return Err(PathnameError::PathTraversal);
  }

  // Windows path separator
  if pathname.contains('\\') {
    return Err(PathnameError::InvalidCharacter('\\'));
  }

  if pathname.contains('\0') {
    return Err(PathnameError::NullByte);
  }

  if pathname.starts_with('/') {
    return Err(PathnameError::AbsolutePath);
  }

  if pathname.chars().any(|c| c.is_control() && c != '\t') {
    return Err(PathnameError::ControlCharacter);
  }

  if pathname.len() > 1024 {
    return Err(PathnameError::TooLong(pathname.len()));
  }

  // No empty or `.` segments, so the path resolves to itself under the storage root
  for segment in pathname.split('/') {
    if segment.is_empty() {
      return Err(PathnameError::EmptySegment);
    }
    if segment == "." {
      return Err(PathnameError::DotSegment);
    }
    if segment.ends_with(SIDECAR_SUFFIX) {
      return Err(PathnameError::ReservedSuffix);
    }
  }

  if pathname.split('/').next() == Some(PARTS_DIR) {
    return Err(PathnameError::ReservedPrefix);
  }

  Ok(())
}

/// Errors that can occur when validating pathnames
#[derive(Debug, Clone, PartialEq)]
pub enum PathnameError {
  Empty,
  /// Pathname contains path traversal sequence (..)
  PathTraversal,
  InvalidCharacter(char),
  NullByte,
  AbsolutePath,
  ControlCharacter,
  /// Pathname exceeds 1024 bytes
  TooLong(usize),
  /// Empty segment from `//`, a trailing `/` or similar
  EmptySegment,
  /// A `.` segment
  DotSegment,
  /// A segment ends with the sidecar suffix
  ReservedSuffix,
  /// Pathname points into the part storage directory
  ReservedPrefix,
}

impl std::fmt::Display for PathnameError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Empty => write!(f, "Pathname cannot be empty"),
      Self::PathTraversal => write!(f, "Pathname contains path traversal sequence"),
      Self::InvalidCharacter(c) => write!(f, "Pathname contains invalid character: {:?}", c),
      Self::NullByte => write!(f, "Pathname contains null byte"),
      Self::AbsolutePath => write!(f, "Pathname cannot be an absolute path"),
      Self::ControlCharacter => write!(f, "Pathname contains control character"),
      Self::TooLong(len) => write!(f, "Pathname too long: {} bytes (max 1024)", len),
      Self::EmptySegment => write!(f, "Pathname contains an empty segment"),
      Self::DotSegment => write!(f, "Pathname contains a '.' segment"),
      Self::ReservedSuffix => write!(
        f,
        "Pathname cannot end with the reserved suffix '{}'",
        SIDECAR_SUFFIX
      ),
      Self::ReservedPrefix => write!(f, "Pathname cannot point into {}", PARTS_DIR),
    }
  }
}

impl std::error::Error for PathnameError {}
