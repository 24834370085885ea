//! Multipart storage: adapter traits, the filesystem driver, remote adapters and the
//! coordinator that dispatches between them.

pub mod backend;
pub mod config;
mod coordinator;
pub mod error;
mod filesystem;
pub mod proxy;
mod registry;
#[cfg(feature = "server")]
mod routes;
#[cfg(feature = "server")]
mod server;
pub mod types;

pub use backend::{
  calculate_etag, calculate_multipart_etag, encode_pathname, ordered_parts,
  validate_part_number, MultipartBackend, MultipartUpload, StorageResult, MAX_PART_NUMBER,
};
pub use config::{BackendKind, HubConfig, S3Config, SignedConfig, StorageConfig};
pub use coordinator::UploadCoordinator;
pub use error::{ErrorBody, ErrorKind, StorageError, StorageErrorCode};
pub use filesystem::LocalMultipartStorage;
pub use registry::AdapterRegistry;
#[cfg(feature = "server")]
pub use routes::build_router;
#[cfg(feature = "server")]
pub use server::{MultipartServer, MultipartState};
pub use types::*;
