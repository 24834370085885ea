//! Adapters for remote stores

mod hub;
mod s3;
mod signed;
mod sigv4;

pub use hub::HubMultipartBackend;
pub use s3::S3MultipartBackend;
pub use signed::SignedMultipartBackend;
pub use sigv4::SigV4Signer;
