// Multipart upload engine: adapters, filesystem driver, coordinator and chunk uploader
pub mod client;
pub mod security;
pub mod storage;

// Daemon configuration (only compiled with server feature)
#[cfg(feature = "server")]
pub mod server;
