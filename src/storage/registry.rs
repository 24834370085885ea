use std::collections::HashMap;
use std::sync::Arc;

use super::backend::{MultipartBackend, StorageResult};
use super::config::{BackendKind, StorageConfig};
use super::filesystem::LocalMultipartStorage;
use super::proxy::{HubMultipartBackend, S3MultipartBackend, SignedMultipartBackend};

/// Backend tag to adapter lookup handed to the coordinator
#[derive(Clone, Default)]
pub struct AdapterRegistry {
  adapters: HashMap<String, Arc<dyn MultipartBackend>>,
}

impl AdapterRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register an adapter under `tag`, returning the one it replaces
  pub fn register(
    &mut self,
    tag: impl Into<String>,
    backend: Arc<dyn MultipartBackend>,
  ) -> Option<Arc<dyn MultipartBackend>> {
    self.adapters.insert(tag.into(), backend)
  }

  pub fn with(mut self, tag: impl Into<String>, backend: Arc<dyn MultipartBackend>) -> Self {
    self.register(tag, backend);
    self
  }

  pub fn get(&self, tag: &str) -> Option<Arc<dyn MultipartBackend>> {
    self.adapters.get(tag).cloned()
  }

  pub fn contains(&self, tag: &str) -> bool {
    self.adapters.contains_key(tag)
  }

  /// Registered tags, sorted
  pub fn tags(&self) -> Vec<&str> {
    let mut tags: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
    tags.sort_unstable();
    tags
  }

  /// Build the adapters a configuration enables.
  ///
  /// The filesystem backend is always present; remote backends are added when their
  /// section carries credentials or an endpoint.
  pub async fn from_config(config: &StorageConfig) -> StorageResult<Self> {
    let mut registry = Self::new();

    let local = LocalMultipartStorage::new(&config.path);
    local.init().await?;
    registry.register(BackendKind::Fs.as_str(), Arc::new(local));

    if config.s3.is_configured() {
      registry.register(
        BackendKind::S3.as_str(),
        Arc::new(S3MultipartBackend::new(&config.s3)),
      );
    }

    if config.signed.is_configured() {
      registry.register(
        BackendKind::Signed.as_str(),
        Arc::new(SignedMultipartBackend::new(&config.signed)?),
      );
    }

    if config.hub.is_configured() {
      registry.register(
        BackendKind::Hub.as_str(),
        Arc::new(HubMultipartBackend::new(&config.hub)),
      );
    }

    tracing::info!("Multipart backends: {}", registry.tags().join(", "));
    Ok(registry)
  }
}
