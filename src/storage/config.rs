use serde::{Deserialize, Serialize};

/// Backend variant a multipart adapter is registered under
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
  /// Multipart simulated on the local filesystem (default)
  #[default]
  Fs,
  /// Native multipart through the AWS SDK
  S3,
  /// SigV4-signed REST calls against an S3-compatible endpoint
  Signed,
  /// Another blobpart server
  Hub,
}

impl BackendKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      BackendKind::Fs => "fs",
      BackendKind::S3 => "s3",
      BackendKind::Signed => "signed",
      BackendKind::Hub => "hub",
    }
  }
}

impl std::fmt::Display for BackendKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

impl std::str::FromStr for BackendKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "fs" | "local" | "filesystem" => Ok(BackendKind::Fs),
      "s3" => Ok(BackendKind::S3),
      "signed" | "r2" => Ok(BackendKind::Signed),
      "hub" | "proxy" => Ok(BackendKind::Hub),
      _ => Err(format!("Unknown storage backend: {}", s)),
    }
  }
}

/// Native S3 backend settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct S3Config {
  /// Custom endpoint URL; empty means AWS
  #[serde(default)]
  pub endpoint: String,

  #[serde(default)]
  pub bucket: String,

  #[serde(default)]
  pub access_key_id: String,

  #[serde(default)]
  pub secret_access_key: String,

  #[serde(default = "default_region")]
  pub region: String,

  /// Force path-style URLs (required for MinIO and self-hosted S3)
  #[serde(default)]
  pub force_path_style: bool,
}

impl S3Config {
  pub fn is_configured(&self) -> bool {
    !self.bucket.is_empty() && !self.access_key_id.is_empty() && !self.secret_access_key.is_empty()
  }
}

/// Signed-REST backend settings (R2, MinIO and other S3-compatible stores)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignedConfig {
  /// Endpoint URL, e.g. `https://<account>.r2.cloudflarestorage.com`
  #[serde(default)]
  pub endpoint: String,

  #[serde(default)]
  pub bucket: String,

  #[serde(default)]
  pub access_key_id: String,

  #[serde(default)]
  pub secret_access_key: String,

  #[serde(default = "default_region")]
  pub region: String,
}

impl SignedConfig {
  pub fn is_configured(&self) -> bool {
    !self.endpoint.is_empty()
      && !self.bucket.is_empty()
      && !self.access_key_id.is_empty()
      && !self.secret_access_key.is_empty()
  }
}

/// Pass-through to another blobpart server
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubConfig {
  /// Base URL of the upstream server
  #[serde(default)]
  pub endpoint: String,

  /// Bearer token presented upstream
  #[serde(default)]
  pub token: Option<String>,

  /// Backend tag requested from the upstream server
  #[serde(default)]
  pub backend: Option<String>,
}

impl HubConfig {
  pub fn is_configured(&self) -> bool {
    !self.endpoint.is_empty()
  }
}

fn default_region() -> String {
  "us-east-1".to_string()
}

fn default_path() -> String {
  "./data/blobs".to_string()
}

fn default_max_part_size() -> u64 {
  5 * 1024 * 1024 * 1024
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
  /// Root directory of the filesystem backend
  #[serde(default = "default_path")]
  pub path: String,

  /// Backend used when a request names none
  #[serde(default)]
  pub default_backend: BackendKind,

  /// Largest part accepted by the HTTP surface
  #[serde(default = "default_max_part_size")]
  pub max_part_size: u64,

  #[serde(default)]
  pub s3: S3Config,

  #[serde(default)]
  pub signed: SignedConfig,

  #[serde(default)]
  pub hub: HubConfig,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      path: default_path(),
      default_backend: BackendKind::default(),
      max_part_size: default_max_part_size(),
      s3: S3Config::default(),
      signed: SignedConfig::default(),
      hub: HubConfig::default(),
    }
  }
}
