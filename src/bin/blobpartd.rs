use blobpart::server::ServerConfig;
use blobpart::storage::{AdapterRegistry, BackendKind, MultipartServer, UploadCoordinator};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "blobpartd", about = "blobpart multipart upload server", version)]
struct Args {
  #[arg(short, long)]
  port: Option<u16>,
  #[arg(long)]
  host: Option<String>,
  #[arg(short, long)]
  config: Option<String>,
  #[arg(long)]
  log_level: Option<String>,
  /// Root directory of the filesystem backend
  #[arg(long, env = "BLOBPART_STORAGE_PATH")]
  storage_path: Option<String>,
  /// Backend used when a request names none (fs, s3, signed, hub)
  #[arg(long, env = "BLOBPART_DEFAULT_BACKEND")]
  default_backend: Option<BackendKind>,
  /// Bearer token required from clients
  #[arg(long, env = "BLOBPART_TOKEN")]
  token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
  let args = Args::parse();

  // Load config: explicit path > auto-detect > defaults
  let mut config = if let Some(path) = &args.config {
    ServerConfig::from_file(path)?
  } else {
    ServerConfig::find_and_load()?.unwrap_or_default()
  };

  // CLI args override config file
  if let Some(port) = args.port {
    config.server.port = port;
  }
  if let Some(host) = args.host {
    config.server.host = host;
  }
  if let Some(level) = args.log_level {
    config.logging.level = level;
  }
  if let Some(path) = args.storage_path {
    config.storage.path = path;
  }
  if let Some(backend) = args.default_backend {
    config.storage.default_backend = backend;
  }
  if let Some(token) = args.token {
    config.auth.token = Some(token);
  }

  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into()),
    )
    .with(tracing_subscriber::fmt::layer())
    .init();

  let registry = AdapterRegistry::from_config(&config.storage)
    .await
    .map_err(|e| anyhow::anyhow!("Failed to initialize storage: {}", e))?;
  let coordinator = UploadCoordinator::new(registry, config.storage.default_backend.as_str())
    .map_err(|e| anyhow::anyhow!("{}", e))?;

  let server = MultipartServer::new(
    coordinator,
    config.storage.max_part_size,
    config.auth.token.clone(),
  );
  server.start(&config.address()).await?;

  shutdown_signal().await;
  server.stop().await?;
  tracing::info!("Shutdown complete");
  Ok(())
}

async fn shutdown_signal() {
  let ctrl_c = async {
    tokio::signal::ctrl_c()
      .await
      .expect("Failed to install Ctrl+C handler");
  };

  #[cfg(unix)]
  let terminate = async {
    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
      .expect("Failed to install SIGTERM handler")
      .recv()
      .await;
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => tracing::info!("Received SIGINT"),
    _ = terminate => tracing::info!("Received SIGTERM"),
  }
}
