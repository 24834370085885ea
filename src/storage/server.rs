use axum::Router;
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};

use super::coordinator::UploadCoordinator;
use super::routes::build_router;

/// State shared across handlers
pub struct MultipartState {
  pub coordinator: UploadCoordinator,
  /// Largest part body accepted
  pub max_part_size: u64,
  /// Bearer token required on every request, if set
  pub token: Option<String>,
}

/// HTTP listener for the multipart API
pub struct MultipartServer {
  state: Arc<MultipartState>,
  shutdown_tx: RwLock<Option<oneshot::Sender<()>>>,
  task: Mutex<Option<JoinHandle<()>>>,
  local_addr: RwLock<Option<SocketAddr>>,
}

impl MultipartServer {
  pub fn new(coordinator: UploadCoordinator, max_part_size: u64, token: Option<String>) -> Self {
    Self {
      state: Arc::new(MultipartState {
        coordinator,
        max_part_size,
        token: token.filter(|t| !t.is_empty()),
      }),
      shutdown_tx: RwLock::new(None),
      task: Mutex::new(None),
      local_addr: RwLock::new(None),
    }
  }

  /// Router with CORS applied, for embedding in another server
  pub fn router(&self) -> Router {
    let cors = CorsLayer::new()
      .allow_origin(Any)
      .allow_methods(Any)
      .allow_headers(Any)
      .expose_headers(Any);

    build_router(self.state.clone()).layer(cors)
  }

  /// Bind `addr` and serve in the background. Returns the bound address, so port 0 works.
  pub async fn start(&self, addr: &str) -> Result<SocketAddr, anyhow::Error> {
    if let Some(addr) = *self.local_addr.read() {
      return Ok(addr);
    }

    let addr: SocketAddr = addr
      .parse()
      .map_err(|e| anyhow::anyhow!("Invalid listen address {}: {}", addr, e))?;

    let listener = TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    tracing::info!(
      "Multipart server listening on {} (default backend: {})",
      bound,
      self.state.coordinator.default_backend()
    );

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let app = self.router();

    let task = tokio::spawn(async move {
      if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async {
          let _ = shutdown_rx.await;
        })
        .await
      {
        tracing::error!("Multipart server error: {}", e);
      }
    });

    *self.shutdown_tx.write() = Some(shutdown_tx);
    *self.task.lock() = Some(task);
    *self.local_addr.write() = Some(bound);
    Ok(bound)
  }

  /// Signal shutdown and wait for in-flight requests to drain
  pub async fn stop(&self) -> Result<(), anyhow::Error> {
    if let Some(tx) = self.shutdown_tx.write().take() {
      let _ = tx.send(());
    }

    let task = self.task.lock().take();
    if let Some(task) = task {
      task.await?;
    }

    if self.local_addr.write().take().is_some() {
      tracing::info!("Multipart server stopped");
    }
    Ok(())
  }

  pub fn is_running(&self) -> bool {
    self.local_addr.read().is_some()
  }

  pub fn local_addr(&self) -> Option<SocketAddr> {
    *self.local_addr.read()
  }
}
