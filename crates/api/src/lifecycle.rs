use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use compliance_store::{ComplianceStore, PgStore};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

use crate::config::{ApiConfig, StartupError};
use crate::http::{self, AppState};
use crate::identity_cache::IdentityCaches;

/// Owns the HTTP listener of the compliance events API.
///
/// `start` and `stop` are idempotent. The identity caches belong to the server
/// rather than to one run of the listener, so they survive a stop/start cycle.
pub struct ComplianceApiServer {
    bind_addr: SocketAddr,
    db_max_connections: u32,
    store_timeout: Duration,
    shutdown_timeout: Duration,
    caches: IdentityCaches,
    running: Mutex<Option<RunningServer>>,
}

struct RunningServer {
    local_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
    store: Arc<dyn ComplianceStore>,
}

impl ComplianceApiServer {
    pub fn new(config: &ApiConfig) -> Self {
        Self {
            bind_addr: config.bind_addr,
            db_max_connections: config.db_max_connections,
            store_timeout: Duration::from_millis(config.store_timeout_ms),
            shutdown_timeout: Duration::from_millis(config.shutdown_timeout_ms),
            caches: IdentityCaches::new(),
            running: Mutex::new(None),
        }
    }

    pub fn with_caches(mut self, caches: IdentityCaches) -> Self {
        self.caches = caches;
        self
    }

    pub fn caches(&self) -> &IdentityCaches {
        &self.caches
    }

    /// Starts serving against the Postgres store at `db_url`. The pool connects
    /// lazily. A no-op when already running.
    pub async fn start(&self, db_url: &str) -> Result<(), StartupError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let store = PgStore::connect_lazy(db_url, self.db_max_connections, self.store_timeout)
            .map_err(|err| StartupError {
                code: "ERR_STORE_UNAVAILABLE",
                message: format!("failed to initialize store: {}", err),
            })?;

        *running = Some(self.spawn(Arc::new(store)).await?);
        Ok(())
    }

    pub async fn start_with_store(
        &self,
        store: Arc<dyn ComplianceStore>,
    ) -> Result<(), StartupError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        *running = Some(self.spawn(store).await?);
        Ok(())
    }

    /// Gracefully stops the listener and closes the store. A no-op when not running.
    pub async fn stop(&self) -> Result<(), StartupError> {
        let mut running = self.running.lock().await;
        let Some(server) = running.take() else {
            return Ok(());
        };

        let _ = server.shutdown_tx.send(());
        let abort = server.task.abort_handle();
        let joined = tokio::time::timeout(self.shutdown_timeout, server.task).await;
        server.store.close().await;

        match joined {
            Ok(Ok(())) => {
                tracing::info!(bind_addr = %server.local_addr, "compliance events api stopped");
                Ok(())
            }
            Ok(Err(err)) => {
                tracing::error!(error = %err, "compliance events api server task failed");
                Err(StartupError {
                    code: "ERR_SERVER_FAILED",
                    message: "server task failed during shutdown".to_string(),
                })
            }
            Err(_) => {
                abort.abort();
                tracing::warn!(
                    bind_addr = %server.local_addr,
                    "graceful shutdown timed out; server task aborted"
                );
                Err(StartupError {
                    code: "ERR_SHUTDOWN_TIMEOUT",
                    message: "graceful shutdown timed out".to_string(),
                })
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|s| s.local_addr)
    }

    async fn spawn(&self, store: Arc<dyn ComplianceStore>) -> Result<RunningServer, StartupError> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|err| StartupError {
                code: "ERR_BIND_FAILED",
                message: format!("failed to bind {}: {}", self.bind_addr, err),
            })?;
        let local_addr = listener.local_addr().map_err(|err| StartupError {
            code: "ERR_BIND_FAILED",
            message: format!("failed to read bound address: {}", err),
        })?;

        let app = http::router(AppState::new(store.clone(), self.caches.clone()));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(err) = served {
                tracing::error!(error = %err, "compliance events api server failed");
            }
        });

        tracing::info!(bind_addr = %local_addr, "compliance events api listening");

        Ok(RunningServer {
            local_addr,
            shutdown_tx,
            task,
            store,
        })
    }
}
