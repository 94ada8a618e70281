//! # Server Lifecycle
//!
//! The service runs two HTTP servers concurrently: the transit API and the
//! peer-cache endpoint that shares packed key envelopes with cache peers.
//! Listeners are bound explicitly before serving so bind failures surface
//! deterministically. Shutdown is triggered by SIGINT/SIGTERM/SIGQUIT, by
//! the provided shutdown future, or by the first server that exits
//! abnormally; both servers then get a shared graceful-drain budget, after
//! which they are aborted.
//!
//! The run is considered successful only when every server exited normally;
//! otherwise the first abnormal error is reported.

use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use axum::Router;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinError;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::storage::KeyStore;

pub mod handlers;
pub mod middleware;
pub mod responses;

pub use responses::ApiError;

use handlers::{create_key, decrypt, encrypt, peer_get_packed, revoke_key, AppState};
use middleware::{auth_middleware, request_context_middleware, AuthState};

/// Server lifecycle errors
#[derive(Error, Debug)]
pub enum ServerError {
    /// A listener failed to bind
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The configured address
        addr: String,
        /// The underlying bind error
        source: std::io::Error,
    },

    /// A server exited with an I/O error
    #[error("{server} server failed: {source}")]
    Serve {
        /// Which server failed
        server: &'static str,
        /// The underlying serve error
        source: std::io::Error,
    },

    /// A server task panicked
    #[error("{server} server task failed: {source}")]
    Join {
        /// Which server failed
        server: &'static str,
        /// The join error
        source: JoinError,
    },

    /// The graceful-drain budget elapsed before the servers finished
    #[error("graceful shutdown exceeded {0:?}")]
    ShutdownTimeout(Duration),

    /// Other I/O failure (local address lookup and similar)
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// The transit service: configuration, storage, and both HTTP servers.
pub struct Server {
    config: Config,
    storage: Arc<KeyStore>,
}

impl Server {
    /// Create a server with storage derived from `config`.
    pub fn new(config: Config) -> Self {
        let storage = Arc::new(KeyStore::new(config.sweep_interval));
        Self { config, storage }
    }

    /// Create a server around an existing store (tests inject fast
    /// sweepers this way).
    pub fn with_storage(config: Config, storage: Arc<KeyStore>) -> Self {
        Self { config, storage }
    }

    /// The storage layer backing this server.
    pub fn storage(&self) -> &Arc<KeyStore> {
        &self.storage
    }

    /// Build the transit API router with auth and request context applied.
    pub fn api_router(&self) -> Router {
        let state = Arc::new(AppState {
            storage: Arc::clone(&self.storage),
            default_key_ttl: self.config.default_key_ttl,
        });
        let auth = Arc::new(AuthState {
            token: self.config.bearer_token.clone(),
        });

        Router::new()
            .route("/transit/keys/:name", post(create_key).delete(revoke_key))
            .route("/transit/encrypt/:name", post(encrypt))
            .route("/transit/decrypt/:name", post(decrypt))
            .layer(from_fn_with_state(auth, auth_middleware))
            .layer(from_fn(request_context_middleware))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Build the peer-cache router serving packed envelopes.
    pub fn peer_router(&self) -> Router {
        Router::new()
            .route("/_group/keys/:name", get(peer_get_packed))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.storage))
    }

    /// Bind both listeners and serve until a signal arrives.
    pub async fn run(self) -> ServerResult<()> {
        let api_listener = TcpListener::bind(&self.config.api_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.config.api_addr.clone(),
                source,
            })?;
        let peer_listener = TcpListener::bind(&self.config.peer_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.config.peer_addr.clone(),
                source,
            })?;

        self.serve(api_listener, peer_listener, shutdown_signal()).await
    }

    /// Serve both listeners until `shutdown` resolves or a server exits.
    pub async fn serve(
        self,
        api_listener: TcpListener,
        peer_listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> ServerResult<()> {
        let api_addr = api_listener.local_addr()?;
        let peer_addr = peer_listener.local_addr()?;
        tracing::info!(%api_addr, %peer_addr, "transit service listening");
        if self.config.announce_token {
            tracing::info!(token = %self.config.bearer_token, "use this bearer token to authenticate");
        }

        let sweeper = KeyStore::spawn_sweeper(&self.storage);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let api_router = self.api_router();
        let peer_router = self.peer_router();
        let api_shutdown_rx = shutdown_rx.clone();
        let mut api_task = tokio::spawn(async move {
            axum::serve(api_listener, api_router)
                .with_graceful_shutdown(wait_for_shutdown(api_shutdown_rx))
                .await
        });
        let mut peer_task = tokio::spawn(async move {
            axum::serve(peer_listener, peer_router)
                .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
                .await
        });

        let mut api_result = None;
        let mut peer_result = None;
        tokio::select! {
            _ = shutdown => {
                tracing::info!("shutdown requested");
            }
            result = &mut api_task => {
                tracing::warn!("api server exited before shutdown");
                api_result = Some(result);
            }
            result = &mut peer_task => {
                tracing::warn!("peer cache server exited before shutdown");
                peer_result = Some(result);
            }
        }
        let peer_exited_first = peer_result.is_some();

        let _ = shutdown_tx.send(true);

        let grace = self.config.shutdown_grace;
        let drained = tokio::time::timeout(grace, async {
            let api = match api_result {
                Some(result) => result,
                None => (&mut api_task).await,
            };
            let peer = match peer_result {
                Some(result) => result,
                None => (&mut peer_task).await,
            };
            (api, peer)
        })
        .await;

        sweeper.abort();

        let (api, peer) = match drained {
            Ok(results) => results,
            Err(_) => {
                api_task.abort();
                peer_task.abort();
                tracing::error!(budget = ?grace, "graceful shutdown timed out");
                return Err(ServerError::ShutdownTimeout(grace));
            }
        };

        let api_outcome = task_outcome(api, "api");
        let peer_outcome = task_outcome(peer, "peer cache");
        let first = if peer_exited_first {
            peer_outcome.or(api_outcome)
        } else {
            api_outcome.or(peer_outcome)
        };

        match first {
            Some(err) => {
                tracing::error!(error = %err, "server stopped with error");
                Err(err)
            }
            None => {
                tracing::info!("gracefully quit servers");
                Ok(())
            }
        }
    }
}

fn task_outcome(
    result: Result<std::io::Result<()>, JoinError>,
    server: &'static str,
) -> Option<ServerError> {
    match result {
        Ok(Ok(())) => None,
        Ok(Err(source)) => Some(ServerError::Serve { server, source }),
        Err(source) if source.is_cancelled() => None,
        Err(source) => Some(ServerError::Join { server, source }),
    }
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}

/// Resolve when SIGINT, SIGTERM, or SIGQUIT arrives.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt =
        signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut terminate =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut quit = signal(SignalKind::quit()).expect("failed to install SIGQUIT handler");

    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
        _ = quit.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
