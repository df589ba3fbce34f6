//! HTTP server: WebSocket endpoint, status API and the static web UI
//!
//! Each bind address gets its own listener. Plain listeners are served by
//! `axum::serve`; HTTPS listeners by `axum-server` with rustls, all sharing
//! one certificate from the `tls` block.

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    middleware,
    routing::get,
};
use axum_server::tls_rustls::RustlsConfig;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use super::auth::{Credentials, require_basic_auth};
use super::controller::{ControllerHandle, spawn_controller};
use super::websocket::{check_origin, ws_handler};
use crate::config::{ReefConfig, TlsConfig};
use crate::storage::Storage;
use crate::{Error, Result};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Entry point to the connection controller
    pub controller: ControllerHandle,
}

/// Build the application router.
pub fn router(
    controller: ControllerHandle,
    ui_directory: Option<&Path>,
    credentials: Option<Credentials>,
) -> Router {
    let mut app = Router::new()
        .route(
            "/ws",
            get(ws_handler).route_layer(middleware::from_fn(check_origin)),
        )
        .route("/api/status", get(get_status));

    // Unknown paths fall back to index.html so client-side routes resolve.
    if let Some(dir) = ui_directory {
        let index = ServeFile::new(dir.join("index.html"));
        app = app.fallback_service(ServeDir::new(dir).fallback(index));
    }

    let mut app = app.with_state(AppState { controller });

    if let Some(credentials) = credentials {
        app = app.layer(middleware::from_fn_with_state(
            Arc::new(credentials),
            require_basic_auth,
        ));
    }

    app.layer(TraceLayer::new_for_http())
}

/// Server version and live connection count
async fn get_status(
    State(state): State<AppState>,
) -> std::result::Result<Json<serde_json::Value>, StatusCode> {
    let connections = state
        .controller
        .connection_count()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;

    Ok(Json(serde_json::json!({
        "version": crate::VERSION,
        "connections": connections,
    })))
}

/// How long HTTPS listeners wait for open connections on shutdown.
const TLS_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A bound socket and whether it serves HTTPS.
struct Listener {
    socket: TcpListener,
    https: bool,
}

/// A bound, not yet running server.
pub struct Server {
    listeners: Vec<Listener>,
    tls: Option<RustlsConfig>,
    router: Router,
    controller: ControllerHandle,
    controller_task: JoinHandle<Result<()>>,
}

impl Server {
    /// Open the store, start the controller and bind every configured address.
    pub async fn bind(config: &ReefConfig) -> Result<Self> {
        let tls = if config.bind_addresses.iter().any(|a| a.https) {
            let tls = config.tls.as_ref().ok_or_else(|| {
                Error::Config("HTTPS bind addresses need a tls block".to_string())
            })?;
            Some(load_tls(tls).await?)
        } else {
            None
        };
        let credentials = Credentials::from_config(&config.auth)?;

        let storage = Arc::new(Storage::open(&config.database_directory)?);
        info!(path = %storage.db_path().display(), "opened database");

        let mut listeners = Vec::with_capacity(config.bind_addresses.len());
        for address in &config.bind_addresses {
            let socket = TcpListener::bind((address.host.as_str(), address.port))
                .await
                .map_err(|e| Error::Other(format!("Unable to bind {}: {}", address, e)))?;
            listeners.push(Listener {
                socket,
                https: address.https,
            });
        }

        let (controller, controller_task) = spawn_controller(storage);
        let router = router(
            controller.clone(),
            config.ui_directory.as_deref(),
            credentials,
        );

        Ok(Self {
            listeners,
            tls,
            router,
            controller,
            controller_task,
        })
    }

    /// Addresses actually bound (useful when a port of 0 was requested).
    pub fn local_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.listeners
            .iter()
            .map(|l| l.socket.local_addr().map_err(Error::from))
            .collect()
    }

    pub fn controller(&self) -> ControllerHandle {
        self.controller.clone()
    }

    /// Serve until `shutdown` is cancelled or the controller stops.
    ///
    /// Returns the controller's fatal error, if it had one.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut servers = JoinSet::new();
        for listener in self.listeners {
            let addr = listener.socket.local_addr()?;
            let app = self.router.clone();
            let token = shutdown.clone();

            match (listener.https, self.tls.clone()) {
                (true, Some(tls)) => {
                    info!("Serving reef at https://{}", addr);
                    let handle = axum_server::Handle::new();
                    let stopper = handle.clone();
                    servers.spawn(async move {
                        tokio::spawn(async move {
                            token.cancelled().await;
                            stopper.graceful_shutdown(Some(TLS_SHUTDOWN_GRACE));
                        });
                        axum_server::from_tcp_rustls(listener.socket.into_std()?, tls)
                            .handle(handle)
                            .serve(app.into_make_service())
                            .await
                    });
                }
                (true, None) => {
                    return Err(Error::Config(format!(
                        "No certificate loaded for https://{}",
                        addr
                    )));
                }
                (false, _) => {
                    info!("Serving reef at http://{}", addr);
                    servers.spawn(async move {
                        axum::serve(listener.socket, app)
                            .with_graceful_shutdown(token.cancelled_owned())
                            .await
                    });
                }
            }
        }

        let mut controller_task = self.controller_task;
        let result = tokio::select! {
            joined = &mut controller_task => {
                error!("controller stopped, shutting down");
                flatten(joined)
            }
            _ = shutdown.cancelled() => {
                self.controller.shutdown().await;
                flatten(controller_task.await)
            }
        };
        shutdown.cancel();

        while let Some(joined) = servers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "listener failed"),
                Err(e) => warn!(error = %e, "listener task failed"),
            }
        }

        info!("server stopped");
        result
    }
}

async fn load_tls(tls: &TlsConfig) -> Result<RustlsConfig> {
    RustlsConfig::from_pem_file(&tls.cert, &tls.key)
        .await
        .map_err(|e| {
            Error::Config(format!(
                "Unable to load certificate {} and key {}: {}",
                tls.cert.display(),
                tls.key.display(),
                e
            ))
        })
}

fn flatten(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    joined.map_err(|e| Error::Other(format!("controller task failed: {}", e)))?
}

/// Start the server and run it until Ctrl-C.
pub async fn start_server(config: &ReefConfig) -> Result<()> {
    let server = Server::bind(config).await?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl-C, shutting down");
                signal.cancel();
            }
            Err(e) => warn!(error = %e, "unable to listen for Ctrl-C"),
        }
    });

    server.run(shutdown).await
}
