//! Web layer: the authenticated ingest endpoint, the loopback read
//! endpoints for the uploader child, and the status/health surface.

use anyhow::Result;
use axum::{
    Router,
    routing::{get, post},
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::errors::AppError;
use crate::registry::StreamRegistry;

pub mod handlers;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<StreamRegistry>,
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/status", get(handlers::status))
        .route("/upload_segment", post(handlers::upload_segment))
        .route(
            "/segments/{session_id}/playlist.m3u8",
            get(handlers::serve_playlist),
        )
        .route(
            "/segments/{session_id}/{filename}",
            get(handlers::serve_segment),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Web server configuration and setup.
pub struct WebServer {
    app: Router,
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(config: Arc<Config>, registry: Arc<StreamRegistry>) -> Result<Self, AppError> {
        let addr: SocketAddr = format!("{}:{}", config.web.host, config.web.port)
            .parse()
            .map_err(|e| AppError::Configuration {
                message: format!("invalid listen address: {e}"),
            })?;
        let app = router(AppState { config, registry });
        Ok(Self { app, addr })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bind and serve until the shutdown future resolves. Connection info is
    /// threaded through so the loopback endpoints can check peer addresses.
    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("listening on {}", listener.local_addr()?);
        axum::serve(
            listener,
            self.app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;
        Ok(())
    }
}
