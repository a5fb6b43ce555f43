mod errors;
mod handlers;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post, put},
};
use color_eyre::eyre::{Context, Result};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::revocation::RevocationService;
use handlers::{health::health_check, revocation};

pub use errors::AppError;

#[derive(Debug, Clone)]
pub struct ServerConfig<'a> {
    pub host: &'a str,
    pub port: u16,
}

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<RevocationService>,
}

/// Builds the HTTP routes over a revocation service.
pub fn router(service: Arc<RevocationService>) -> Router {
    let trace_layer =
        TraceLayer::new_for_http().make_span_with(|request: &'_ axum::extract::Request<_>| {
            let uri = request.uri().to_string();
            tracing::info_span!("request", method = %request.method(), uri)
        });

    Router::new()
        .route("/health", get(health_check))
        .route("/revocation/status", get(revocation::status))
        .route("/revocation/sync", post(revocation::sync))
        .route("/revocation/check", post(revocation::check))
        .route("/revocation/caching", put(revocation::set_caching))
        .layer(trace_layer)
        .with_state(AppState { service })
}

pub struct Server {
    router: Router,
    listener: TcpListener,
}

impl Server {
    /// Binds the listener. Port 0 picks a free port, see [`Server::port`].
    pub async fn new(service: Arc<RevocationService>, config: ServerConfig<'_>) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .wrap_err_with(|| format!("Failed to bind {addr}"))?;

        Ok(Self {
            router: router(service),
            listener,
        })
    }

    pub fn port(&self) -> Result<u16> {
        Ok(self
            .listener
            .local_addr()
            .wrap_err("Failed to read local address")?
            .port())
    }

    pub async fn run(self) -> Result<()> {
        tracing::info!(
            "Listening on {}",
            self.listener
                .local_addr()
                .wrap_err("Failed to read local address")?
        );
        axum::serve(self.listener, self.router)
            .await
            .wrap_err("Server failed")
    }
}
