mod handlers;
mod responses;

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::server::handlers::events::record_event;
use crate::server::handlers::health::health_check;
use crate::server::handlers::root::home;
use crate::trigger::RecordEventTrigger;
use axum::http::Method;
use axum::{
    Router,
    routing::{get, post},
};
use color_eyre::eyre::{Context, Result};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

#[derive(Clone)]
/// The global application state shared between all request handlers.
pub(crate) struct AppState {
    pub(crate) trigger: RecordEventTrigger,
}

pub struct Server {
    router: Router,
    listener: TcpListener,
}

impl Server {
    /// Creates the HTTP server exposing the business-event trigger.
    pub async fn new(config: &ServerConfig, trigger: RecordEventTrigger) -> Result<Self> {
        let trace_layer =
            TraceLayer::new_for_http().make_span_with(|request: &'_ axum::extract::Request<_>| {
                let uri = request.uri().to_string();
                tracing::info_span!("request", method = %request.method(), uri)
            });

        let cors_layer = CorsLayer::new()
            .allow_origin(Any)
            .allow_headers(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS]);

        let state = AppState { trigger };

        let router = Router::new()
            .route("/", get(home))
            .route("/health", get(health_check))
            .route("/records/{record_id}/events", post(record_event))
            .layer(cors_layer)
            .layer(trace_layer)
            .with_state(state);

        let listener = TcpListener::bind(format!("{}:{}", config.host, config.port))
            .await
            .wrap_err_with(|| format!("Failed to bind to port {}", config.port))?;

        Ok(Self { router, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .wrap_err("Failed to read listener address")
    }

    /// Runs the server until the process exits.
    pub async fn run(self) -> Result<()> {
        self.run_until(CancellationToken::new()).await
    }

    /// Runs the server until `ctx` is cancelled.
    pub async fn run_until(self, ctx: CancellationToken) -> Result<()> {
        tracing::info!("Server listening on {}", self.listener.local_addr()?);
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move { ctx.cancelled().await })
            .await?;
        Ok(())
    }
}
