//! HTTP servers for the GPU and runtime metrics endpoints.

use std::net::SocketAddr;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::collector::SharedCollector;

const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    collector: SharedCollector,
    metrics_path: String,
}

/// Create the router for GPU metrics.
///
/// Every request to the metrics path runs one collection cycle.
pub fn create_router(collector: SharedCollector, metrics_path: &str) -> Router {
    let state = AppState {
        collector,
        metrics_path: metrics_path.to_string(),
    };

    Router::new()
        .route(metrics_path, get(metrics_handler))
        .route("/", get(gpu_index_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Create the router for the exporter's own metrics.
pub fn create_runtime_router(collector: SharedCollector, metrics_path: &str) -> Router {
    let state = AppState {
        collector,
        metrics_path: metrics_path.to_string(),
    };

    Router::new()
        .route(metrics_path, get(runtime_metrics_handler))
        .route("/", get(runtime_index_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Handler for the GPU metrics endpoint.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    let body = state.collector.scrape().await;

    (StatusCode::OK, [("content-type", CONTENT_TYPE)], body).into_response()
}

/// Handler for the runtime metrics endpoint.
async fn runtime_metrics_handler(State(state): State<AppState>) -> Response {
    let body = state.collector.render_runtime();

    (StatusCode::OK, [("content-type", CONTENT_TYPE)], body).into_response()
}

async fn gpu_index_handler(State(state): State<AppState>) -> Html<String> {
    index_page("AMD SMI Exporter", "AMD GPU Metrics", &state.metrics_path)
}

async fn runtime_index_handler(State(state): State<AppState>) -> Html<String> {
    index_page(
        "AMD SMI Exporter Runtime",
        "Exporter Runtime Metrics",
        &state.metrics_path,
    )
}

fn index_page(title: &str, link_text: &str, metrics_path: &str) -> Html<String> {
    Html(format!(
        "<html>\n\
         <head><title>{title}</title></head>\n\
         <body>\n\
         <h1>{title}</h1>\n\
         <p><a href=\"{metrics_path}\">{link_text}</a></p>\n\
         </body>\n\
         </html>\n"
    ))
}

/// Handler for the /health endpoint.
async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

/// Handler for the /ready endpoint.
async fn ready_handler(State(state): State<AppState>) -> Response {
    let stats = state.collector.stats();

    // Ready once amd-smi has produced at least one usable document
    if stats.successful_scrapes() > 0 {
        (StatusCode::OK, "ready\n").into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "not ready - no successful collection yet\n",
        )
            .into_response()
    }
}

/// HTTP server configuration.
pub struct HttpServer {
    name: &'static str,
    router: Router,
    listen_addr: SocketAddr,
    metrics_path: String,
}

impl HttpServer {
    /// Create the GPU metrics server.
    pub fn new(collector: SharedCollector, listen_addr: SocketAddr, metrics_path: String) -> Self {
        Self {
            name: "gpu",
            router: create_router(collector, &metrics_path),
            listen_addr,
            metrics_path,
        }
    }

    /// Create the runtime metrics server.
    pub fn runtime(
        collector: SharedCollector,
        listen_addr: SocketAddr,
        metrics_path: String,
    ) -> Self {
        Self {
            name: "runtime",
            router: create_runtime_router(collector, &metrics_path),
            listen_addr,
            metrics_path,
        }
    }

    /// Run the HTTP server until the shutdown signal is received.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;

        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until the shutdown signal is received.
    pub async fn serve(
        self,
        listener: tokio::net::TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let name = self.name;
        let addr = listener.local_addr().unwrap_or(self.listen_addr);

        info!(
            server = name,
            addr = %addr,
            path = %self.metrics_path,
            "HTTP server listening"
        );

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                loop {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!(server = name, "HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!(server = name, "HTTP server stopped");
        Ok(())
    }
}
