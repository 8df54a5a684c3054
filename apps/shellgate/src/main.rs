mod audit;
mod config;
mod error;
mod handlers;
mod protocol;
mod recorder;
mod registry;
mod relay;
mod ssh;
mod terminal;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::handlers::{health_check, login, logout, AppState};
use crate::registry::SessionRegistry;
use crate::terminal::terminal_handler;

#[tokio::main]
async fn main() {
    // Default to INFO level if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    info!("starting shellgate on port {}", config.port);
    info!(
        "recording: {} (path: {}), audit logs: {}",
        config.record, config.record_path, config.audit_log_dir
    );

    let state = AppState {
        registry: Arc::new(SessionRegistry::new()),
        config: Arc::new(config.clone()),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/api/login", post(login))
        .route("/api/logout", get(logout))
        .route("/terminal", get(terminal_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    info!("shellgate listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Failed to start server");
}
