//! Admin HTTP endpoint.
//!
//! `/health` is always open; `/status` requires `Authorization: Bearer <api_key>`
//! when `[admin].api_key` is set.

pub mod auth;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{middleware, routing::get, Router};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use self::auth::admin_auth_middleware;
use self::handlers::{get_health, get_status};
use crate::lifecycle::{Ares, Shutdown};

#[derive(Clone)]
pub struct AdminState {
    pub ares: Arc<Ares>,
}

pub fn admin_router(state: AdminState) -> Router {
    let protected = Router::new()
        .route("/status", get(get_status))
        .route_layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware));

    Router::new()
        .route("/health", get(get_health))
        .merge(protected)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Bind `addr` and serve until `shutdown`.
pub async fn serve(addr: SocketAddr, ares: Arc<Ares>, shutdown: Shutdown) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_on(listener, ares, shutdown).await
}

/// Serve on an already bound listener until `shutdown`.
pub async fn serve_on(listener: TcpListener, ares: Arc<Ares>, shutdown: Shutdown) -> std::io::Result<()> {
    tracing::info!(address = %listener.local_addr()?, "Admin endpoint listening");
    axum::serve(listener, admin_router(AdminState { ares }))
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;
    tracing::info!("Admin endpoint stopped");
    Ok(())
}
