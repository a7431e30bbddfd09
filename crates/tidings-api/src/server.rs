//! HTTP server configuration and request routing.
//!
//! Axum server setup with the middleware stack and graceful shutdown.
//! Requests flow through request-id injection, tracing, and timeout
//! enforcement before reaching the handlers.

use std::{net::SocketAddr, time::Duration};

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::{handlers, AppState, Config};

/// Creates the Axum router with all routes and middleware.
pub fn create_router(state: AppState, config: &Config) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route(
            "/manual/send-birthday-message",
            post(handlers::manual_send_birthday_message),
        )
        .with_state(state)
        .layer(TimeoutLayer::new(Duration::from_secs(config.request_timeout)))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
}

/// Middleware injecting a request id into all responses.
///
/// Adds an `X-Request-Id` header so requests can be correlated across
/// log lines and downstream events.
async fn inject_request_id(req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();

    let mut req = req;
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;

    if let Ok(header_value) = request_id.parse() {
        response.headers_mut().insert("X-Request-Id", header_value);
    }

    response
}

/// Starts the HTTP server, serving until shutdown is signalled.
///
/// # Errors
///
/// Returns `std::io::Error` if the port is in use or the interface is
/// unavailable.
pub async fn start_server(
    state: AppState,
    config: &Config,
    addr: SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = create_router(state, config);

    info!(%addr, "starting HTTP server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await
}
