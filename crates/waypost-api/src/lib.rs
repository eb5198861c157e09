pub mod handlers;

use std::net::SocketAddr;

use axum::extract::{DefaultBodyLimit, Request};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

pub use handlers::ApiState;

/// Client-facing routes. TLS is terminated in front of this.
pub fn router(state: ApiState, max_body_bytes: usize) -> Router {
    // Spans carry the path only. The query holds the server secret.
    let trace = TraceLayer::new_for_http().make_span_with(|req: &Request| {
        tracing::info_span!("request", method = %req.method(), path = %req.uri().path())
    });

    Router::new()
        .route("/handshake", get(handlers::handle_handshake))
        .route("/connected", get(handlers::handle_connected))
        .route("/failed", get(handlers::handle_failed))
        .route(
            "/status",
            get(handlers::handle_status).post(handlers::handle_status),
        )
        .route("/download", get(handlers::handle_download))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(trace)
        .with_state(state)
}

pub async fn serve(
    state: ApiState,
    listener: TcpListener,
    max_body_bytes: usize,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = router(state, max_body_bytes);
    tracing::info!(addr = %listener.local_addr()?, "web server listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.recv().await;
    })
    .await?;
    Ok(())
}
