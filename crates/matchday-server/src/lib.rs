pub mod dispatcher;
pub mod error;
pub mod periodic;
pub mod routes;
pub mod state;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use matchday_core::services::Services;
use tower_http::trace::TraceLayer;

/// Build the axum Router with all routes and middleware.
/// Used by `serve_on()` and available for integration testing.
pub fn build_router(app_state: state::AppState) -> Router {
    Router::new()
        // Health
        .route("/health", get(routes::health::health))
        .route("/health/queues", get(routes::health::queues))
        .route("/health/workers", get(routes::health::workers))
        .route("/health/combined", get(routes::health::combined))
        .route("/health/orchestrator", get(routes::health::orchestrator))
        // Matches
        .route(
            "/api/matches/{id}/schedule",
            post(routes::matches::schedule),
        )
        .route("/api/matches/{id}/pause", post(routes::matches::pause))
        .route("/api/matches/{id}/resume", post(routes::matches::resume))
        .route("/api/matches/{id}/tasks", get(routes::matches::tasks))
        // Operations
        .route("/api/queues", get(routes::ops::summary))
        .route("/api/ledger", get(routes::ops::active_records))
        .route("/api/recover", post(routes::ops::recover))
        .route("/api/reconcile", post(routes::ops::reconcile_all))
        .route("/api/reconcile/{id}", post(routes::ops::reconcile_match))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Serve on a pre-bound listener, running the dispatcher and the periodic
/// loops alongside the HTTP surface until ctrl-c.
pub async fn serve_on(services: Arc<Services>, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    let app_state = state::AppState::new(services.clone());

    let mut background = periodic::spawn_all(services.clone(), app_state.worker_id.clone());
    background.push(dispatcher::Dispatcher::new(services, app_state.worker_id.clone()).spawn());

    tracing::info!(%addr, worker = %app_state.worker_id, "matchday server listening");

    let app = build_router(app_state);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "cannot listen for shutdown signal");
            }
        })
        .await;

    for task in &background {
        task.abort();
    }
    tracing::info!("matchday server stopped");
    served?;
    Ok(())
}

/// Bind `host:port` and serve.
pub async fn serve(services: Arc<Services>, host: &str, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    serve_on(services, listener).await
}
