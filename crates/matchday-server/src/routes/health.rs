use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use matchday_core::health::CombinedHealth;
use matchday_core::heartbeat::WorkerHealth;
use matchday_core::orchestrator::OrchestratorHealth;
use matchday_core::queue_health::QueueHealthReport;

use crate::error::AppError;
use crate::state::AppState;

/// GET /health: liveness of the shared store. 503 when it cannot be reached.
pub async fn health(State(app): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    match app.blocking(|s| s.store.ping()).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "status": "up" }))),
        Err(e) => {
            tracing::warn!(error = %e.0, "store ping failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "status": "down", "error": e.0.to_string() })),
            )
        }
    }
}

/// GET /health/queues: classify every queue and remediate as needed.
pub async fn queues(State(app): State<AppState>) -> Result<Json<QueueHealthReport>, AppError> {
    let report = app.blocking(|s| Ok(s.queue_health.check_health())).await?;
    Ok(Json(report))
}

/// GET /health/workers
pub async fn workers(State(app): State<AppState>) -> Result<Json<WorkerHealth>, AppError> {
    let health = app.blocking(|s| Ok(s.worker_health())).await?;
    Ok(Json(health))
}

/// GET /health/combined: read-only; never remediates.
pub async fn combined(State(app): State<AppState>) -> Result<Json<CombinedHealth>, AppError> {
    let health = app.blocking(|s| Ok(s.combined_health())).await?;
    Ok(Json(health))
}

/// GET /health/orchestrator
pub async fn orchestrator(
    State(app): State<AppState>,
) -> Result<Json<OrchestratorHealth>, AppError> {
    let health = app.blocking(|s| Ok(s.orchestrator.health_check())).await?;
    Ok(Json(health))
}
