//! Operator endpoints that run a maintenance pass on demand instead of
//! waiting for its periodic loop.

use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::Json;
use matchday_core::ledger::ScheduledTaskRecord;
use matchday_core::queue_health::QueueSummary;
use matchday_core::reconcile::ReconciliationReport;
use matchday_core::recovery::RecoveryReport;

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/queues: depths only, no remediation.
pub async fn summary(State(app): State<AppState>) -> Result<Json<QueueSummary>, AppError> {
    let summary = app.blocking(|s| s.queue_health.get_summary()).await?;
    Ok(Json(summary))
}

/// POST /api/recover: one emergency recovery run. A no-op report comes
/// back when the trigger is not met.
pub async fn recover(State(app): State<AppState>) -> Result<Json<RecoveryReport>, AppError> {
    let report = app.blocking(|s| s.recovery.run()).await?;
    Ok(Json(report))
}

/// POST /api/reconcile: sweep every subject with an active record.
pub async fn reconcile_all(
    State(app): State<AppState>,
) -> Result<Json<BTreeMap<i64, ReconciliationReport>>, AppError> {
    let reports = app.blocking(|s| s.reconciliation.sweep()).await?;
    Ok(Json(reports))
}

/// POST /api/reconcile/{id}
pub async fn reconcile_match(
    State(app): State<AppState>,
    Path(match_id): Path<i64>,
) -> Result<Json<ReconciliationReport>, AppError> {
    let report = app
        .blocking(move |s| s.reconciliation.verify(match_id))
        .await?;
    Ok(Json(report))
}

/// GET /api/ledger: every active record.
pub async fn active_records(
    State(app): State<AppState>,
) -> Result<Json<Vec<ScheduledTaskRecord>>, AppError> {
    let records = app.blocking(|s| s.ledger.list_active()).await?;
    Ok(Json(records))
}
