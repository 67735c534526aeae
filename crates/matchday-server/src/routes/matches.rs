use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use matchday_core::ledger::ScheduledTaskRecord;
use matchday_core::scheduler::ScheduledEntry;
use serde::Deserialize;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ScheduleBody {
    pub kickoff: DateTime<Utc>,
}

/// POST /api/matches/{id}/schedule: record and submit the match's
/// reporting windows. Repeating the call does not duplicate work.
pub async fn schedule(
    State(app): State<AppState>,
    Path(match_id): Path<i64>,
    Json(body): Json<ScheduleBody>,
) -> Result<Json<Vec<ScheduledEntry>>, AppError> {
    let entries = app
        .blocking(move |s| s.scheduler.schedule_match(match_id, body.kickoff))
        .await?;
    Ok(Json(entries))
}

/// POST /api/matches/{id}/pause
pub async fn pause(
    State(app): State<AppState>,
    Path(match_id): Path<i64>,
) -> Result<Json<Vec<ScheduledTaskRecord>>, AppError> {
    let records = app
        .blocking(move |s| s.scheduler.pause_match(match_id))
        .await?;
    Ok(Json(records))
}

/// POST /api/matches/{id}/resume
pub async fn resume(
    State(app): State<AppState>,
    Path(match_id): Path<i64>,
) -> Result<Json<Vec<ScheduledTaskRecord>>, AppError> {
    let records = app
        .blocking(move |s| s.scheduler.resume_match(match_id))
        .await?;
    Ok(Json(records))
}

/// GET /api/matches/{id}/tasks: every ledger record for the match, any state.
pub async fn tasks(
    State(app): State<AppState>,
    Path(match_id): Path<i64>,
) -> Result<Json<Vec<ScheduledTaskRecord>>, AppError> {
    let records = app
        .blocking(move |s| s.ledger.list_for_subject(match_id))
        .await?;
    Ok(Json(records))
}
