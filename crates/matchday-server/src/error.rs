use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use matchday_core::error::MatchdayError;

// ---------------------------------------------------------------------------
// AppError: unified error type for HTTP responses
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn join(err: tokio::task::JoinError) -> Self {
        Self(anyhow::anyhow!("task join error: {err}"))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = if let Some(e) = self.0.downcast_ref::<MatchdayError>() {
            match e {
                MatchdayError::RecordNotFound(_) => StatusCode::NOT_FOUND,
                MatchdayError::InvalidTransition { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                MatchdayError::UnknownQueue(_) | MatchdayError::Config(_) => StatusCode::BAD_REQUEST,
                MatchdayError::TransientBackend(_) | MatchdayError::SessionSource(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                MatchdayError::WrongType(_)
                | MatchdayError::Ledger(_)
                | MatchdayError::Backend(_)
                | MatchdayError::RemediationFailure { .. }
                | MatchdayError::Io(_)
                | MatchdayError::Yaml(_)
                | MatchdayError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
            }
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };

        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
