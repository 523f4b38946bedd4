use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use uuid::Uuid;

use crate::models::state::JobStatus;
use crate::store::StoreError;

/// Errors returned synchronously to API callers.
///
/// Executor failures never appear here; the dispatcher consumes them and
/// they surface only through the job's `failed` status.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("File size exceeds maximum limit of {limit_mb}MB")]
    PayloadTooLarge { limit_mb: u64 },

    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Job with ID '{0}' not found")]
    NotFound(Uuid),

    #[error("Job {job_id} is {status}; this command requires {expected}")]
    InvalidState {
        job_id: Uuid,
        status: JobStatus,
        expected: &'static str,
    },

    #[error("A refinement is already in progress for job {0}")]
    AlreadyInProgress(Uuid),

    #[error("Job {job_id} is {status}; documents are available once it is completed")]
    NotReady { job_id: Uuid, status: JobStatus },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type JobResult<T> = Result<T, JobError>;

impl JobError {
    fn code(&self) -> &'static str {
        match self {
            JobError::Validation(_) => "VALIDATION_ERROR",
            JobError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            JobError::UnsupportedMediaType(_) => "UNSUPPORTED_MEDIA_TYPE",
            JobError::NotFound(_) => "NOT_FOUND",
            JobError::InvalidState { .. } => "INVALID_STATE",
            JobError::AlreadyInProgress(_) => "ALREADY_IN_PROGRESS",
            JobError::NotReady { .. } => "NOT_READY",
            JobError::Store(_) => "INTERNAL_ERROR",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            JobError::Validation(_) => StatusCode::BAD_REQUEST,
            JobError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            JobError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            JobError::NotFound(_) => StatusCode::NOT_FOUND,
            JobError::InvalidState { .. }
            | JobError::AlreadyInProgress(_)
            | JobError::NotReady { .. } => StatusCode::CONFLICT,
            JobError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for JobError {
    fn into_response(self) -> Response {
        let message = match &self {
            JobError::Store(err) => {
                tracing::error!(error = %err, "Job store error");
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        };

        let body = json!({
            "error": message,
            "code": self.code(),
        });

        (self.status_code(), axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_errors_map_to_conflict() {
        let id = Uuid::new_v4();
        let err = JobError::InvalidState {
            job_id: id,
            status: JobStatus::Writing,
            expected: "waiting_for_review",
        };
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert!(err.to_string().contains("is writing"));
        assert_eq!(
            JobError::AlreadyInProgress(id).status_code(),
            StatusCode::CONFLICT
        );
        let not_ready = JobError::NotReady {
            job_id: id,
            status: JobStatus::Formatting,
        };
        assert_eq!(not_ready.code(), "NOT_READY");
        assert_eq!(not_ready.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_store_errors_are_sanitized() {
        let response = JobError::Store(StoreError::NotFound(Uuid::new_v4())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_validation_errors_are_bad_request() {
        let err = JobError::Validation("text_content: too short".to_string());
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            JobError::PayloadTooLarge { limit_mb: 10 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }
}
