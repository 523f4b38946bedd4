use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::JobResult;
use crate::models::api::{CommandAccepted, RefineRequest, ReviewResponse};

/// GET /api/essay/{job_id}/review — Current essay awaiting review.
pub async fn get_review(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> JobResult<Json<ReviewResponse>> {
    state.controller.review(job_id).await.map(Json)
}

/// POST /api/essay/{job_id}/refine — Apply instructions to the essay.
pub async fn refine_essay(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Json(request): Json<RefineRequest>,
) -> JobResult<(StatusCode, Json<CommandAccepted>)> {
    let accepted = state
        .controller
        .refine(job_id, &request.instructions)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

/// POST /api/essay/{job_id}/finalize — Accept the essay and render documents.
pub async fn finalize_essay(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> JobResult<(StatusCode, Json<CommandAccepted>)> {
    let accepted = state.controller.finalize(job_id).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}
