use axum::extract::multipart::{Field, MultipartError};
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::{JobError, JobResult};
use crate::models::api::{CreateJobResponse, DownloadQuery, JobStatusResponse};
use crate::services::validation::{ImportRequest, UploadRequest, UploadedFile};

/// POST /api/upload — Upload an assignment and start essay generation.
pub async fn upload_essay(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> JobResult<Json<CreateJobResponse>> {
    let limit_mb = limit_mb(&state);
    let mut request = UploadRequest::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, limit_mb))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => request.file = Some(read_file(field, limit_mb).await?),
            "reference_images" => {
                let image = read_file(field, limit_mb).await?;
                // browsers send an empty part when no image was picked
                if !image.bytes.is_empty() {
                    request.reference_images.push(image);
                }
            }
            "humanization_intensity" => {
                let raw = read_text(field, limit_mb).await?;
                request.settings.humanization_intensity = raw.trim().parse().map_err(|_| {
                    JobError::Validation(format!("humanization_intensity '{raw}' is not a number"))
                })?;
            }
            "student_name" => {
                request.settings.student_name = non_empty(read_text(field, limit_mb).await?)
            }
            "course_name" => {
                request.settings.course_name = non_empty(read_text(field, limit_mb).await?)
            }
            "additional_prompt" => {
                request.settings.additional_prompt = non_empty(read_text(field, limit_mb).await?)
            }
            other => tracing::debug!(field = other, "Ignoring unknown upload field"),
        }
    }

    state.controller.create_from_upload(request).await.map(Json)
}

/// POST /api/import — Import an existing essay for review.
pub async fn import_essay(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> JobResult<Json<CreateJobResponse>> {
    let limit_mb = limit_mb(&state);
    let mut request = ImportRequest::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, limit_mb))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let file = read_file(field, limit_mb).await?;
                if !file.bytes.is_empty() {
                    request.file = Some(file);
                }
            }
            "text_content" => {
                request.text_content = non_empty(read_text(field, limit_mb).await?)
            }
            "refinement_instructions" => {
                request.refinement_instructions = non_empty(read_text(field, limit_mb).await?)
            }
            other => tracing::debug!(field = other, "Ignoring unknown import field"),
        }
    }

    state.controller.create_from_import(request).await.map(Json)
}

/// GET /api/task/{job_id} — Poll job status.
pub async fn task_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> JobResult<Json<JobStatusResponse>> {
    state.controller.status(job_id).await.map(Json)
}

/// GET /api/download/{job_id}?format=pdf|docx — Fetch a rendered essay.
pub async fn download_essay(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Query(query): Query<DownloadQuery>,
) -> JobResult<Response> {
    let artifact = state
        .controller
        .download(job_id, query.format.as_deref())
        .await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, artifact.format.content_type().to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", artifact.filename),
            ),
        ],
        artifact.bytes,
    )
        .into_response())
}

async fn read_file(field: Field<'_>, limit_mb: u64) -> JobResult<UploadedFile> {
    let filename = field.file_name().unwrap_or_default().to_string();
    let bytes = field
        .bytes()
        .await
        .map_err(|e| multipart_error(e, limit_mb))?;
    Ok(UploadedFile {
        filename,
        bytes: bytes.to_vec(),
    })
}

async fn read_text(field: Field<'_>, limit_mb: u64) -> JobResult<String> {
    field.text().await.map_err(|e| multipart_error(e, limit_mb))
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

fn limit_mb(state: &AppState) -> u64 {
    (state.controller.limits().max_upload_bytes / (1024 * 1024)) as u64
}

fn multipart_error(err: MultipartError, limit_mb: u64) -> JobError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        JobError::PayloadTooLarge { limit_mb }
    } else {
        JobError::Validation(format!("Malformed multipart body: {}", err.body_text()))
    }
}
