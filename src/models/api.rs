use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::essay::{Essay, RefinementEntry};
use crate::models::job::{DocumentFormat, Job};
use crate::models::state::JobStatus;

/// Response after creating a job from an upload or import.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateJobResponse {
    pub job_id: Uuid,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

/// Polling snapshot of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    pub download_url: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Job> for JobStatusResponse {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status(),
            progress: job.progress,
            message: job.message.clone(),
            download_url: job.download_url().map(str::to_string),
            error: job.error().map(str::to_string),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

/// Full essay snapshot for the review screen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub essay: Essay,
    pub word_count: usize,
    pub refinement_history: Vec<RefinementEntry>,
    pub original_content: String,
}

impl From<&Job> for ReviewResponse {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status(),
            essay: job.essay.clone(),
            word_count: job.essay.word_count(),
            refinement_history: job.refinement_history.clone(),
            original_content: job.source_text.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RefineRequest {
    pub instructions: String,
}

/// Acknowledgement of a refine or finalize command.
#[derive(Debug, Serialize, Deserialize)]
pub struct CommandAccepted {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    #[serde(default)]
    pub format: Option<String>,
}

/// A rendered document ready to be served.
#[derive(Debug, Clone)]
pub struct DownloadArtifact {
    pub format: DocumentFormat,
    pub filename: String,
    pub bytes: Vec<u8>,
}
