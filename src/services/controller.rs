//! Entry points that create jobs and drive the review cycle.
//!
//! Creation returns as soon as the job is durably inserted; all processing
//! happens later on the worker pool. Review commands are compare-and-set
//! transitions on the stored job, so at most one of two racing commands
//! wins.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::{JobError, JobResult};
use crate::models::api::{
    CommandAccepted, CreateJobResponse, DownloadArtifact, JobStatusResponse, ReviewResponse,
};
use crate::models::job::{
    BlobKind, DocumentFormat, EssaySettings, HumanizationSettings, Job, JobInputs, ReferenceImage,
    SourceDocument,
};
use crate::models::state::{Event, Flow, JobStatus};
use crate::services::dispatcher::DispatchSignal;
use crate::services::validation::{
    self, ImportRequest, UploadLimits, UploadRequest, UploadSettings, UploadedFile,
};
use crate::store::{JobStore, StoreError};

/// Imports whose instructions are longer than this are refined right away.
const MIN_INITIAL_INSTRUCTION_CHARS: usize = 5;

/// Re-reads allowed when a review command loses a compare-and-set race.
const COMMAND_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct JobController {
    store: Arc<dyn JobStore>,
    signal: DispatchSignal,
    limits: UploadLimits,
}

impl JobController {
    pub fn new(store: Arc<dyn JobStore>, signal: DispatchSignal, limits: UploadLimits) -> Self {
        Self {
            store,
            signal,
            limits,
        }
    }

    pub fn limits(&self) -> &UploadLimits {
        &self.limits
    }

    /// Create-flow entry: upload an assignment and generate an essay.
    pub async fn create_from_upload(&self, request: UploadRequest) -> JobResult<CreateJobResponse> {
        let file = request
            .file
            .as_ref()
            .ok_or_else(|| JobError::Validation("No file provided".to_string()))?;
        let file_type = validation::validate_document(file, &self.limits)?;
        let image_types = validation::validate_upload(&request, &self.limits)?;

        let inputs = JobInputs {
            source: SourceDocument::File {
                filename: file.filename.clone(),
                file_type,
                file_size: file.bytes.len() as u64,
            },
            settings: essay_settings(&request.settings),
            reference_images: image_types
                .iter()
                .enumerate()
                .map(|(index, mime_type)| ReferenceImage {
                    index,
                    mime_type: mime_type.to_string(),
                })
                .collect(),
            refinement_instructions: None,
        };
        let mut job = Job::new(Flow::Create, inputs);

        self.store
            .put_blob(job.id, BlobKind::Source, &file.bytes)
            .await?;
        for (index, image) in request.reference_images.iter().enumerate() {
            self.store
                .put_blob(job.id, BlobKind::ReferenceImage(index), &image.bytes)
                .await?;
        }
        self.insert(&mut job).await?;

        tracing::info!(
            job_id = %job.id,
            filename = %file.filename,
            file_size = file.bytes.len(),
            reference_images = image_types.len(),
            "Essay job created from upload"
        );

        Ok(CreateJobResponse {
            job_id: job.id,
            message: "File uploaded successfully. Processing started.".to_string(),
            filename: Some(file.filename.clone()),
            file_size: Some(file.bytes.len() as u64),
        })
    }

    /// Import-flow entry: structure an existing essay and park it for review.
    pub async fn create_from_import(&self, request: ImportRequest) -> JobResult<CreateJobResponse> {
        let instructions = request
            .refinement_instructions
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(validation::validate_instructions)
            .transpose()?
            .map(str::to_string);

        let text = request
            .text_content
            .as_deref()
            .filter(|text| !text.trim().is_empty());

        let (source, file): (SourceDocument, Option<&UploadedFile>) = match (&request.file, text) {
            (Some(file), None) => {
                let file_type = validation::validate_document(file, &self.limits)?;
                let source = SourceDocument::File {
                    filename: file.filename.clone(),
                    file_type,
                    file_size: file.bytes.len() as u64,
                };
                (source, Some(file))
            }
            (None, Some(text)) => {
                validation::validate_import_text(text, &self.limits)?;
                let source = SourceDocument::Text {
                    content: text.to_string(),
                };
                (source, None)
            }
            (Some(_), Some(_)) => {
                return Err(JobError::Validation(
                    "Provide either a file or text content, not both".to_string(),
                ))
            }
            (None, None) => {
                return Err(JobError::Validation(
                    "Either a file or text content is required".to_string(),
                ))
            }
        };

        let mut job = Job::new(
            Flow::Import,
            JobInputs {
                source,
                settings: EssaySettings::default(),
                reference_images: Vec::new(),
                refinement_instructions: instructions,
            },
        );

        if let Some(file) = file {
            self.store
                .put_blob(job.id, BlobKind::Source, &file.bytes)
                .await?;
        }
        self.insert(&mut job).await?;

        tracing::info!(
            job_id = %job.id,
            from_file = file.is_some(),
            has_instructions = job.inputs.refinement_instructions.is_some(),
            "Essay job created from import"
        );

        Ok(CreateJobResponse {
            job_id: job.id,
            message: "Essay imported successfully. Processing started.".to_string(),
            filename: file.map(|f| f.filename.clone()),
            file_size: file.map(|f| f.bytes.len() as u64),
        })
    }

    pub async fn status(&self, job_id: Uuid) -> JobResult<JobStatusResponse> {
        let job = self.load(job_id).await?;
        Ok(JobStatusResponse::from(&job))
    }

    /// The reviewable essay. Readable while parked for review and while a
    /// refinement is running.
    pub async fn review(&self, job_id: Uuid) -> JobResult<ReviewResponse> {
        let job = self.load(job_id).await?;
        match job.status() {
            JobStatus::WaitingForReview | JobStatus::Refining => Ok(ReviewResponse::from(&job)),
            status => Err(JobError::InvalidState {
                job_id,
                status,
                expected: "waiting_for_review",
            }),
        }
    }

    pub async fn refine(&self, job_id: Uuid, instructions: &str) -> JobResult<CommandAccepted> {
        let instructions = validation::validate_instructions(instructions)?;
        let job = submit_refinement(self.store.as_ref(), job_id, instructions).await?;
        self.signal.wake();

        tracing::info!(job_id = %job_id, "Refinement requested");
        Ok(CommandAccepted {
            job_id,
            status: job.status(),
            message: "Refinement started".to_string(),
        })
    }

    pub async fn finalize(&self, job_id: Uuid) -> JobResult<CommandAccepted> {
        let job = run_command(self.store.as_ref(), job_id, |status| match status {
            JobStatus::WaitingForReview => Ok(Event::FinalizeRequested),
            status => Err(JobError::InvalidState {
                job_id,
                status,
                expected: "waiting_for_review",
            }),
        })
        .await?;
        self.signal.wake();

        tracing::info!(job_id = %job_id, "Finalization requested");
        Ok(CommandAccepted {
            job_id,
            status: job.status(),
            message: "Finalization started".to_string(),
        })
    }

    /// Rendered document for a completed job. `format` defaults to PDF.
    pub async fn download(&self, job_id: Uuid, format: Option<&str>) -> JobResult<DownloadArtifact> {
        let format = match format {
            None => DocumentFormat::Pdf,
            Some(raw) => raw
                .parse::<DocumentFormat>()
                .map_err(|_| JobError::Validation(format!("Unsupported format '{raw}'")))?,
        };

        let job = self.load(job_id).await?;
        if job.status() != JobStatus::Completed {
            return Err(JobError::NotReady {
                job_id,
                status: job.status(),
            });
        }

        let bytes = self
            .store
            .get_blob(job_id, BlobKind::Artifact(format))
            .await?
            .ok_or(JobError::NotFound(job_id))?;

        Ok(DownloadArtifact {
            format,
            filename: job.download_filename(format),
            bytes,
        })
    }

    async fn load(&self, job_id: Uuid) -> JobResult<Job> {
        self.store
            .get(job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))
    }

    async fn insert(&self, job: &mut Job) -> JobResult<()> {
        self.store.insert(job).await?;
        metrics::counter!("essay_jobs_created_total", "flow" => job.flow.to_string()).increment(1);
        self.signal.wake();
        Ok(())
    }
}

fn essay_settings(settings: &UploadSettings) -> EssaySettings {
    let trimmed = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    EssaySettings {
        humanization: HumanizationSettings {
            intensity: settings.humanization_intensity,
            ..HumanizationSettings::default()
        },
        student_name: trimmed(&settings.student_name),
        course_name: trimmed(&settings.course_name),
        additional_prompt: trimmed(&settings.additional_prompt),
    }
}

/// Whether instructions supplied with an import trigger a first refinement.
pub fn wants_initial_refinement(instructions: &str) -> bool {
    instructions.trim().chars().count() > MIN_INITIAL_INSTRUCTION_CHARS
}

/// Move a job parked for review into `refining` with `instructions`.
///
/// Fails with `AlreadyInProgress` if a refinement is running, including one
/// that won a concurrent race for the same job.
pub async fn submit_refinement(
    store: &dyn JobStore,
    job_id: Uuid,
    instructions: &str,
) -> JobResult<Job> {
    run_command(store, job_id, |status| match status {
        JobStatus::WaitingForReview => Ok(Event::RefineRequested {
            instructions: instructions.to_string(),
        }),
        JobStatus::Refining => Err(JobError::AlreadyInProgress(job_id)),
        status => Err(JobError::InvalidState {
            job_id,
            status,
            expected: "waiting_for_review",
        }),
    })
    .await
}

/// Read, decide, and compare-and-set one controller transition, re-reading
/// when another writer got there first.
async fn run_command<F>(store: &dyn JobStore, job_id: Uuid, decide: F) -> JobResult<Job>
where
    F: Fn(JobStatus) -> JobResult<Event>,
{
    let mut last_conflict = None;
    for _ in 0..COMMAND_ATTEMPTS {
        let mut job = store
            .get(job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))?;

        let event = decide(job.status())?;
        job.apply(event).map_err(|e| JobError::InvalidState {
            job_id,
            status: e.from,
            expected: "waiting_for_review",
        })?;

        match store.replace(&mut job).await {
            Ok(()) => return Ok(job),
            Err(StoreError::Conflict(id)) => {
                tracing::debug!(job_id = %id, "Command lost a race, re-reading job");
                last_conflict = Some(StoreError::Conflict(id));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(last_conflict
        .unwrap_or(StoreError::Conflict(job_id))
        .into())
}
