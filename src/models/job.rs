use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::essay::{Essay, RefinementEntry, ResearchBrief};
use crate::models::state::{transition, Event, Flow, InvalidTransition, JobState, JobStatus};

/// Document format accepted on upload and produced on download.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DocumentFormat {
    Pdf,
    Docx,
}

impl DocumentFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            DocumentFormat::Pdf => "application/pdf",
            DocumentFormat::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
        }
    }

    /// Infer the format from a filename extension.
    pub fn from_filename(filename: &str) -> Option<Self> {
        let (_, ext) = filename.rsplit_once('.')?;
        ext.parse().ok()
    }
}

/// Where the job's source text comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceDocument {
    /// An uploaded file; its bytes live in the job store's blob area.
    File {
        filename: String,
        file_type: DocumentFormat,
        file_size: u64,
    },
    /// Pasted text, kept inline.
    Text { content: String },
}

impl SourceDocument {
    /// Stem used to name downloaded artifacts.
    pub fn output_stem(&self) -> &str {
        match self {
            SourceDocument::File { filename, .. } => filename
                .rsplit_once('.')
                .map(|(stem, _)| stem)
                .filter(|stem| !stem.is_empty())
                .unwrap_or(filename),
            SourceDocument::Text { .. } => "essay",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanizationSettings {
    /// 0.0 (light touch) to 1.0 (aggressive rewrite).
    pub intensity: f64,
    pub preserve_citations: bool,
    pub vary_sentence_length: bool,
    pub add_transitional_phrases: bool,
}

impl Default for HumanizationSettings {
    fn default() -> Self {
        Self {
            intensity: 0.5,
            preserve_citations: true,
            vary_sentence_length: true,
            add_transitional_phrases: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EssaySettings {
    pub humanization: HumanizationSettings,
    pub student_name: Option<String>,
    pub course_name: Option<String>,
    pub additional_prompt: Option<String>,
}

/// A reference image attached on upload. Bytes live in the blob area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceImage {
    pub index: usize,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInputs {
    pub source: SourceDocument,
    #[serde(default)]
    pub settings: EssaySettings,
    #[serde(default)]
    pub reference_images: Vec<ReferenceImage>,
    pub refinement_instructions: Option<String>,
}

/// Binary payloads stored alongside a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobKind {
    Source,
    ReferenceImage(usize),
    Artifact(DocumentFormat),
}

impl BlobKind {
    pub fn key_suffix(self) -> String {
        match self {
            BlobKind::Source => "source".to_string(),
            BlobKind::ReferenceImage(i) => format!("ref_image:{i}"),
            BlobKind::Artifact(format) => format.to_string(),
        }
    }
}

/// Lease currently held on a job by a worker, as recorded in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub token: Uuid,
    pub worker_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Ownership token for one claimed job.
///
/// Only a [`JobStore`](crate::store::JobStore) hands these out, and only to
/// one worker per job at a time. Holding one is the
/// sole way a worker may advance an automatic stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    job_id: Uuid,
    token: Uuid,
    worker_id: String,
}

impl Lease {
    pub(crate) fn grant(job_id: Uuid, worker_id: &str) -> Self {
        Self {
            job_id,
            token: Uuid::new_v4(),
            worker_id: worker_id.to_string(),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn token(&self) -> Uuid {
        self.token
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: JobStatus,
    pub at: DateTime<Utc>,
}

/// One end-to-end essay job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub flow: Flow,
    pub state: JobState,
    pub progress: u8,
    pub message: String,
    pub inputs: JobInputs,
    #[serde(default)]
    pub essay: Essay,
    /// Text produced by the extractor, including reference image analysis.
    pub source_text: Option<String>,
    pub research: Option<ResearchBrief>,
    #[serde(default)]
    pub refinement_history: Vec<RefinementEntry>,
    /// Formats rendered from the frozen essay.
    #[serde(default)]
    pub artifacts: Vec<DocumentFormat>,
    pub frozen_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history: Vec<StatusChange>,
    /// Failed attempts at the current stage.
    #[serde(default)]
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Earliest time a failed stage may be claimed again.
    pub retry_at: Option<DateTime<Utc>>,
    pub claim: Option<Claim>,
    /// Bumped by the store on every write; used for compare-and-set.
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(flow: Flow, inputs: JobInputs) -> Self {
        let now = Utc::now();
        let state = JobState::Pending;
        Self {
            id: Uuid::new_v4(),
            flow,
            message: state.default_message(),
            progress: flow.progress(state.status()),
            state,
            inputs,
            essay: Essay::default(),
            source_text: None,
            research: None,
            refinement_history: Vec::new(),
            artifacts: Vec::new(),
            frozen_at: None,
            history: vec![StatusChange {
                status: JobStatus::Pending,
                at: now,
            }],
            attempts: 0,
            last_error: None,
            retry_at: None,
            claim: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.state.status()
    }

    /// Apply `event` through the transition table, resetting per-stage
    /// retry bookkeeping and refreshing progress and message.
    pub fn apply(&mut self, event: Event) -> Result<(), InvalidTransition> {
        let next = transition(self.flow, &self.state, event)?;
        let now = Utc::now();

        if next.status() == JobStatus::Formatting {
            self.frozen_at = Some(now);
        }
        self.message = next.default_message();
        self.progress = self.flow.progress(next.status());
        self.history.push(StatusChange {
            status: next.status(),
            at: now,
        });
        self.state = next;
        self.attempts = 0;
        self.retry_at = None;
        if !matches!(self.state, JobState::Failed { .. }) {
            self.last_error = None;
        }
        self.updated_at = now;
        Ok(())
    }

    /// Whether a worker may claim this job at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status().is_auto()
            && self.claim.as_ref().map_or(true, |c| c.expires_at <= now)
            && self.retry_at.map_or(true, |t| t <= now)
    }

    pub fn download_url(&self) -> Option<&str> {
        self.state.download_url()
    }

    pub fn error(&self) -> Option<&str> {
        self.state.error()
    }

    pub fn download_filename(&self, format: DocumentFormat) -> String {
        format!("{}_essay.{}", self.inputs.source.output_stem(), format)
    }
}
