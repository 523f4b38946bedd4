use serde::{Deserialize, Serialize};

/// Flat status reported to clients. Derived from [`JobState`].
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
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Extracting,
    Researching,
    Writing,
    Humanizing,
    WaitingForReview,
    Refining,
    Formatting,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Statuses the worker pool advances on its own. `waiting_for_review`
    /// only moves on a controller command.
    pub fn is_auto(self) -> bool {
        !self.is_terminal() && self != JobStatus::WaitingForReview
    }

    /// The executor stage that runs while a job sits in this status.
    pub fn stage(self) -> Option<Stage> {
        match self {
            JobStatus::Extracting => Some(Stage::Extract),
            JobStatus::Researching => Some(Stage::Research),
            JobStatus::Writing => Some(Stage::Write),
            JobStatus::Humanizing => Some(Stage::Humanize),
            JobStatus::Refining => Some(Stage::Refine),
            JobStatus::Formatting => Some(Stage::Format),
            JobStatus::Pending
            | JobStatus::WaitingForReview
            | JobStatus::Completed
            | JobStatus::Failed => None,
        }
    }
}

/// One named phase of processing, each backed by a stage executor.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Extract,
    Research,
    Write,
    Humanize,
    Refine,
    Format,
}

/// Which entry point created the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Flow {
    /// Upload an assignment and generate a finished essay.
    Create,
    /// Import an existing essay and park it for review.
    Import,
}

impl Flow {
    /// Ordered statuses that count towards progress for this flow.
    pub fn stages(self) -> &'static [JobStatus] {
        match self {
            Flow::Create => &[
                JobStatus::Extracting,
                JobStatus::Researching,
                JobStatus::Writing,
                JobStatus::Humanizing,
                JobStatus::Formatting,
            ],
            Flow::Import => &[
                JobStatus::Extracting,
                JobStatus::WaitingForReview,
                JobStatus::Formatting,
            ],
        }
    }

    /// Advisory percentage for `status` within this flow.
    pub fn progress(self, status: JobStatus) -> u8 {
        let status = match status {
            JobStatus::Pending | JobStatus::Failed => return 0,
            JobStatus::Completed => return 100,
            // refining is a sub-cycle of review and reports the same ordinal
            JobStatus::Refining => JobStatus::WaitingForReview,
            other => other,
        };
        let stages = self.stages();
        match stages.iter().position(|s| *s == status) {
            Some(index) => ((index + 1) * 100 / (stages.len() + 1)) as u8,
            None => 0,
        }
    }
}

/// Lifecycle state of a job.
///
/// Data that only exists in a given state lives on the variant: pending
/// refine instructions on `Refining`, the download link on `Completed`, the
/// failure cause on `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Extracting,
    Researching,
    Writing,
    Humanizing,
    WaitingForReview,
    Refining { instructions: String },
    Formatting,
    Completed { download_url: String },
    Failed { error: String },
}

impl JobState {
    pub fn status(&self) -> JobStatus {
        match self {
            JobState::Pending => JobStatus::Pending,
            JobState::Extracting => JobStatus::Extracting,
            JobState::Researching => JobStatus::Researching,
            JobState::Writing => JobStatus::Writing,
            JobState::Humanizing => JobStatus::Humanizing,
            JobState::WaitingForReview => JobStatus::WaitingForReview,
            JobState::Refining { .. } => JobStatus::Refining,
            JobState::Formatting => JobStatus::Formatting,
            JobState::Completed { .. } => JobStatus::Completed,
            JobState::Failed { .. } => JobStatus::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn download_url(&self) -> Option<&str> {
        match self {
            JobState::Completed { download_url } => Some(download_url),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            JobState::Failed { error } => Some(error),
            _ => None,
        }
    }

    /// Activity line shown to the client on entering this state.
    pub fn default_message(&self) -> String {
        match self {
            JobState::Pending => "Job created, waiting to start...".to_string(),
            JobState::Extracting => "Extracting document text...".to_string(),
            JobState::Researching => "Analyzing requirements...".to_string(),
            JobState::Writing => "Writing essay draft...".to_string(),
            JobState::Humanizing => "Humanizing essay content...".to_string(),
            JobState::WaitingForReview => "Ready for review".to_string(),
            JobState::Refining { .. } => "Refining essay...".to_string(),
            JobState::Formatting => "Generating PDF and DOCX documents...".to_string(),
            JobState::Completed { .. } => "Essay generation complete!".to_string(),
            JobState::Failed { .. } => "Processing failed".to_string(),
        }
    }
}

/// Something that happened to a job, fed to [`transition`].
#[derive(Debug, Clone, PartialEq, Eq, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Event {
    /// The dispatcher claimed a pending job.
    Picked,
    Extracted,
    Researched,
    Drafted,
    Humanized,
    Refined,
    Rendered { download_url: String },
    RefineRequested { instructions: String },
    FinalizeRequested,
    /// A stage exhausted its retry budget.
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no transition from {from} on {event}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub event: String,
}

/// The job transition table. Every edge a job may take is listed here.
pub fn transition(flow: Flow, from: &JobState, event: Event) -> Result<JobState, InvalidTransition> {
    let next = match (from, event) {
        (JobState::Pending, Event::Picked) => JobState::Extracting,
        (JobState::Extracting, Event::Extracted) => match flow {
            Flow::Create => JobState::Researching,
            Flow::Import => JobState::WaitingForReview,
        },
        (JobState::Researching, Event::Researched) if flow == Flow::Create => JobState::Writing,
        (JobState::Writing, Event::Drafted) if flow == Flow::Create => JobState::Humanizing,
        (JobState::Humanizing, Event::Humanized) if flow == Flow::Create => JobState::Formatting,
        (JobState::WaitingForReview, Event::RefineRequested { instructions }) => {
            JobState::Refining { instructions }
        }
        (JobState::Refining { .. }, Event::Refined) => JobState::WaitingForReview,
        (JobState::WaitingForReview, Event::FinalizeRequested) => JobState::Formatting,
        (JobState::Formatting, Event::Rendered { download_url }) => {
            JobState::Completed { download_url }
        }
        (state, Event::Failed { error }) if !state.is_terminal() => JobState::Failed { error },
        (state, event) => {
            return Err(InvalidTransition {
                from: state.status(),
                event: event.as_ref().to_string(),
            })
        }
    };
    Ok(next)
}

/// Whether `from -> to` is an edge of the table for `flow`.
pub fn is_edge(flow: Flow, from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    if to == Failed {
        return !from.is_terminal();
    }
    match (from, to) {
        (Pending, Extracting) => true,
        (Extracting, Researching) => flow == Flow::Create,
        (Extracting, WaitingForReview) => flow == Flow::Import,
        (Researching, Writing) | (Writing, Humanizing) | (Humanizing, Formatting) => {
            flow == Flow::Create
        }
        (WaitingForReview, Refining) | (Refining, WaitingForReview) => true,
        (WaitingForReview, Formatting) => true,
        (Formatting, Completed) => true,
        _ => false,
    }
}
