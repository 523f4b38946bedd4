//! Stage executors: one thin adapter per stage around a collaborator call.
//!
//! Executors read the job and return a [`StageOutput`]; they never write the
//! job or its status. The dispatcher merges the output and applies the
//! transition, so a retried executor cannot leave partial content behind.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;

use crate::models::essay::{Essay, ResearchBrief};
use crate::models::job::{BlobKind, DocumentFormat, Job, SourceDocument};
use crate::models::state::{Flow, JobState, Stage};
use crate::services::collaborators::{
    CollaboratorError, DocumentRenderer, EssayAi, TextExtractor,
};
use crate::store::{JobStore, StoreError};

const IMAGE_ANALYSIS_MARKER: &str = "=== REFERENCE IMAGES ANALYSIS ===";

/// Word-count phrasings in the additional prompt, tried in order against
/// the lowercased prompt with commas removed.
static WORD_COUNT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(\d{4,5})\s*words?",
        r"word\s*count[:\s]+(\d+)",
        r"(\d+)\s*word\s*count",
        r"minimum\s*(\d+)",
        r"at\s*least\s*(\d+)",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).unwrap())
    .collect()
});

/// Replacement fragment produced by a successful stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    /// Source text, plus the structured essay in the import flow.
    Extracted {
        source_text: String,
        essay: Option<Essay>,
    },
    Researched {
        brief: ResearchBrief,
    },
    Drafted {
        essay: Essay,
    },
    Humanized {
        essay: Essay,
    },
    Refined {
        essay: Essay,
        feedback: Option<String>,
    },
    /// Every format rendered from the same essay snapshot.
    Rendered {
        documents: Vec<(DocumentFormat, Vec<u8>)>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Missing input: {0}")]
    MissingInput(String),

    #[error("Stage timed out after {0:?}")]
    Timeout(std::time::Duration),
}

#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(&self, job: &Job) -> Result<StageOutput, ExecutorError>;
}

/// Read the source document's text, from the blob area or inline.
async fn load_source_text(
    store: &dyn JobStore,
    extractor: &dyn TextExtractor,
    job: &Job,
) -> Result<String, ExecutorError> {
    match &job.inputs.source {
        SourceDocument::Text { content } => Ok(content.clone()),
        SourceDocument::File {
            filename,
            file_type,
            ..
        } => {
            let bytes = store
                .get_blob(job.id, BlobKind::Source)
                .await?
                .ok_or_else(|| ExecutorError::MissingInput(format!("uploaded file {filename}")))?;
            Ok(extractor.extract_text(filename, *file_type, &bytes).await?)
        }
    }
}

pub struct Extractor {
    store: Arc<dyn JobStore>,
    extractor: Arc<dyn TextExtractor>,
    ai: Arc<dyn EssayAi>,
}

impl Extractor {
    pub fn new(
        store: Arc<dyn JobStore>,
        extractor: Arc<dyn TextExtractor>,
        ai: Arc<dyn EssayAi>,
    ) -> Self {
        Self {
            store,
            extractor,
            ai,
        }
    }

    /// Describe each reference image. Images that fail are skipped.
    async fn analyze_images(&self, job: &Job) -> Result<Vec<String>, ExecutorError> {
        let mut descriptions = Vec::new();
        for image in &job.inputs.reference_images {
            let Some(bytes) = self
                .store
                .get_blob(job.id, BlobKind::ReferenceImage(image.index))
                .await?
            else {
                tracing::warn!(job_id = %job.id, index = image.index, "Reference image missing from store");
                continue;
            };
            match self.ai.describe_image(&image.mime_type, &bytes).await {
                Ok(text) => descriptions.push(format!(
                    "[Analysis of Reference Image {}]:\n{}",
                    image.index + 1,
                    text
                )),
                Err(e) => {
                    tracing::warn!(job_id = %job.id, index = image.index, error = %e, "Reference image analysis failed");
                }
            }
        }
        Ok(descriptions)
    }
}

#[async_trait]
impl StageExecutor for Extractor {
    async fn execute(&self, job: &Job) -> Result<StageOutput, ExecutorError> {
        let text = load_source_text(self.store.as_ref(), self.extractor.as_ref(), job).await?;

        match job.flow {
            Flow::Create => {
                let descriptions = self.analyze_images(job).await?;
                let source_text = if descriptions.is_empty() {
                    text
                } else {
                    format!(
                        "{text}\n\n{IMAGE_ANALYSIS_MARKER}\n\n{}",
                        descriptions.join("\n\n")
                    )
                };
                Ok(StageOutput::Extracted {
                    source_text,
                    essay: None,
                })
            }
            Flow::Import => {
                let essay = self.ai.structure(&text).await?;
                Ok(StageOutput::Extracted {
                    source_text: text,
                    essay: Some(essay),
                })
            }
        }
    }
}

pub struct Researcher {
    ai: Arc<dyn EssayAi>,
}

impl Researcher {
    pub fn new(ai: Arc<dyn EssayAi>) -> Self {
        Self { ai }
    }
}

fn source_text(job: &Job) -> Result<&str, ExecutorError> {
    job.source_text
        .as_deref()
        .ok_or_else(|| ExecutorError::MissingInput("extracted source text".to_string()))
}

#[async_trait]
impl StageExecutor for Researcher {
    async fn execute(&self, job: &Job) -> Result<StageOutput, ExecutorError> {
        let brief = self.ai.research(source_text(job)?, &job.inputs.settings).await?;
        Ok(StageOutput::Researched {
            brief: apply_user_priority(brief, job.inputs.settings.additional_prompt.as_deref()),
        })
    }
}

/// The user's additional prompt wins over the research result: a word count
/// it names replaces the target, and the prompt itself becomes a requirement.
/// Conclusion and reference entries are dropped from the outline since the
/// writer emits those sections separately.
fn apply_user_priority(mut brief: ResearchBrief, additional_prompt: Option<&str>) -> ResearchBrief {
    if let Some(prompt) = additional_prompt.map(str::trim).filter(|p| !p.is_empty()) {
        if let Some(count) = requested_word_count(prompt) {
            brief.target_word_count = count;
        }
        brief
            .requirements
            .push(format!("USER PRIORITY INSTRUCTION: {prompt}"));
    }
    brief.outline.retain(|section| {
        let section = section.to_lowercase();
        !section.contains("conclusion") && !section.contains("reference")
    });
    brief
}

fn requested_word_count(prompt: &str) -> Option<u32> {
    let normalized = prompt.to_lowercase().replace(',', "");
    WORD_COUNT_PATTERNS
        .iter()
        .find_map(|pattern| pattern.captures(&normalized))
        .and_then(|captures| captures[1].parse().ok())
}

pub struct Writer {
    ai: Arc<dyn EssayAi>,
}

impl Writer {
    pub fn new(ai: Arc<dyn EssayAi>) -> Self {
        Self { ai }
    }
}

#[async_trait]
impl StageExecutor for Writer {
    async fn execute(&self, job: &Job) -> Result<StageOutput, ExecutorError> {
        let brief = job
            .research
            .as_ref()
            .ok_or_else(|| ExecutorError::MissingInput("research brief".to_string()))?;
        let essay = self
            .ai
            .write(source_text(job)?, brief, &job.inputs.settings)
            .await?;
        Ok(StageOutput::Drafted { essay })
    }
}

pub struct Humanizer {
    ai: Arc<dyn EssayAi>,
}

impl Humanizer {
    pub fn new(ai: Arc<dyn EssayAi>) -> Self {
        Self { ai }
    }
}

#[async_trait]
impl StageExecutor for Humanizer {
    async fn execute(&self, job: &Job) -> Result<StageOutput, ExecutorError> {
        let settings = &job.inputs.settings.humanization;
        let mut essay = self.ai.humanize(&job.essay, settings).await?;
        if settings.preserve_citations {
            essay.references = job.essay.references.clone();
        }
        Ok(StageOutput::Humanized { essay })
    }
}

pub struct Refiner {
    ai: Arc<dyn EssayAi>,
}

impl Refiner {
    pub fn new(ai: Arc<dyn EssayAi>) -> Self {
        Self { ai }
    }
}

#[async_trait]
impl StageExecutor for Refiner {
    async fn execute(&self, job: &Job) -> Result<StageOutput, ExecutorError> {
        let JobState::Refining { instructions } = &job.state else {
            return Err(ExecutorError::MissingInput("refinement instructions".to_string()));
        };
        let refinement = self.ai.refine(&job.essay, instructions).await?;
        Ok(StageOutput::Refined {
            essay: refinement.essay,
            feedback: refinement.feedback,
        })
    }
}

pub struct Formatter {
    renderer: Arc<dyn DocumentRenderer>,
}

impl Formatter {
    pub fn new(renderer: Arc<dyn DocumentRenderer>) -> Self {
        Self { renderer }
    }
}

#[async_trait]
impl StageExecutor for Formatter {
    async fn execute(&self, job: &Job) -> Result<StageOutput, ExecutorError> {
        let snapshot = &job.essay;
        let mut documents = Vec::with_capacity(2);
        for format in [DocumentFormat::Pdf, DocumentFormat::Docx] {
            let bytes = self
                .renderer
                .render(snapshot, &job.inputs.settings, format)
                .await?;
            documents.push((format, bytes));
        }
        Ok(StageOutput::Rendered { documents })
    }
}

/// The executor registered for each stage.
#[derive(Clone, Default)]
pub struct ExecutorSet {
    executors: HashMap<Stage, Arc<dyn StageExecutor>>,
}

impl ExecutorSet {
    pub fn new(
        store: Arc<dyn JobStore>,
        extractor: Arc<dyn TextExtractor>,
        ai: Arc<dyn EssayAi>,
        renderer: Arc<dyn DocumentRenderer>,
    ) -> Self {
        let mut executors: HashMap<Stage, Arc<dyn StageExecutor>> = HashMap::new();
        executors.insert(
            Stage::Extract,
            Arc::new(Extractor::new(store, extractor, ai.clone())),
        );
        executors.insert(Stage::Research, Arc::new(Researcher::new(ai.clone())));
        executors.insert(Stage::Write, Arc::new(Writer::new(ai.clone())));
        executors.insert(Stage::Humanize, Arc::new(Humanizer::new(ai.clone())));
        executors.insert(Stage::Refine, Arc::new(Refiner::new(ai)));
        executors.insert(Stage::Format, Arc::new(Formatter::new(renderer)));
        Self { executors }
    }

    /// Swap in a different executor for one stage.
    pub fn with_executor(mut self, stage: Stage, executor: Arc<dyn StageExecutor>) -> Self {
        self.executors.insert(stage, executor);
        self
    }

    pub fn get(&self, stage: Stage) -> Option<Arc<dyn StageExecutor>> {
        self.executors.get(&stage).cloned()
    }
}
