//! Shared fakes and a deterministic harness for pipeline tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use essayflow::app_state::AppState;
use essayflow::models::essay::{BodySection, Essay, ResearchBrief};
use essayflow::models::job::{DocumentFormat, EssaySettings, HumanizationSettings, Job};
use essayflow::models::state::{is_edge, JobStatus, Stage};
use essayflow::services::collaborators::{
    CollaboratorError, DocumentRenderer, EssayAi, Refinement, TextExtractor,
};
use essayflow::services::controller::JobController;
use essayflow::services::dispatcher::{
    DispatchSignal, Dispatcher, DispatcherConfig, DispatcherHandle, Step,
};
use essayflow::services::executors::{ExecutorError, ExecutorSet, StageExecutor, StageOutput};
use essayflow::services::validation::{ImportRequest, UploadLimits, UploadRequest, UploadedFile};
use essayflow::store::{JobStore, MemoryJobStore};
use uuid::Uuid;

pub const ALL_STAGES: [Stage; 6] = [
    Stage::Extract,
    Stage::Research,
    Stage::Write,
    Stage::Humanize,
    Stage::Refine,
    Stage::Format,
];

/// Document extractor that returns the uploaded bytes as text.
#[derive(Default)]
pub struct FakeExtractor {
    pub calls: AtomicUsize,
}

#[async_trait]
impl TextExtractor for FakeExtractor {
    async fn extract_text(
        &self,
        _filename: &str,
        _format: DocumentFormat,
        bytes: &[u8],
    ) -> Result<String, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("Assignment: {}", String::from_utf8_lossy(bytes)))
    }
}

/// AI fake with scripted per-operation failures.
#[derive(Default)]
pub struct FakeAi {
    failures: Mutex<HashMap<&'static str, u32>>,
    calls: Mutex<Vec<&'static str>>,
}

impl FakeAi {
    /// Fail the next `times` calls to `op` ("research", "write", ...).
    pub fn failing(self, op: &'static str, times: u32) -> Self {
        self.failures.lock().unwrap().insert(op, times);
        self
    }

    pub fn calls(&self, op: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == op).count()
    }

    fn check(&self, op: &'static str) -> Result<(), CollaboratorError> {
        self.calls.lock().unwrap().push(op);
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(CollaboratorError::Invalid(format!("{op} service unavailable")))
            }
            _ => Ok(()),
        }
    }
}

pub fn draft_essay() -> Essay {
    Essay {
        title: "Draft essay".to_string(),
        thesis_statement: Some("Tests keep systems honest".to_string()),
        introduction: "An introduction".to_string(),
        body_sections: vec![
            BodySection {
                title: "First".to_string(),
                content: "First body paragraph".to_string(),
            },
            BodySection {
                title: "Second".to_string(),
                content: "Second body paragraph".to_string(),
            },
        ],
        conclusion: "A conclusion".to_string(),
        references: vec!["Doe, J. (2020). Testing.".to_string()],
        ..Essay::default()
    }
}

#[async_trait]
impl EssayAi for FakeAi {
    async fn describe_image(
        &self,
        mime_type: &str,
        _bytes: &[u8],
    ) -> Result<String, CollaboratorError> {
        self.check("describe_image")?;
        Ok(format!("A {mime_type} chart"))
    }

    async fn research(
        &self,
        _source_text: &str,
        _settings: &EssaySettings,
    ) -> Result<ResearchBrief, CollaboratorError> {
        self.check("research")?;
        Ok(ResearchBrief {
            target_word_count: 1200,
            requirements: vec!["Cite two sources".to_string()],
            outline: vec!["First".to_string(), "Second".to_string()],
        })
    }

    async fn write(
        &self,
        _source_text: &str,
        _brief: &ResearchBrief,
        _settings: &EssaySettings,
    ) -> Result<Essay, CollaboratorError> {
        self.check("write")?;
        Ok(draft_essay())
    }

    async fn humanize(
        &self,
        essay: &Essay,
        _settings: &HumanizationSettings,
    ) -> Result<Essay, CollaboratorError> {
        self.check("humanize")?;
        let mut out = essay.clone();
        out.introduction = format!("Honestly, {}", essay.introduction);
        Ok(out)
    }

    async fn structure(&self, raw_text: &str) -> Result<Essay, CollaboratorError> {
        self.check("structure")?;
        Ok(Essay {
            title: "Imported essay".to_string(),
            introduction: raw_text.to_string(),
            conclusion: "Imported conclusion".to_string(),
            ..Essay::default()
        })
    }

    async fn refine(
        &self,
        essay: &Essay,
        instructions: &str,
    ) -> Result<Refinement, CollaboratorError> {
        self.check("refine")?;
        let mut out = essay.clone();
        out.conclusion = format!("{} [{instructions}]", essay.conclusion);
        Ok(Refinement {
            essay: out,
            feedback: Some(format!("Applied: {instructions}")),
        })
    }
}

/// Renderer that records the essay it was given for each format.
#[derive(Default)]
pub struct RecordingRenderer {
    pub rendered: Mutex<Vec<(DocumentFormat, Essay)>>,
}

#[async_trait]
impl DocumentRenderer for RecordingRenderer {
    async fn render(
        &self,
        essay: &Essay,
        _settings: &EssaySettings,
        format: DocumentFormat,
    ) -> Result<Vec<u8>, CollaboratorError> {
        self.rendered.lock().unwrap().push((format, essay.clone()));
        Ok(format!("{format}:{}", essay.title).into_bytes())
    }
}

/// Wraps a stage executor and records any job seen by two executors at once.
pub struct TrackingExecutor {
    inner: Arc<dyn StageExecutor>,
    tracker: Arc<InFlight>,
    delay: Duration,
}

#[derive(Default)]
pub struct InFlight {
    running: Mutex<HashSet<Uuid>>,
    pub overlaps: AtomicUsize,
    pub executions: AtomicUsize,
}

#[async_trait]
impl StageExecutor for TrackingExecutor {
    async fn execute(&self, job: &Job) -> Result<StageOutput, ExecutorError> {
        if !self.tracker.running.lock().unwrap().insert(job.id) {
            self.tracker.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.tracker.executions.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let result = self.inner.execute(job).await;
        self.tracker.running.lock().unwrap().remove(&job.id);
        result
    }
}

/// Executor that never finishes within a short stage timeout.
pub struct StalledExecutor;

#[async_trait]
impl StageExecutor for StalledExecutor {
    async fn execute(&self, _job: &Job) -> Result<StageOutput, ExecutorError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(ExecutorError::MissingInput("unreachable".to_string()))
    }
}

pub fn test_config() -> DispatcherConfig {
    DispatcherConfig {
        worker_count: 4,
        max_attempts: 3,
        stage_timeout: Duration::from_secs(5),
        retry_backoff: Duration::ZERO,
        poll_interval: Duration::from_millis(10),
    }
}

pub struct Harness {
    pub store: Arc<MemoryJobStore>,
    pub controller: JobController,
    pub dispatcher: Dispatcher,
    pub ai: Arc<FakeAi>,
    pub extractor: Arc<FakeExtractor>,
    pub renderer: Arc<RecordingRenderer>,
    executors: ExecutorSet,
    signal: DispatchSignal,
    config: DispatcherConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(FakeAi::default(), test_config(), |set| set)
    }

    pub fn with_ai(ai: FakeAi) -> Self {
        Self::build(ai, test_config(), |set| set)
    }

    pub fn build(
        ai: FakeAi,
        config: DispatcherConfig,
        customize: impl FnOnce(ExecutorSet) -> ExecutorSet,
    ) -> Self {
        let store = Arc::new(MemoryJobStore::new());
        let ai = Arc::new(ai);
        let extractor = Arc::new(FakeExtractor::default());
        let renderer = Arc::new(RecordingRenderer::default());
        let executors = customize(ExecutorSet::new(
            store.clone(),
            extractor.clone(),
            ai.clone(),
            renderer.clone(),
        ));
        let signal = DispatchSignal::new();
        let controller = JobController::new(store.clone(), signal.clone(), UploadLimits::default());
        let dispatcher = Dispatcher::new(
            store.clone(),
            executors.clone(),
            config.clone(),
            signal.clone(),
        );
        Self {
            store,
            controller,
            dispatcher,
            ai,
            extractor,
            renderer,
            executors,
            signal,
            config,
        }
    }

    /// Wrap every stage executor with in-flight tracking.
    pub fn tracked(delay: Duration) -> (Self, Arc<InFlight>) {
        let tracker = Arc::new(InFlight::default());
        let shared = tracker.clone();
        let harness = Self::build(FakeAi::default(), test_config(), move |mut set| {
            for stage in ALL_STAGES {
                if let Some(inner) = set.get(stage) {
                    set = set.with_executor(
                        stage,
                        Arc::new(TrackingExecutor {
                            inner,
                            tracker: shared.clone(),
                            delay,
                        }),
                    );
                }
            }
            set
        });
        (harness, tracker)
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(self.store.clone(), self.signal.clone(), UploadLimits::default())
    }

    /// Start a real worker pool over the same store and executors.
    pub fn spawn_workers(&self) -> DispatcherHandle {
        Dispatcher::new(
            self.store.clone(),
            self.executors.clone(),
            self.config.clone(),
            self.signal.clone(),
        )
        .spawn()
    }

    /// Step a single worker until nothing is runnable.
    pub async fn drain(&self) -> Vec<Step> {
        let mut steps = Vec::new();
        while let Some(step) = self.dispatcher.run_once("test-worker").await.unwrap() {
            steps.push(step);
            assert!(steps.len() < 200, "dispatcher did not settle");
        }
        steps
    }

    pub async fn job(&self, id: Uuid) -> Job {
        self.store.get(id).await.unwrap().expect("job exists")
    }

    /// Poll until `id` is terminal or the deadline passes.
    pub async fn wait_terminal(&self, id: Uuid, deadline: Duration) -> Job {
        let started = std::time::Instant::now();
        loop {
            let job = self.job(id).await;
            if job.status().is_terminal() || started.elapsed() > deadline {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

pub fn upload(filename: &str, bytes: &[u8]) -> UploadRequest {
    UploadRequest {
        file: Some(UploadedFile {
            filename: filename.to_string(),
            bytes: bytes.to_vec(),
        }),
        ..UploadRequest::default()
    }
}

pub fn import_text(instructions: Option<&str>) -> ImportRequest {
    ImportRequest {
        text_content: Some(
            "My imported essay argues that careful testing pays for itself many times over."
                .to_string(),
        ),
        refinement_instructions: instructions.map(str::to_string),
        ..ImportRequest::default()
    }
}

/// Every recorded status change must be an edge of the transition table.
pub fn assert_history_is_legal(job: &Job) {
    for pair in job.history.windows(2) {
        assert!(
            is_edge(job.flow, pair[0].status, pair[1].status),
            "illegal transition {} -> {} in {:?}",
            pair[0].status,
            pair[1].status,
            job.history.iter().map(|c| c.status).collect::<Vec<_>>()
        );
    }
}

pub fn statuses(job: &Job) -> Vec<JobStatus> {
    job.history.iter().map(|change| change.status).collect()
}
