//! Bounded worker pool that advances runnable jobs one stage at a time.
//!
//! A worker claims a job through the store, which records a lease on it.
//! While the lease is live no other worker can claim the job, and the
//! worker's write-back is a compare-and-set that fails if the lease was
//! lost. The lease TTL is longer than the stage timeout, so a live worker's
//! lease cannot expire under it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::models::essay::RefinementEntry;
use crate::models::job::{BlobKind, Job, Lease};
use crate::models::state::{Event, Flow, JobState, JobStatus, Stage};
use crate::services::controller;
use crate::services::executors::{ExecutorError, ExecutorSet, StageOutput};
use crate::store::{JobStore, StoreError};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub worker_count: usize,
    /// Attempts per stage before the job fails.
    pub max_attempts: u32,
    pub stage_timeout: Duration,
    /// Base delay before a failed stage becomes claimable again.
    pub retry_backoff: Duration,
    pub poll_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            max_attempts: 3,
            stage_timeout: Duration::from_secs(540),
            retry_backoff: Duration::from_secs(2),
            poll_interval: Duration::from_millis(1000),
        }
    }
}

impl DispatcherConfig {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            worker_count: config.worker_count.max(1),
            max_attempts: config.max_stage_attempts.max(1),
            stage_timeout: Duration::from_secs(config.stage_timeout_secs),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }

    /// Lease lifetime: long enough that an expired lease means the holder's
    /// executor call has already timed out.
    pub fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.stage_timeout * 2 + Duration::from_secs(30))
            .unwrap_or_else(|_| chrono::Duration::hours(1))
    }
}

/// Wakes idle workers when the controller makes a job runnable.
#[derive(Clone, Default)]
pub struct DispatchSignal(Arc<Notify>);

impl DispatchSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake(&self) {
        self.0.notify_waiters();
    }

    async fn wait(&self) {
        self.0.notified().await;
    }
}

/// What one worker step did.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Advanced { to: JobStatus },
    Retrying { attempt: u32, error: String },
    Failed { error: String },
    /// Another worker took over; this step's result was discarded.
    LeaseLost,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub job_id: Uuid,
    pub from: JobStatus,
    pub outcome: StepOutcome,
}

pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    executors: ExecutorSet,
    config: DispatcherConfig,
    signal: DispatchSignal,
}

/// Running worker pool. Dropping it stops workers once they go idle; call
/// [`DispatcherHandle::shutdown`] to stop them and wait for in-flight stages.
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Signal workers to stop and wait for in-flight stages to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.await {
                tracing::error!(worker = i, error = %e, "Worker task panicked");
            }
        }
        tracing::info!("All workers have stopped");
    }
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        executors: ExecutorSet,
        config: DispatcherConfig,
        signal: DispatchSignal,
    ) -> Self {
        Self {
            store,
            executors,
            config,
            signal,
        }
    }

    /// Start `worker_count` workers.
    pub fn spawn(self) -> DispatcherHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker_count = self.config.worker_count;
        let dispatcher = Arc::new(self);

        let workers = (0..worker_count)
            .map(|i| {
                let dispatcher = Arc::clone(&dispatcher);
                let shutdown_rx = shutdown_rx.clone();
                let worker_id = format!("{}-{i}", std::process::id());
                tokio::spawn(async move { dispatcher.run_worker(worker_id, shutdown_rx).await })
            })
            .collect();

        tracing::info!(worker_count, "Started dispatcher workers");
        DispatcherHandle { shutdown, workers }
    }

    async fn run_worker(&self, worker_id: String, mut shutdown: watch::Receiver<bool>) {
        tracing::debug!(worker_id = %worker_id, "Worker started");
        while !*shutdown.borrow() {
            match self.run_once(&worker_id).await {
                // more work may be waiting
                Ok(Some(_)) => continue,
                Ok(None) => {
                    tokio::select! {
                        _ = sleep(self.config.poll_interval) => {}
                        _ = self.signal.wait() => {}
                        changed = shutdown.changed() => {
                            // sender dropped with the handle
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(worker_id = %worker_id, error = %e, "Job store error, will retry");
                    sleep(self.config.poll_interval).await;
                }
            }
        }
        tracing::debug!(worker_id = %worker_id, "Worker stopped");
    }

    /// Claim one runnable job and advance it by exactly one step.
    /// Returns `None` when nothing is runnable.
    pub async fn run_once(&self, worker_id: &str) -> Result<Option<Step>, StoreError> {
        let Some((lease, job)) = self
            .store
            .claim_next(worker_id, self.config.lease_ttl())
            .await?
        else {
            return Ok(None);
        };

        let job_id = job.id;
        let from = job.status();
        tracing::debug!(job_id = %job_id, worker_id, status = %from, "Claimed job");

        let outcome = match from.stage() {
            None => self.pick(&lease, job).await?,
            Some(stage) => self.run_stage(&lease, job, stage).await?,
        };

        Ok(Some(Step {
            job_id,
            from,
            outcome,
        }))
    }

    /// `pending -> extracting`; no executor runs.
    async fn pick(&self, lease: &Lease, mut job: Job) -> Result<StepOutcome, StoreError> {
        if let Err(e) = job.apply(Event::Picked) {
            // nothing to run; release the lease unchanged
            tracing::error!(job_id = %job.id, error = %e, "Claimed job has no stage to run");
        }
        let to = job.status();
        self.commit(lease, job, StepOutcome::Advanced { to }).await
    }

    async fn run_stage(
        &self,
        lease: &Lease,
        job: Job,
        stage: Stage,
    ) -> Result<StepOutcome, StoreError> {
        let attempt = job.attempts + 1;
        tracing::info!(job_id = %job.id, worker_id = lease.worker_id(), stage = %stage, attempt, "Running stage");

        let Some(executor) = self.executors.get(stage) else {
            let err = ExecutorError::MissingInput(format!("executor for stage {stage}"));
            return self.fail_attempt(lease, job, stage, err).await;
        };

        let started = Instant::now();
        let result = match timeout(self.config.stage_timeout, executor.execute(&job)).await {
            Ok(result) => result,
            Err(_) => Err(ExecutorError::Timeout(self.config.stage_timeout)),
        };
        let elapsed = started.elapsed();
        metrics::histogram!("essay_stage_duration_seconds", "stage" => stage.to_string())
            .record(elapsed.as_secs_f64());

        match result {
            Ok(output) => {
                tracing::info!(
                    job_id = %job.id,
                    stage = %stage,
                    duration_ms = elapsed.as_millis() as u64,
                    "Stage succeeded"
                );
                self.complete_stage(lease, job, stage, output).await
            }
            Err(e) => self.fail_attempt(lease, job, stage, e).await,
        }
    }

    async fn complete_stage(
        &self,
        lease: &Lease,
        job: Job,
        stage: Stage,
        output: StageOutput,
    ) -> Result<StepOutcome, StoreError> {
        let from = job.status();
        let mut next = job.clone();

        let event = match output {
            StageOutput::Rendered { documents } => {
                for (format, bytes) in &documents {
                    self.store
                        .put_blob(next.id, BlobKind::Artifact(*format), bytes)
                        .await?;
                }
                next.artifacts = documents.iter().map(|(format, _)| *format).collect();
                Event::Rendered {
                    download_url: format!("/api/download/{}", next.id),
                }
            }
            other => merge(&mut next, other),
        };
        let refined = event == Event::Refined;

        if let Err(e) = next.apply(event) {
            let err = ExecutorError::MissingInput(format!("usable {stage} output ({e})"));
            return self.fail_attempt(lease, job, stage, err).await;
        }
        if refined {
            next.message = "Refinement complete".to_string();
            metrics::counter!("essay_refinements_total").increment(1);
        }

        let to = next.status();
        let job_id = next.id;
        let initial_instructions = match next.flow {
            Flow::Import => next.inputs.refinement_instructions.clone(),
            Flow::Create => None,
        };
        let outcome = self
            .commit(lease, next, StepOutcome::Advanced { to })
            .await?;

        if to == JobStatus::Completed {
            metrics::counter!("essay_jobs_completed_total").increment(1);
        }

        // an import with instructions goes straight on to its first refine
        if outcome == (StepOutcome::Advanced { to }) && from == JobStatus::Extracting {
            if let Some(instructions) = initial_instructions
                .as_deref()
                .filter(|text| controller::wants_initial_refinement(text))
            {
                match controller::submit_refinement(self.store.as_ref(), job_id, instructions).await {
                    Ok(_) => self.signal.wake(),
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, error = %e, "Initial refinement not started")
                    }
                }
            }
        }

        Ok(outcome)
    }

    async fn fail_attempt(
        &self,
        lease: &Lease,
        mut job: Job,
        stage: Stage,
        err: ExecutorError,
    ) -> Result<StepOutcome, StoreError> {
        let mut error = err.to_string();
        if error.trim().is_empty() {
            error = format!("{stage} failed");
        }
        let attempt = job.attempts + 1;
        job.last_error = Some(error.clone());

        if attempt >= self.config.max_attempts {
            tracing::warn!(job_id = %job.id, stage = %stage, attempt, error = %error, "Stage failed after max retries");
            metrics::counter!("essay_jobs_failed_total", "stage" => stage.to_string()).increment(1);
            if let Err(e) = job.apply(Event::Failed {
                error: error.clone(),
            }) {
                tracing::error!(job_id = %job.id, error = %e, "Could not mark job failed");
            }
            job.attempts = attempt;
            return self
                .commit(lease, job, StepOutcome::Failed { error })
                .await;
        }

        tracing::info!(job_id = %job.id, stage = %stage, attempt, error = %error, "Stage failed, will retry");
        metrics::counter!("essay_stage_retries_total", "stage" => stage.to_string()).increment(1);

        let now = Utc::now();
        let backoff = chrono::Duration::from_std(self.config.retry_backoff * attempt)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        job.attempts = attempt;
        job.retry_at = Some(now + backoff);
        job.message = format!(
            "{} failed (attempt {attempt}/{}), retrying...",
            stage_label(stage),
            self.config.max_attempts
        );
        job.updated_at = now;

        self.commit(lease, job, StepOutcome::Retrying { attempt, error })
            .await
    }

    async fn commit(
        &self,
        lease: &Lease,
        mut job: Job,
        outcome: StepOutcome,
    ) -> Result<StepOutcome, StoreError> {
        match self.store.commit(lease, &mut job).await {
            Ok(()) => Ok(outcome),
            Err(StoreError::LeaseLost(id)) => {
                tracing::warn!(job_id = %id, worker_id = lease.worker_id(), "Lease lost, discarding stage result");
                Ok(StepOutcome::LeaseLost)
            }
            Err(e) => Err(e),
        }
    }
}

/// Fold a stage output into the scratch copy of the job and name the event.
fn merge(job: &mut Job, output: StageOutput) -> Event {
    match output {
        StageOutput::Extracted { source_text, essay } => {
            job.source_text = Some(source_text);
            if let Some(essay) = essay {
                job.essay = essay;
            }
            Event::Extracted
        }
        StageOutput::Researched { brief } => {
            job.research = Some(brief);
            Event::Researched
        }
        StageOutput::Drafted { essay } => {
            job.essay = essay;
            Event::Drafted
        }
        StageOutput::Humanized { essay } => {
            job.essay = essay;
            Event::Humanized
        }
        StageOutput::Refined { essay, feedback } => {
            let JobState::Refining { instructions } = &job.state else {
                return Event::Refined;
            };
            job.refinement_history.push(RefinementEntry {
                instructions: instructions.clone(),
                applied_at: Utc::now(),
            });
            job.essay = essay;
            job.essay.ai_feedback = feedback;
            Event::Refined
        }
        StageOutput::Rendered { .. } => Event::Rendered {
            download_url: format!("/api/download/{}", job.id),
        },
    }
}

fn stage_label(stage: Stage) -> &'static str {
    match stage {
        Stage::Extract => "Extraction",
        Stage::Research => "Research",
        Stage::Write => "Writing",
        Stage::Humanize => "Humanization",
        Stage::Refine => "Refinement",
        Stage::Format => "Formatting",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::essay::Essay;
    use crate::models::job::{EssaySettings, JobInputs, SourceDocument};
    use crate::store::MemoryJobStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingStore {
        inner: MemoryJobStore,
        claims: AtomicUsize,
    }

    #[async_trait]
    impl JobStore for CountingStore {
        async fn insert(&self, job: &mut Job) -> Result<(), StoreError> {
            self.inner.insert(job).await
        }

        async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
            self.inner.get(id).await
        }

        async fn replace(&self, job: &mut Job) -> Result<(), StoreError> {
            self.inner.replace(job).await
        }

        async fn claim_next(
            &self,
            worker_id: &str,
            ttl: chrono::Duration,
        ) -> Result<Option<(Lease, Job)>, StoreError> {
            self.claims.fetch_add(1, Ordering::SeqCst);
            self.inner.claim_next(worker_id, ttl).await
        }

        async fn put_blob(&self, id: Uuid, kind: BlobKind, bytes: &[u8]) -> Result<(), StoreError> {
            self.inner.put_blob(id, kind, bytes).await
        }

        async fn get_blob(&self, id: Uuid, kind: BlobKind) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get_blob(id, kind).await
        }

        async fn health_check(&self) -> Result<(), StoreError> {
            self.inner.health_check().await
        }
    }

    fn job_in_refining() -> Job {
        let mut job = Job::new(
            Flow::Import,
            JobInputs {
                source: SourceDocument::Text {
                    content: "t".repeat(60),
                },
                settings: EssaySettings::default(),
                reference_images: vec![],
                refinement_instructions: None,
            },
        );
        job.apply(Event::Picked).unwrap();
        job.apply(Event::Extracted).unwrap();
        job.apply(Event::RefineRequested {
            instructions: "shorter".to_string(),
        })
        .unwrap();
        job
    }

    #[test]
    fn test_merge_refined_appends_history_once() {
        let mut job = job_in_refining();
        let event = merge(
            &mut job,
            StageOutput::Refined {
                essay: Essay {
                    title: "New".to_string(),
                    ..Essay::default()
                },
                feedback: Some("Trimmed the intro".to_string()),
            },
        );
        assert_eq!(event, Event::Refined);
        assert_eq!(job.refinement_history.len(), 1);
        assert_eq!(job.refinement_history[0].instructions, "shorter");
        assert_eq!(job.essay.ai_feedback.as_deref(), Some("Trimmed the intro"));
    }

    #[test]
    fn test_merge_overwrites_essay_wholesale() {
        let mut job = job_in_refining();
        job.essay.body_sections = vec![Default::default(); 3];
        merge(
            &mut job,
            StageOutput::Drafted {
                essay: Essay {
                    body_sections: vec![Default::default()],
                    ..Essay::default()
                },
            },
        );
        assert_eq!(job.essay.body_sections.len(), 1);
    }

    #[test]
    fn test_lease_outlives_stage_timeout() {
        let config = DispatcherConfig {
            stage_timeout: Duration::from_secs(10),
            ..DispatcherConfig::default()
        };
        assert_eq!(config.lease_ttl(), chrono::Duration::seconds(50));
    }

    #[tokio::test]
    async fn test_dropped_handle_stops_idle_workers() {
        let store = Arc::new(CountingStore::default());
        let config = DispatcherConfig {
            worker_count: 1,
            poll_interval: Duration::from_secs(1),
            ..DispatcherConfig::default()
        };
        let handle = Dispatcher::new(
            store.clone(),
            ExecutorSet::default(),
            config,
            DispatchSignal::new(),
        )
        .spawn();
        sleep(Duration::from_millis(50)).await;
        drop(handle);
        sleep(Duration::from_millis(500)).await;

        let polls = store.claims.load(Ordering::SeqCst);
        assert!(polls <= 2, "idle worker polled {polls} times in 500ms");
    }
}
