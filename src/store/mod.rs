//! Durable keyed record of job state.
//!
//! The store is the single source of truth for status reads and the only
//! place worker claims are arbitrated. Every write is a compare-and-set on
//! the job's `version`, so two writers can never both advance the same job.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::Duration;
use uuid::Uuid;

use crate::models::job::{BlobKind, Job, Lease};

pub use self::memory::MemoryJobStore;
pub use self::redis::RedisJobStore;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a brand new job. Fails with `Conflict` if the id exists.
    async fn insert(&self, job: &mut Job) -> Result<(), StoreError>;

    /// Non-blocking snapshot read.
    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Overwrite the job if the stored version still equals `job.version`.
    /// On success `job.version` is bumped to the new stored version.
    async fn replace(&self, job: &mut Job) -> Result<(), StoreError>;

    /// Atomically pick one claimable job and record a lease on it.
    async fn claim_next(
        &self,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<Option<(Lease, Job)>, StoreError>;

    async fn put_blob(&self, id: Uuid, kind: BlobKind, bytes: &[u8]) -> Result<(), StoreError>;

    async fn get_blob(&self, id: Uuid, kind: BlobKind) -> Result<Option<Vec<u8>>, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;

    /// Write back a claimed job and release its lease.
    ///
    /// Rejected with `LeaseLost` if the lease expired and the job was claimed
    /// or modified by someone else in the meantime.
    async fn commit(&self, lease: &Lease, job: &mut Job) -> Result<(), StoreError> {
        let held = job.id == lease.job_id()
            && job
                .claim
                .as_ref()
                .is_some_and(|claim| claim.token == lease.token());
        if !held {
            return Err(StoreError::LeaseLost(lease.job_id()));
        }

        job.claim = None;
        match self.replace(job).await {
            Err(StoreError::Conflict(id)) => Err(StoreError::LeaseLost(id)),
            other => other,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Job {0} was modified concurrently")]
    Conflict(Uuid),

    #[error("Job {0} not found in store")]
    NotFound(Uuid),

    #[error("Lease on job {0} is no longer held")]
    LeaseLost(Uuid),
}
