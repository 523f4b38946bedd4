use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::job::{BlobKind, Claim, Job, Lease};
use crate::store::{JobStore, StoreError};

#[derive(Default)]
struct Jobs {
    records: HashMap<Uuid, Job>,
    /// Ids of jobs the worker pool may advance; claims scan only these.
    active: HashSet<Uuid>,
}

impl Jobs {
    fn index(&mut self, job: &Job) {
        if job.status().is_auto() {
            self.active.insert(job.id);
        } else {
            self.active.remove(&job.id);
        }
    }
}

/// In-process job store for single-node deployments and tests.
///
/// Reads take a shared lock; every write, including claims, takes the
/// exclusive lock so compare-and-set is atomic.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<Jobs>,
    blobs: RwLock<HashMap<(Uuid, BlobKind), Vec<u8>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs held.
    pub async fn len(&self) -> usize {
        self.jobs.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.records.is_empty()
    }

    /// Number of jobs the worker pool may still advance.
    pub async fn active_len(&self) -> usize {
        self.jobs.read().await.active.len()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &mut Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.records.contains_key(&job.id) {
            return Err(StoreError::Conflict(job.id));
        }
        job.version = 1;
        jobs.index(job);
        jobs.records.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().await.records.get(&id).cloned())
    }

    async fn replace(&self, job: &mut Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        let stored = jobs
            .records
            .get_mut(&job.id)
            .ok_or(StoreError::NotFound(job.id))?;
        if stored.version != job.version {
            return Err(StoreError::Conflict(job.id));
        }
        job.version += 1;
        *stored = job.clone();
        jobs.index(job);
        Ok(())
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<Option<(Lease, Job)>, StoreError> {
        let now = Utc::now();
        let mut guard = self.jobs.write().await;
        let Jobs { records, active } = &mut *guard;

        let Some(id) = active
            .iter()
            .filter_map(|id| records.get(id))
            .filter(|job| job.is_claimable(now))
            .min_by_key(|job| job.updated_at)
            .map(|job| job.id)
        else {
            return Ok(None);
        };
        let job = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        let lease = Lease::grant(job.id, worker_id);
        job.claim = Some(Claim {
            token: lease.token(),
            worker_id: worker_id.to_string(),
            expires_at: now + ttl,
        });
        job.version += 1;

        Ok(Some((lease, job.clone())))
    }

    async fn put_blob(&self, id: Uuid, kind: BlobKind, bytes: &[u8]) -> Result<(), StoreError> {
        self.blobs.write().await.insert((id, kind), bytes.to_vec());
        Ok(())
    }

    async fn get_blob(&self, id: Uuid, kind: BlobKind) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.blobs.read().await.get(&(id, kind)).cloned())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
