use async_trait::async_trait;
use chrono::{Duration, Utc};
use redis::AsyncCommands;
use uuid::Uuid;

use crate::models::job::{BlobKind, Claim, Job, Lease};
use crate::store::{JobStore, StoreError};

const KEY_PREFIX: &str = "essayflow:job";
/// Ids of jobs whose status the worker pool advances.
const ACTIVE_KEY: &str = "essayflow:active";

/// KEYS: job, version, active set.
/// ARGV: payload, new version, ttl secs, job id, active flag.
const INSERT_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[2]) == 1 then return 0 end
redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[3])
redis.call('SET', KEYS[2], ARGV[2], 'EX', ARGV[3])
if ARGV[5] == '1' then redis.call('SADD', KEYS[3], ARGV[4]) end
return 1
"#;

/// KEYS: job, version, active set.
/// ARGV: expected version, payload, new version, ttl secs, job id, active flag.
const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[2])
if not current then return -1 end
if current ~= ARGV[1] then return 0 end
redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[4])
redis.call('SET', KEYS[2], ARGV[3], 'EX', ARGV[4])
if ARGV[6] == '1' then
  redis.call('SADD', KEYS[3], ARGV[5])
else
  redis.call('SREM', KEYS[3], ARGV[5])
end
return 1
"#;

/// Redis-backed job store shared by the API server and worker processes.
///
/// Each job is a JSON document with a sibling version key; writes go through
/// Lua scripts so the version check and the write are atomic.
pub struct RedisJobStore {
    client: redis::Client,
    ttl_secs: u64,
    insert_script: redis::Script,
    cas_script: redis::Script,
}

impl RedisJobStore {
    pub fn new(redis_url: &str, ttl_secs: u64) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            ttl_secs,
            insert_script: redis::Script::new(INSERT_SCRIPT),
            cas_script: redis::Script::new(CAS_SCRIPT),
        })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn job_key(id: Uuid) -> String {
        format!("{KEY_PREFIX}:{id}")
    }

    fn version_key(id: Uuid) -> String {
        format!("{KEY_PREFIX}:{id}:version")
    }

    fn blob_key(id: Uuid, kind: BlobKind) -> String {
        format!("{KEY_PREFIX}:{id}:{}", kind.key_suffix())
    }

    fn active_flag(job: &Job) -> &'static str {
        if job.status().is_auto() {
            "1"
        } else {
            "0"
        }
    }

    /// Run the CAS script. Returns the raw script result.
    async fn compare_and_set(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        job: &Job,
        expected: u64,
    ) -> Result<i64, StoreError> {
        let payload = serde_json::to_string(job)?;
        let mut invocation = self.cas_script.prepare_invoke();
        invocation
            .key(Self::job_key(job.id))
            .key(Self::version_key(job.id))
            .key(ACTIVE_KEY)
            .arg(expected.to_string())
            .arg(payload)
            .arg(job.version.to_string())
            .arg(self.ttl_secs)
            .arg(job.id.to_string())
            .arg(Self::active_flag(job));
        Ok(invocation.invoke_async(conn).await?)
    }

    async fn load(
        conn: &mut redis::aio::MultiplexedConnection,
        id: Uuid,
    ) -> Result<Option<Job>, StoreError> {
        let payload: Option<String> = conn.get(Self::job_key(id)).await?;
        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn insert(&self, job: &mut Job) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        job.version = 1;
        let payload = serde_json::to_string(job)?;

        let mut invocation = self.insert_script.prepare_invoke();
        invocation
            .key(Self::job_key(job.id))
            .key(Self::version_key(job.id))
            .key(ACTIVE_KEY)
            .arg(payload)
            .arg(job.version.to_string())
            .arg(self.ttl_secs)
            .arg(job.id.to_string())
            .arg(Self::active_flag(job));
        let inserted: i64 = invocation.invoke_async(&mut conn).await?;

        if inserted == 1 {
            Ok(())
        } else {
            Err(StoreError::Conflict(job.id))
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let mut conn = self.conn().await?;
        Self::load(&mut conn, id).await
    }

    async fn replace(&self, job: &mut Job) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let expected = job.version;
        job.version += 1;

        match self.compare_and_set(&mut conn, job, expected).await {
            Ok(1) => Ok(()),
            Ok(result) => {
                job.version = expected;
                if result < 0 {
                    Err(StoreError::NotFound(job.id))
                } else {
                    Err(StoreError::Conflict(job.id))
                }
            }
            Err(e) => {
                job.version = expected;
                Err(e)
            }
        }
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<Option<(Lease, Job)>, StoreError> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.smembers(ACTIVE_KEY).await?;
        let now = Utc::now();

        let mut candidates = Vec::new();
        for raw in ids {
            let Ok(id) = Uuid::parse_str(&raw) else {
                conn.srem::<_, _, ()>(ACTIVE_KEY, &raw).await?;
                continue;
            };
            match Self::load(&mut conn, id).await? {
                Some(job) if job.is_claimable(now) => candidates.push(job),
                Some(_) => {}
                // expired by retention
                None => conn.srem::<_, _, ()>(ACTIVE_KEY, &raw).await?,
            }
        }
        candidates.sort_by_key(|job| job.updated_at);

        for mut job in candidates {
            let lease = Lease::grant(job.id, worker_id);
            job.claim = Some(Claim {
                token: lease.token(),
                worker_id: worker_id.to_string(),
                expires_at: now + ttl,
            });
            let expected = job.version;
            job.version += 1;

            // losing the race means another worker claimed it first
            if self.compare_and_set(&mut conn, &job, expected).await? == 1 {
                return Ok(Some((lease, job)));
            }
        }

        Ok(None)
    }

    async fn put_blob(&self, id: Uuid, kind: BlobKind, bytes: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        conn.set_ex::<_, _, ()>(Self::blob_key(id, kind), bytes, self.ttl_secs)
            .await?;
        Ok(())
    }

    async fn get_blob(&self, id: Uuid, kind: BlobKind) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn().await?;
        Ok(conn.get(Self::blob_key(id, kind)).await?)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_share_job_prefix() {
        let id = Uuid::nil();
        assert_eq!(
            RedisJobStore::job_key(id),
            "essayflow:job:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(
            RedisJobStore::blob_key(id, BlobKind::ReferenceImage(2)),
            "essayflow:job:00000000-0000-0000-0000-000000000000:ref_image:2"
        );
        assert!(RedisJobStore::version_key(id).ends_with(":version"));
    }
}
