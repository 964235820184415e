//! Redis-backed job store.
//!
//! Layout per job:
//! - `{prefix}:job:{id}` hash: `doc` (JSON of the job without live fields),
//!   `stage`, `frame_count`, `frames_extracted`, `frames_processed`,
//!   `interruption`, `fallback`, `error_message`, `updated_at`
//! - `{prefix}:job:{id}:frames` set of completed frame numbers
//! - `{prefix}:job:{id}:batches` hash of batch index -> outcome JSON
//! - `{prefix}:jobs` set of all job IDs
//!
//! Stage changes, counter increments and frame recording run as Lua
//! scripts so each is a single atomic step on the server.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Script};
use tracing::{debug, info};

use upscale_models::{BatchOutcome, FallbackDecision, InterruptionRecord, Job, JobId, JobStage};

use crate::error::{JobStoreError, JobStoreResult};
use crate::store::{CounterField, JobMetadata, JobStore};

/// Compare-and-set on the `stage` field.
///
/// Returns `{1, new}` on success, `{0, actual}` on conflict, `{-1, ''}` if
/// the job does not exist.
const CONDITIONAL_STAGE_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'stage')
if not current then
    return {-1, ''}
end
if current ~= ARGV[1] then
    return {0, current}
end
redis.call('HSET', KEYS[1], 'stage', ARGV[2], 'updated_at', ARGV[3])
return {1, ARGV[2]}
"#;

/// Increment a counter, capped at `frame_count` when it is known.
const INCREMENT_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return -1
end
local value = redis.call('HINCRBY', KEYS[1], ARGV[1], ARGV[2])
local cap = tonumber(redis.call('HGET', KEYS[1], 'frame_count') or '0')
if cap > 0 and value > cap then
    redis.call('HSET', KEYS[1], ARGV[1], cap)
    value = cap
end
redis.call('HSET', KEYS[1], 'updated_at', ARGV[3])
return value
"#;

/// Add frame numbers to the completed set and bump `frames_processed` by
/// the number of frames that were not already in it.
const RECORD_FRAMES_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return -1
end
local added = 0
for i = 2, #ARGV do
    added = added + redis.call('SADD', KEYS[2], ARGV[i])
end
if added > 0 then
    redis.call('HINCRBY', KEYS[1], 'frames_processed', added)
    redis.call('HSET', KEYS[1], 'updated_at', ARGV[1])
end
return added
"#;

/// Redis connection settings.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub redis_url: String,
    /// Prefix of every key written by the store
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "upscale".to_string(),
        }
    }
}

impl RedisConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            key_prefix: std::env::var("JOBSTORE_KEY_PREFIX")
                .unwrap_or_else(|_| "upscale".to_string()),
        }
    }
}

/// Job store on a Redis server.
#[derive(Clone)]
pub struct RedisJobStore {
    client: redis::Client,
    prefix: String,
}

impl RedisJobStore {
    pub fn new(config: RedisConfig) -> JobStoreResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self {
            client,
            prefix: config.key_prefix,
        })
    }

    pub fn from_env() -> JobStoreResult<Self> {
        Self::new(RedisConfig::from_env())
    }

    fn job_key(&self, job_id: &JobId) -> String {
        format!("{}:job:{}", self.prefix, job_id)
    }

    fn frames_key(&self, job_id: &JobId) -> String {
        format!("{}:job:{}:frames", self.prefix, job_id)
    }

    fn batches_key(&self, job_id: &JobId) -> String {
        format!("{}:job:{}:batches", self.prefix, job_id)
    }

    fn index_key(&self) -> String {
        format!("{}:jobs", self.prefix)
    }

    async fn connection(&self) -> JobStoreResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| JobStoreError::connection_failed(e.to_string()))
    }

    /// Set fields on an existing job hash.
    async fn set_fields(&self, job_id: &JobId, fields: &[(&str, String)]) -> JobStoreResult<()> {
        let mut conn = self.connection().await?;
        let key = self.job_key(job_id);

        let exists: bool = conn.exists(&key).await?;
        if !exists {
            return Err(JobStoreError::not_found(job_id.as_str()));
        }

        let mut items: Vec<(&str, String)> = fields.to_vec();
        items.push(("updated_at", Utc::now().to_rfc3339()));
        conn.hset_multiple::<_, _, _, ()>(&key, &items[..]).await?;
        Ok(())
    }
}

/// Rebuild a job from its hash fields.
fn job_from_fields(job_id: &JobId, fields: HashMap<String, String>) -> JobStoreResult<Job> {
    let corrupt = |what: &str| JobStoreError::Corrupt(job_id.to_string(), what.to_string());

    let doc = fields.get("doc").ok_or_else(|| corrupt("missing doc"))?;
    let mut job: Job = serde_json::from_str(doc)?;

    if let Some(stage) = fields.get("stage") {
        job.stage = stage.parse().map_err(|e: String| corrupt(&e))?;
    }
    let counter = |name: &str| -> u32 {
        fields
            .get(name)
            .and_then(|v| v.parse::<i64>().ok())
            .map(|v| v.max(0) as u32)
            .unwrap_or(0)
    };
    job.frames_extracted = counter("frames_extracted");
    job.frames_processed = counter("frames_processed");
    if let Some(raw) = fields.get("interruption") {
        job.interruption = Some(serde_json::from_str(raw)?);
    }
    if let Some(raw) = fields.get("fallback") {
        job.fallback = Some(serde_json::from_str(raw)?);
    }
    if let Some(message) = fields.get("error_message") {
        job.error_message = Some(message.clone());
    }
    if let Some(updated) = fields
        .get("updated_at")
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
    {
        job.updated_at = updated.with_timezone(&Utc);
    }
    Ok(job)
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn create_job(&self, job: &Job) -> JobStoreResult<()> {
        let mut conn = self.connection().await?;
        let key = self.job_key(&job.job_id);

        let created: bool = conn.hset_nx(&key, "doc", serde_json::to_string(job)?).await?;
        if !created {
            return Err(JobStoreError::AlreadyExists(job.job_id.to_string()));
        }

        conn.hset_multiple::<_, _, _, ()>(
            &key,
            &[
                ("stage", job.stage.as_str().to_string()),
                ("frame_count", job.frame_count.to_string()),
                ("frames_extracted", job.frames_extracted.to_string()),
                ("frames_processed", job.frames_processed.to_string()),
                ("updated_at", job.updated_at.to_rfc3339()),
            ],
        )
        .await?;
        conn.sadd::<_, _, ()>(self.index_key(), job.job_id.as_str())
            .await?;

        info!(job_id = %job.job_id, video = %job.video_name, "Created job");
        Ok(())
    }

    async fn get_job(&self, job_id: &JobId) -> JobStoreResult<Job> {
        let mut conn = self.connection().await?;
        let fields: HashMap<String, String> = conn.hgetall(self.job_key(job_id)).await?;
        if fields.is_empty() {
            return Err(JobStoreError::not_found(job_id.as_str()));
        }
        job_from_fields(job_id, fields)
    }

    async fn conditional_update_stage(
        &self,
        job_id: &JobId,
        expected: JobStage,
        new: JobStage,
    ) -> JobStoreResult<Job> {
        expected.transition(new)?;

        let mut conn = self.connection().await?;
        let (status, stage): (i64, String) = Script::new(CONDITIONAL_STAGE_SCRIPT)
            .key(self.job_key(job_id))
            .arg(expected.as_str())
            .arg(new.as_str())
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await?;

        match status {
            1 => {
                debug!(job_id = %job_id, from = %expected, to = %new, "Stage updated");
                self.get_job(job_id).await
            }
            0 => {
                let actual = stage
                    .parse()
                    .map_err(|e: String| JobStoreError::Corrupt(job_id.to_string(), e))?;
                Err(JobStoreError::StateConflict {
                    job_id: job_id.to_string(),
                    expected,
                    actual,
                })
            }
            _ => Err(JobStoreError::not_found(job_id.as_str())),
        }
    }

    async fn atomic_increment(
        &self,
        job_id: &JobId,
        field: CounterField,
        delta: u32,
    ) -> JobStoreResult<u32> {
        let mut conn = self.connection().await?;
        let value: i64 = Script::new(INCREMENT_SCRIPT)
            .key(self.job_key(job_id))
            .arg(field.as_str())
            .arg(delta)
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await?;

        if value < 0 {
            return Err(JobStoreError::not_found(job_id.as_str()));
        }
        Ok(value as u32)
    }

    async fn record_frames_processed(&self, job_id: &JobId, frames: &[u32]) -> JobStoreResult<u32> {
        if frames.is_empty() {
            return Ok(0);
        }

        let mut conn = self.connection().await?;
        let script = Script::new(RECORD_FRAMES_SCRIPT);
        let mut invocation = script.key(self.job_key(job_id));
        invocation
            .key(self.frames_key(job_id))
            .arg(Utc::now().to_rfc3339());
        for frame in frames {
            invocation.arg(*frame);
        }
        let added: i64 = invocation.invoke_async(&mut conn).await?;

        if added < 0 {
            return Err(JobStoreError::not_found(job_id.as_str()));
        }
        Ok(added as u32)
    }

    async fn update_metadata(&self, job_id: &JobId, metadata: &JobMetadata) -> JobStoreResult<()> {
        // Only the state machine driver writes metadata, so a plain
        // read-modify-write of the document is safe.
        let mut conn = self.connection().await?;
        let key = self.job_key(job_id);
        let doc: Option<String> = conn.hget(&key, "doc").await?;
        let doc = doc.ok_or_else(|| JobStoreError::not_found(job_id.as_str()))?;

        let mut job: Job = serde_json::from_str(&doc)?;
        metadata.apply_to(&mut job);

        self.set_fields(
            job_id,
            &[
                ("doc", serde_json::to_string(&job)?),
                ("frame_count", job.frame_count.to_string()),
            ],
        )
        .await
    }

    async fn record_batch_outcome(&self, outcome: &BatchOutcome) -> JobStoreResult<()> {
        let mut conn = self.connection().await?;
        conn.hset::<_, _, _, ()>(
            self.batches_key(&outcome.job_id),
            outcome.index,
            serde_json::to_string(outcome)?,
        )
        .await?;
        debug!(
            job_id = %outcome.job_id,
            batch = outcome.index,
            status = outcome.status.as_str(),
            "Recorded batch outcome"
        );
        Ok(())
    }

    async fn batch_outcomes(&self, job_id: &JobId) -> JobStoreResult<Vec<BatchOutcome>> {
        let mut conn = self.connection().await?;
        let raw: HashMap<String, String> = conn.hgetall(self.batches_key(job_id)).await?;

        let mut outcomes = raw
            .values()
            .map(|v| serde_json::from_str::<BatchOutcome>(v))
            .collect::<Result<Vec<_>, _>>()?;
        outcomes.sort_by_key(|o| o.index);
        Ok(outcomes)
    }

    async fn clear_batch_outcome(&self, job_id: &JobId, index: u32) -> JobStoreResult<()> {
        let mut conn = self.connection().await?;
        conn.hdel::<_, _, ()>(self.batches_key(job_id), index).await?;
        Ok(())
    }

    async fn record_interruption(
        &self,
        job_id: &JobId,
        interruption: &InterruptionRecord,
    ) -> JobStoreResult<()> {
        self.set_fields(job_id, &[("interruption", serde_json::to_string(interruption)?)])
            .await
    }

    async fn record_fallback(
        &self,
        job_id: &JobId,
        decision: &FallbackDecision,
    ) -> JobStoreResult<()> {
        self.set_fields(job_id, &[("fallback", serde_json::to_string(decision)?)])
            .await
    }

    async fn set_error(&self, job_id: &JobId, message: &str) -> JobStoreResult<()> {
        self.set_fields(job_id, &[("error_message", message.to_string())])
            .await
    }

    async fn list_jobs(&self) -> JobStoreResult<Vec<Job>> {
        let mut conn = self.connection().await?;
        let ids: Vec<String> = conn.smembers(self.index_key()).await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_job(&JobId::from_string(id)).await {
                Ok(job) => jobs.push(job),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }
}
