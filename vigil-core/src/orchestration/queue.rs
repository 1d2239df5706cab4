//! Queue service contracts consumed by the worker pool and orchestrator.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{JobId, RunId};

use super::job::{EnqueueRequest, JobHandle};
use super::lease::{DequeueRequest, FailDisposition, JobLease};

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<JobHandle>;

    /// Enqueue several jobs atomically.
    async fn enqueue_many(&self, requests: Vec<EnqueueRequest>) -> Result<Vec<JobHandle>>;

    /// Lease the next eligible job, honouring the global and per-target
    /// concurrency caps. Returns `None` when nothing is leasable.
    async fn dequeue(&self, request: DequeueRequest) -> Result<Option<JobLease>>;

    /// Heartbeat: extend a held lease. Fails with NotFound when the lease was
    /// lost (janitor reclaim or completion elsewhere).
    async fn renew(&self, job_id: JobId, worker_id: &str, extend_secs: i64)
        -> Result<DateTime<Utc>>;

    async fn complete(&self, job_id: JobId, worker_id: &str) -> Result<()>;

    async fn fail(
        &self,
        job_id: JobId,
        worker_id: &str,
        retryable: bool,
        error: &str,
    ) -> Result<FailDisposition>;

    /// Cancel one job: queued rows transition immediately; running rows get
    /// the cooperative cancel flag which handlers poll.
    async fn cancel(&self, job_id: JobId, reason: &str) -> Result<()>;

    /// Cascade cancellation to every non-terminal job of a run. Returns how
    /// many rows were touched.
    async fn cancel_for_run(&self, run_id: RunId, reason: &str) -> Result<u64>;

    async fn mark_cancelled(&self, job_id: JobId, worker_id: &str, reason: &str) -> Result<()>;

    async fn cancel_requested(&self, job_id: JobId) -> Result<bool>;

    /// Unfinished scanner jobs for `(run, stage)`; zero means the stage is
    /// done and the next one may be enqueued.
    async fn open_stage_jobs(&self, run_id: RunId, stage: &str) -> Result<i64>;

    /// Unfinished jobs of any kind for a run.
    async fn open_run_jobs(&self, run_id: RunId) -> Result<i64>;
}

/// Durable queues can sweep expired leases back to `queued`.
#[async_trait]
pub trait LeaseExpiryScanner: Send + Sync {
    /// Returns the number of jobs returned to the queue.
    async fn scan_expired_leases(&self) -> Result<u64>;
}

#[async_trait]
pub trait QueueInstrumentation: Send + Sync {
    async fn queue_snapshot(&self) -> Result<QueueSnapshot>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub sampled_at: DateTime<Utc>,
    pub by_status: HashMap<String, usize>,
}

impl QueueSnapshot {
    pub fn new(sampled_at: DateTime<Utc>) -> Self {
        Self {
            sampled_at,
            by_status: HashMap::new(),
        }
    }
}
