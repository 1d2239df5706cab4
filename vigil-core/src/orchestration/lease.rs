use chrono::{DateTime, Utc};

use super::job::JobRecord;

/// Exclusive, time-bounded claim on one job. The job id doubles as the lease
/// handle; all lease mutations are guarded by `(job_id, lease_owner)`.
#[derive(Clone, Debug)]
pub struct JobLease {
    pub job: JobRecord,
    pub worker_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct DequeueRequest {
    pub worker_id: String,
}

/// What happened to a failed job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FailDisposition {
    /// Re-queued with backoff; visible again at the returned instant.
    Requeued { available_at: DateTime<Utc> },
    /// Attempts exhausted (or the error was not retryable): terminal.
    Failed,
    /// The row was already in a terminal state; nothing changed.
    Unchanged,
}
