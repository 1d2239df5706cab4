//! Durable job queue and worker pool.

pub mod dispatcher;
pub mod job;
pub mod lease;
pub mod persistence;
pub mod queue;
pub mod worker;

pub use dispatcher::{DispatchStatus, EngineDispatcher, JobDispatcher};
pub use job::{
    EnqueueRequest, JobHandle, JobKind, JobPayload, JobRecord, JobStatus, PipelineJob, ScanJob,
    ScannerKind, VerifyAssetJob, VerifyServiceJob, PRIORITY_PIPELINE, PRIORITY_SCAN,
    PRIORITY_VERIFY,
};
pub use lease::{DequeueRequest, FailDisposition, JobLease};
pub use persistence::PostgresJobQueue;
pub use queue::{JobQueue, LeaseExpiryScanner, QueueInstrumentation, QueueSnapshot};
pub use worker::WorkerPool;
