//! Routes leased jobs to their handlers and classifies failures.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::pipeline::PipelineOrchestrator;
use crate::verify::Verifier;

use super::job::{JobPayload, JobRecord};
use super::lease::JobLease;

/// Outcome of dispatching a single job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DispatchStatus {
    Success,
    Retry { error: String },
    Fatal { error: String },
    Cancelled { reason: String },
}

#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn dispatch(&self, lease: &JobLease, cancel: &CancellationToken) -> DispatchStatus;

    /// Invoked by the worker after the queue row reached its terminal state,
    /// so stage advancement counts this job as finished.
    async fn after_terminal(&self, job: &JobRecord, success: bool);
}

pub struct EngineDispatcher {
    orchestrator: PipelineOrchestrator,
    verifier: Verifier,
}

impl EngineDispatcher {
    pub fn new(orchestrator: PipelineOrchestrator, verifier: Verifier) -> Self {
        Self {
            orchestrator,
            verifier,
        }
    }

    fn classify(err: EngineError) -> DispatchStatus {
        match err {
            EngineError::Cancelled(reason) => DispatchStatus::Cancelled { reason },
            err if err.is_retryable() => DispatchStatus::Retry {
                error: format!("{}: {err}", err.reason_code()),
            },
            err => DispatchStatus::Fatal {
                error: format!("{}: {err}", err.reason_code()),
            },
        }
    }
}

#[async_trait]
impl JobDispatcher for EngineDispatcher {
    async fn dispatch(&self, lease: &JobLease, cancel: &CancellationToken) -> DispatchStatus {
        let job = &lease.job;
        let result = match &job.payload {
            JobPayload::Pipeline(stage_job) => {
                self.orchestrator.run_stage(job, stage_job, cancel).await
            }
            JobPayload::Scan(scan_job) => self.orchestrator.run_scan(job, scan_job, cancel).await,
            JobPayload::VerifyAsset(verify_job) => {
                self.verifier.verify_asset(job.target_id, verify_job).await
            }
            JobPayload::VerifyService(verify_job) => {
                self.verifier.verify_service(job.target_id, verify_job).await
            }
        };

        match result {
            Ok(()) => DispatchStatus::Success,
            Err(err) => {
                tracing::warn!(job = %job.id, kind = %job.kind, error = %err, "job handler failed");
                Self::classify(err)
            }
        }
    }

    async fn after_terminal(&self, job: &JobRecord, success: bool) {
        match &job.payload {
            JobPayload::Scan(scan_job) => {
                if let Err(err) = self
                    .orchestrator
                    .on_scan_terminal(job, scan_job, success)
                    .await
                {
                    tracing::error!(job = %job.id, error = %err, "stage advancement failed");
                }
            }
            JobPayload::VerifyAsset(_) | JobPayload::VerifyService(_) => {
                if let Err(err) = self.orchestrator.on_verify_terminal(job).await {
                    tracing::error!(job = %job.id, error = %err, "verification run close-out failed");
                }
            }
            JobPayload::Pipeline(_) => {}
        }
    }
}
