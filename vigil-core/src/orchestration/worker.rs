//! The worker pool: a fixed set of tasks that lease jobs, heartbeat their
//! leases, dispatch to handlers, and record the outcome.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::audit::AuditLog;
use crate::config::LeaseConfig;
use crate::error::Result;

use super::dispatcher::{DispatchStatus, JobDispatcher};
use super::lease::{DequeueRequest, JobLease};
use super::persistence::{heartbeat_interval, lease_secs};
use super::queue::{JobQueue, LeaseExpiryScanner};

const POLL_MIN: Duration = Duration::from_millis(50);
const POLL_MAX: Duration = Duration::from_millis(500);
/// Cadence of the cooperative cancel-flag poll while a job runs.
const CANCEL_POLL: Duration = Duration::from_secs(2);

pub struct WorkerPool<Q>
where
    Q: JobQueue + LeaseExpiryScanner + 'static,
{
    queue: Arc<Q>,
    dispatcher: Arc<dyn JobDispatcher>,
    audit: AuditLog,
    lease: LeaseConfig,
    worker_count: usize,
    shutdown: CancellationToken,
}

impl<Q> WorkerPool<Q>
where
    Q: JobQueue + LeaseExpiryScanner + 'static,
{
    pub fn new(
        queue: Arc<Q>,
        dispatcher: Arc<dyn JobDispatcher>,
        audit: AuditLog,
        lease: LeaseConfig,
        worker_count: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            audit,
            lease,
            worker_count,
            shutdown,
        }
    }

    /// Spawn all worker tasks plus the lease janitor. Returns the join
    /// handles so the caller can await drain on shutdown.
    pub fn start(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.worker_count + 1);
        let group = std::process::id();

        for index in 0..self.worker_count {
            let worker_id = format!("worker-{group}-{index}");
            let queue = Arc::clone(&self.queue);
            let dispatcher = Arc::clone(&self.dispatcher);
            let audit = self.audit.clone();
            let lease_cfg = self.lease;
            let shutdown = self.shutdown.clone();

            handles.push(tokio::spawn(async move {
                worker_loop(worker_id, queue, dispatcher, audit, lease_cfg, shutdown).await;
            }));
        }

        handles.push(self.spawn_janitor());
        handles
    }

    fn spawn_janitor(&self) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let shutdown = self.shutdown.clone();
        let interval = Duration::from_secs(self.lease.janitor_interval_secs.max(1));

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("janitor shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        match queue.scan_expired_leases().await {
                            Ok(0) => {}
                            Ok(requeued) => {
                                tracing::info!(requeued, "janitor requeued expired leases");
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "janitor sweep failed");
                            }
                        }
                    }
                }
            }
        })
    }
}

async fn worker_loop<Q>(
    worker_id: String,
    queue: Arc<Q>,
    dispatcher: Arc<dyn JobDispatcher>,
    audit: AuditLog,
    lease_cfg: LeaseConfig,
    shutdown: CancellationToken,
) where
    Q: JobQueue + LeaseExpiryScanner + 'static,
{
    let mut poll = POLL_MIN;
    loop {
        if shutdown.is_cancelled() {
            tracing::info!(worker = %worker_id, "worker shutting down");
            break;
        }

        let lease = match queue
            .dequeue(DequeueRequest {
                worker_id: worker_id.clone(),
            })
            .await
        {
            Ok(Some(lease)) => {
                poll = POLL_MIN;
                lease
            }
            Ok(None) => {
                // Empty poll: back off up to the ceiling.
                tokio::select! {
                    _ = shutdown.cancelled() => continue,
                    _ = tokio::time::sleep(poll) => {}
                }
                poll = (poll * 2).min(POLL_MAX);
                continue;
            }
            Err(err) => {
                tracing::warn!(worker = %worker_id, error = %err, "dequeue failed");
                tokio::time::sleep(POLL_MAX).await;
                continue;
            }
        };

        if let Err(err) = run_leased_job(
            &worker_id,
            &queue,
            &dispatcher,
            &audit,
            &lease_cfg,
            &shutdown,
            lease,
        )
        .await
        {
            tracing::error!(worker = %worker_id, error = %err, "job execution bookkeeping failed");
        }
    }
}

async fn run_leased_job<Q>(
    worker_id: &str,
    queue: &Arc<Q>,
    dispatcher: &Arc<dyn JobDispatcher>,
    audit: &AuditLog,
    lease_cfg: &LeaseConfig,
    shutdown: &CancellationToken,
    lease: JobLease,
) -> Result<()>
where
    Q: JobQueue + LeaseExpiryScanner + 'static,
{
    let job = lease.job.clone();
    let job_lease_secs = lease_secs(lease_cfg, job.kind);

    audit
        .log(
            job.target_id,
            job.run_id,
            "job_leased",
            json!({
                "job_id": job.id,
                "job_kind": job.kind.as_string(),
                "attempt": job.attempts,
                "worker": worker_id,
            }),
            &format!("worker:{worker_id}"),
        )
        .await?;

    // Cooperative cancellation: the handler polls this token at suspension
    // points; a cancel poller trips it when the queue flag is set, and
    // shutdown trips it for every in-flight job.
    let cancel = CancellationToken::new();

    let heartbeat = {
        let queue = Arc::clone(queue);
        let worker_id = worker_id.to_string();
        let job_id = job.id;
        let cancel = cancel.clone();
        let interval = heartbeat_interval(job_lease_secs);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        match queue.renew(job_id, &worker_id, job_lease_secs).await {
                            Ok(_) => {}
                            Err(err) => {
                                tracing::debug!(job = %job_id, error = %err, "lease renew stopped");
                                break;
                            }
                        }
                    }
                }
            }
        })
    };

    let cancel_poller = {
        let queue = Arc::clone(queue);
        let job_id = job.id;
        let cancel = cancel.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = shutdown.cancelled() => {
                        cancel.cancel();
                        break;
                    }
                    _ = tokio::time::sleep(CANCEL_POLL) => {
                        match queue.cancel_requested(job_id).await {
                            Ok(true) => {
                                cancel.cancel();
                                break;
                            }
                            Ok(false) => {}
                            Err(err) => {
                                tracing::debug!(job = %job_id, error = %err, "cancel poll failed");
                            }
                        }
                    }
                }
            }
        })
    };

    let status = dispatcher.dispatch(&lease, &cancel).await;

    cancel.cancel();
    let _ = heartbeat.await;
    let _ = cancel_poller.await;

    let success = matches!(status, DispatchStatus::Success);
    let terminal = match &status {
        DispatchStatus::Success => {
            queue.complete(job.id, worker_id).await?;
            audit
                .log(
                    job.target_id,
                    job.run_id,
                    "job_completed",
                    json!({ "job_id": job.id, "job_kind": job.kind.as_string() }),
                    &format!("worker:{worker_id}"),
                )
                .await?;
            true
        }
        DispatchStatus::Retry { error } => {
            let disposition = queue.fail(job.id, worker_id, true, error).await?;
            audit
                .log(
                    job.target_id,
                    job.run_id,
                    "job_failed",
                    json!({
                        "job_id": job.id,
                        "job_kind": job.kind.as_string(),
                        "error": error,
                        "retrying": matches!(disposition, super::lease::FailDisposition::Requeued { .. }),
                    }),
                    &format!("worker:{worker_id}"),
                )
                .await?;
            matches!(disposition, super::lease::FailDisposition::Failed)
        }
        DispatchStatus::Fatal { error } => {
            queue.fail(job.id, worker_id, false, error).await?;
            audit
                .log(
                    job.target_id,
                    job.run_id,
                    "job_failed",
                    json!({
                        "job_id": job.id,
                        "job_kind": job.kind.as_string(),
                        "error": error,
                        "retrying": false,
                    }),
                    &format!("worker:{worker_id}"),
                )
                .await?;
            true
        }
        DispatchStatus::Cancelled { reason } => {
            let user_cancelled = queue.cancel_requested(job.id).await.unwrap_or(false);
            if shutdown.is_cancelled() && !user_cancelled {
                // Shutdown interrupted the handler, nobody asked for this job
                // to die: give it back to the queue.
                queue.fail(job.id, worker_id, true, "worker_shutdown").await?;
                audit
                    .log(
                        job.target_id,
                        job.run_id,
                        "job_released",
                        json!({ "job_id": job.id, "reason": "worker_shutdown" }),
                        &format!("worker:{worker_id}"),
                    )
                    .await?;
            } else {
                queue.mark_cancelled(job.id, worker_id, reason).await?;
                audit
                    .log(
                        job.target_id,
                        job.run_id,
                        "job_cancelled",
                        json!({ "job_id": job.id, "reason": reason }),
                        &format!("worker:{worker_id}"),
                    )
                    .await?;
            }
            true
        }
    };

    // Stage advancement only once the row is terminal; a retried job is not
    // finished and must not advance its stage.
    if terminal && !matches!(status, DispatchStatus::Cancelled { .. }) {
        dispatcher.after_terminal(&job, success).await;
    }
    Ok(())
}
