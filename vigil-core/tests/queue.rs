//! Durable queue behaviour against a real Postgres: leases, caps, retries,
//! janitor reclaim and cancellation.

use chrono::Utc;
use sqlx::{PgPool, Row};

use vigil_core::config::{ConcurrencyLimits, LeaseConfig, RetryConfig};
use vigil_core::db::TargetRepo;
use vigil_core::model::PipelineConfig;
use vigil_core::orchestration::{
    DequeueRequest, EnqueueRequest, FailDisposition, JobPayload, JobQueue, LeaseExpiryScanner,
    PipelineJob, PostgresJobQueue, ScanJob, ScannerKind, PRIORITY_PIPELINE, PRIORITY_VERIFY,
};
use vigil_core::pipeline::PipelineStage;
use vigil_core::scope::ScopePolicy;
use vigil_core::types::{AssetId, RunId, TargetId};

async fn seed_target(pool: &PgPool) -> TargetId {
    seed_target_with_scope(pool, ScopePolicy::for_root("example.com")).await
}

async fn seed_target_with_scope(pool: &PgPool, scope: ScopePolicy) -> TargetId {
    let repo = TargetRepo::new(pool.clone());
    let unique_root = format!("{}.example.com", uuid::Uuid::now_v7().simple());
    let mut scope = scope;
    scope.root_domain = unique_root.clone();
    let target = repo
        .create(&unique_root, &unique_root, &scope)
        .await
        .expect("seed target");
    target.id
}

async fn seed_run(pool: &PgPool, target_id: TargetId) -> RunId {
    let run_id = RunId::new();
    sqlx::query("INSERT INTO runs (id, target_id, trigger, status) VALUES ($1, $2, 'manual', 'running')")
        .bind(run_id.0)
        .bind(target_id.0)
        .execute(pool)
        .await
        .expect("seed run");
    run_id
}

fn queue_with_caps(pool: &PgPool, global: i64, per_target: i64) -> PostgresJobQueue {
    PostgresJobQueue::new(
        pool.clone(),
        ConcurrencyLimits {
            max_concurrent_jobs_global: global,
            max_concurrent_jobs_per_target: per_target,
        },
        LeaseConfig::default(),
        RetryConfig::default(),
    )
}

fn scan_payload(run_id: RunId, target: &str) -> JobPayload {
    JobPayload::Scan(ScanJob {
        run_id,
        stage: PipelineStage::Nmap,
        scanner: ScannerKind::Nmap,
        target: target.to_string(),
        targets: Vec::new(),
        config: PipelineConfig::default(),
    })
}

fn pipeline_payload(run_id: RunId) -> JobPayload {
    JobPayload::Pipeline(PipelineJob {
        run_id,
        stage: PipelineStage::FIRST,
        config: PipelineConfig::default(),
    })
}

#[sqlx::test]
async fn enqueue_creates_queued_row_and_duplicates_merge(pool: PgPool) {
    let queue = queue_with_caps(&pool, 5, 5);
    let target_id = seed_target(&pool).await;
    let run_id = seed_run(&pool, target_id).await;

    let first = queue
        .enqueue(EnqueueRequest::new(
            target_id,
            scan_payload(run_id, "198.51.100.7"),
            PRIORITY_PIPELINE,
        ))
        .await
        .expect("enqueue");
    assert!(first.accepted);

    let status: String = sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1")
        .bind(first.job_id.0)
        .fetch_one(&pool)
        .await
        .expect("job row");
    assert_eq!(status, "queued");

    let second = queue
        .enqueue(EnqueueRequest::new(
            target_id,
            scan_payload(run_id, "198.51.100.7"),
            PRIORITY_PIPELINE,
        ))
        .await
        .expect("enqueue dup");
    assert!(!second.accepted, "duplicate should merge");
    assert_eq!(second.job_id, first.job_id);

    let active: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status IN ('queued', 'running')")
            .fetch_one(&pool)
            .await
            .expect("count");
    assert_eq!(active, 1);
}

#[sqlx::test]
async fn dequeue_leases_exactly_one_and_increments_attempts(pool: PgPool) {
    let queue = queue_with_caps(&pool, 5, 5);
    let target_id = seed_target(&pool).await;
    let run_id = seed_run(&pool, target_id).await;

    for host in ["198.51.100.7", "198.51.100.8"] {
        queue
            .enqueue(EnqueueRequest::new(
                target_id,
                scan_payload(run_id, host),
                PRIORITY_PIPELINE,
            ))
            .await
            .expect("enqueue");
    }

    let lease = queue
        .dequeue(DequeueRequest {
            worker_id: "w1".to_string(),
        })
        .await
        .expect("dequeue")
        .expect("job available");

    assert_eq!(lease.job.attempts, 1);
    assert_eq!(lease.job.lease_owner.as_deref(), Some("w1"));
    assert!(lease.expires_at > Utc::now());

    let ready: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = 'queued'")
        .fetch_one(&pool)
        .await
        .expect("count");
    assert_eq!(ready, 1, "the second job stays queued");
}

#[sqlx::test]
async fn two_workers_never_lease_the_same_row(pool: PgPool) {
    let queue = queue_with_caps(&pool, 5, 5);
    let target_id = seed_target(&pool).await;
    let run_id = seed_run(&pool, target_id).await;
    queue
        .enqueue(EnqueueRequest::new(
            target_id,
            scan_payload(run_id, "198.51.100.7"),
            PRIORITY_PIPELINE,
        ))
        .await
        .expect("enqueue");

    let (a, b) = tokio::join!(
        queue.dequeue(DequeueRequest {
            worker_id: "wa".to_string()
        }),
        queue.dequeue(DequeueRequest {
            worker_id: "wb".to_string()
        }),
    );
    let a = a.expect("dequeue a");
    let b = b.expect("dequeue b");
    assert!(
        a.is_some() != b.is_some(),
        "exactly one worker wins the single job"
    );
}

#[sqlx::test]
async fn per_target_cap_blocks_second_lease(pool: PgPool) {
    let queue = queue_with_caps(&pool, 10, 1);
    let target_id = seed_target(&pool).await;
    let run_id = seed_run(&pool, target_id).await;
    for host in ["198.51.100.7", "198.51.100.8"] {
        queue
            .enqueue(EnqueueRequest::new(
                target_id,
                scan_payload(run_id, host),
                PRIORITY_PIPELINE,
            ))
            .await
            .expect("enqueue");
    }

    let first = queue
        .dequeue(DequeueRequest {
            worker_id: "w1".to_string(),
        })
        .await
        .expect("dequeue 1");
    assert!(first.is_some());

    let second = queue
        .dequeue(DequeueRequest {
            worker_id: "w2".to_string(),
        })
        .await
        .expect("dequeue 2");
    assert!(second.is_none(), "per-target cap of 1 is enforced");

    // Completing the first job releases the slot.
    let lease = first.unwrap();
    queue.complete(lease.job.id, "w1").await.expect("complete");
    let third = queue
        .dequeue(DequeueRequest {
            worker_id: "w2".to_string(),
        })
        .await
        .expect("dequeue 3");
    assert!(third.is_some());
}

#[sqlx::test]
async fn scope_policy_lowers_the_per_target_cap(pool: PgPool) {
    let queue = queue_with_caps(&pool, 10, 5);
    let mut scope = ScopePolicy::for_root("example.com");
    scope.max_concurrent_jobs = Some(1);
    let target_id = seed_target_with_scope(&pool, scope).await;
    let run_id = seed_run(&pool, target_id).await;
    for host in ["198.51.100.7", "198.51.100.8"] {
        queue
            .enqueue(EnqueueRequest::new(
                target_id,
                scan_payload(run_id, host),
                PRIORITY_PIPELINE,
            ))
            .await
            .expect("enqueue");
    }

    assert!(queue
        .dequeue(DequeueRequest {
            worker_id: "w1".to_string()
        })
        .await
        .expect("dequeue")
        .is_some());
    assert!(
        queue
            .dequeue(DequeueRequest {
                worker_id: "w2".to_string()
            })
            .await
            .expect("dequeue")
            .is_none(),
        "scope override caps the target at one running job"
    );
}

#[sqlx::test]
async fn global_cap_holds_across_targets(pool: PgPool) {
    let queue = queue_with_caps(&pool, 2, 2);
    let run_jobs = 3;
    for _ in 0..run_jobs {
        let target_id = seed_target(&pool).await;
        let run_id = seed_run(&pool, target_id).await;
        queue
            .enqueue(EnqueueRequest::new(
                target_id,
                scan_payload(run_id, "198.51.100.7"),
                PRIORITY_PIPELINE,
            ))
            .await
            .expect("enqueue");
    }

    let mut leased = 0;
    for index in 0..run_jobs {
        if queue
            .dequeue(DequeueRequest {
                worker_id: format!("w{index}"),
            })
            .await
            .expect("dequeue")
            .is_some()
        {
            leased += 1;
        }
    }
    assert_eq!(leased, 2, "global cap of 2 is enforced");

    let running: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = 'running'")
        .fetch_one(&pool)
        .await
        .expect("count");
    assert_eq!(running, 2);
}

#[sqlx::test]
async fn higher_priority_dequeues_first(pool: PgPool) {
    let queue = queue_with_caps(&pool, 5, 5);
    let target_id = seed_target(&pool).await;
    let run_id = seed_run(&pool, target_id).await;

    queue
        .enqueue(EnqueueRequest::new(
            target_id,
            pipeline_payload(run_id),
            PRIORITY_PIPELINE,
        ))
        .await
        .expect("enqueue pipeline");
    let verify = queue
        .enqueue(EnqueueRequest::new(
            target_id,
            JobPayload::VerifyAsset(vigil_core::orchestration::VerifyAssetJob {
                asset_id: AssetId::new(),
                run_id,
            }),
            PRIORITY_VERIFY,
        ))
        .await
        .expect("enqueue verify");

    let lease = queue
        .dequeue(DequeueRequest {
            worker_id: "w1".to_string(),
        })
        .await
        .expect("dequeue")
        .expect("job");
    assert_eq!(lease.job.id, verify.job_id, "verification preempts pipelines");
}

#[sqlx::test]
async fn retryable_failure_requeues_with_backoff(pool: PgPool) {
    let queue = queue_with_caps(&pool, 5, 5);
    let target_id = seed_target(&pool).await;
    let run_id = seed_run(&pool, target_id).await;
    queue
        .enqueue(EnqueueRequest::new(
            target_id,
            scan_payload(run_id, "198.51.100.7"),
            PRIORITY_PIPELINE,
        ))
        .await
        .expect("enqueue");

    let lease = queue
        .dequeue(DequeueRequest {
            worker_id: "w1".to_string(),
        })
        .await
        .expect("dequeue")
        .expect("job");

    let disposition = queue
        .fail(lease.job.id, "w1", true, "scanner_timeout: simulated")
        .await
        .expect("fail");
    let FailDisposition::Requeued { available_at } = disposition else {
        panic!("expected requeue, got {disposition:?}");
    };
    assert!(available_at > Utc::now(), "backoff pushes availability out");

    let row = sqlx::query("SELECT status, attempts, last_error FROM jobs WHERE id = $1")
        .bind(lease.job.id.0)
        .fetch_one(&pool)
        .await
        .expect("row");
    assert_eq!(row.get::<String, _>("status"), "queued");
    assert_eq!(row.get::<i32, _>("attempts"), 1);
    assert!(row.get::<String, _>("last_error").contains("scanner_timeout"));
}

#[sqlx::test]
async fn attempts_exhaustion_fails_terminally(pool: PgPool) {
    let queue = queue_with_caps(&pool, 5, 5);
    let target_id = seed_target(&pool).await;
    let run_id = seed_run(&pool, target_id).await;
    let mut request = EnqueueRequest::new(
        target_id,
        scan_payload(run_id, "198.51.100.7"),
        PRIORITY_PIPELINE,
    );
    request.max_attempts = Some(1);
    queue.enqueue(request).await.expect("enqueue");

    let lease = queue
        .dequeue(DequeueRequest {
            worker_id: "w1".to_string(),
        })
        .await
        .expect("dequeue")
        .expect("job");
    let disposition = queue
        .fail(lease.job.id, "w1", true, "scanner_error: boom")
        .await
        .expect("fail");
    assert_eq!(disposition, FailDisposition::Failed);

    let status: String = sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1")
        .bind(lease.job.id.0)
        .fetch_one(&pool)
        .await
        .expect("row");
    assert_eq!(status, "failed");
}

#[sqlx::test]
async fn janitor_requeues_expired_leases_without_extra_attempts(pool: PgPool) {
    let queue = queue_with_caps(&pool, 5, 5);
    let target_id = seed_target(&pool).await;
    let run_id = seed_run(&pool, target_id).await;
    queue
        .enqueue(EnqueueRequest::new(
            target_id,
            scan_payload(run_id, "198.51.100.7"),
            PRIORITY_PIPELINE,
        ))
        .await
        .expect("enqueue");

    let lease = queue
        .dequeue(DequeueRequest {
            worker_id: "w1".to_string(),
        })
        .await
        .expect("dequeue")
        .expect("job");

    // Simulate a dead worker by expiring the lease.
    sqlx::query("UPDATE jobs SET lease_expires_at = NOW() - INTERVAL '1 second' WHERE id = $1")
        .bind(lease.job.id.0)
        .execute(&pool)
        .await
        .expect("expire lease");

    let requeued = queue.scan_expired_leases().await.expect("janitor");
    assert_eq!(requeued, 1);

    let row = sqlx::query("SELECT status, attempts, lease_owner FROM jobs WHERE id = $1")
        .bind(lease.job.id.0)
        .fetch_one(&pool)
        .await
        .expect("row");
    assert_eq!(row.get::<String, _>("status"), "queued");
    assert_eq!(
        row.get::<i32, _>("attempts"),
        1,
        "janitor must not charge an extra attempt"
    );
    assert!(row.get::<Option<String>, _>("lease_owner").is_none());

    // The dead worker's late completion is a no-op.
    queue.complete(lease.job.id, "w1").await.expect("stale complete");
    let status: String = sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1")
        .bind(lease.job.id.0)
        .fetch_one(&pool)
        .await
        .expect("row");
    assert_eq!(status, "queued", "no duplicate completion after reclaim");
}

#[sqlx::test]
async fn cancel_is_immediate_when_queued_and_cooperative_when_running(pool: PgPool) {
    let queue = queue_with_caps(&pool, 5, 5);
    let target_id = seed_target(&pool).await;
    let run_id = seed_run(&pool, target_id).await;

    let queued = queue
        .enqueue(EnqueueRequest::new(
            target_id,
            scan_payload(run_id, "198.51.100.7"),
            PRIORITY_PIPELINE,
        ))
        .await
        .expect("enqueue");
    queue.cancel(queued.job_id, "operator request").await.expect("cancel");
    let status: String = sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1")
        .bind(queued.job_id.0)
        .fetch_one(&pool)
        .await
        .expect("row");
    assert_eq!(status, "cancelled");

    let running = queue
        .enqueue(EnqueueRequest::new(
            target_id,
            scan_payload(run_id, "198.51.100.8"),
            PRIORITY_PIPELINE,
        ))
        .await
        .expect("enqueue");
    let lease = queue
        .dequeue(DequeueRequest {
            worker_id: "w1".to_string(),
        })
        .await
        .expect("dequeue")
        .expect("job");
    assert_eq!(lease.job.id, running.job_id);

    queue.cancel(running.job_id, "operator request").await.expect("cancel");
    assert!(queue.cancel_requested(running.job_id).await.expect("flag"));
    let status: String = sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1")
        .bind(running.job_id.0)
        .fetch_one(&pool)
        .await
        .expect("row");
    assert_eq!(status, "running", "running jobs finish cooperatively");

    queue
        .mark_cancelled(running.job_id, "w1", "operator request")
        .await
        .expect("mark cancelled");
    let status: String = sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1")
        .bind(running.job_id.0)
        .fetch_one(&pool)
        .await
        .expect("row");
    assert_eq!(status, "cancelled");
}

#[sqlx::test]
async fn cancel_for_run_cascades_to_children(pool: PgPool) {
    let queue = queue_with_caps(&pool, 5, 5);
    let target_id = seed_target(&pool).await;
    let run_id = seed_run(&pool, target_id).await;

    for host in ["198.51.100.7", "198.51.100.8", "198.51.100.9"] {
        queue
            .enqueue(EnqueueRequest::new(
                target_id,
                scan_payload(run_id, host),
                PRIORITY_PIPELINE,
            ))
            .await
            .expect("enqueue");
    }
    let lease = queue
        .dequeue(DequeueRequest {
            worker_id: "w1".to_string(),
        })
        .await
        .expect("dequeue")
        .expect("job");

    let touched = queue.cancel_for_run(run_id, "discarded").await.expect("cascade");
    assert_eq!(touched, 3);

    let cancelled: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM jobs WHERE run_id = $1 AND status = 'cancelled'",
    )
    .bind(run_id.0)
    .fetch_one(&pool)
    .await
    .expect("count");
    assert_eq!(cancelled, 2, "queued children cancel immediately");
    assert!(
        queue.cancel_requested(lease.job.id).await.expect("flag"),
        "running child gets the cooperative flag"
    );
}

#[sqlx::test]
async fn renew_extends_only_the_holders_lease(pool: PgPool) {
    let queue = queue_with_caps(&pool, 5, 5);
    let target_id = seed_target(&pool).await;
    let run_id = seed_run(&pool, target_id).await;
    queue
        .enqueue(EnqueueRequest::new(
            target_id,
            scan_payload(run_id, "198.51.100.7"),
            PRIORITY_PIPELINE,
        ))
        .await
        .expect("enqueue");
    let lease = queue
        .dequeue(DequeueRequest {
            worker_id: "w1".to_string(),
        })
        .await
        .expect("dequeue")
        .expect("job");

    let extended = queue.renew(lease.job.id, "w1", 600).await.expect("renew");
    assert!(extended > lease.expires_at);

    let err = queue.renew(lease.job.id, "intruder", 600).await;
    assert!(err.is_err(), "only the lease owner may renew");
}
