//! Periodic scheduler: every tick, due schedules become queued runs.
//!
//! Each claim is one atomic transaction: the due schedule row is taken with
//! `FOR UPDATE SKIP LOCKED` (several scheduler replicas can coexist), a
//! queued run and its pipeline job are inserted, and `next_run_at` advances
//! with forward drift correction, so missed ticks never stack.

use std::time::Duration;

use serde_json::json;
use sqlx::{PgPool, Row};
use tokio_util::sync::CancellationToken;

use crate::audit;
use crate::changes::effective_config;
use crate::error::Result;
use crate::model::PipelineConfig;
use crate::orchestration::job::{JobPayload, PipelineJob, PRIORITY_PIPELINE};
use crate::pipeline::PipelineStage;
use crate::scope::ScopePolicy;
use crate::types::{JobId, RunId, ScheduleId, TargetId};

pub struct Scheduler {
    pool: PgPool,
    tick: Duration,
    default_max_attempts: i32,
    shutdown: CancellationToken,
}

#[derive(Clone, Debug)]
pub struct ScheduledRun {
    pub schedule_id: ScheduleId,
    pub target_id: TargetId,
    pub run_id: RunId,
    pub job_id: JobId,
}

impl Scheduler {
    pub fn new(
        pool: PgPool,
        tick_secs: u64,
        default_max_attempts: i32,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            pool,
            tick: Duration::from_secs(tick_secs.max(1)),
            default_max_attempts,
            shutdown,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        tracing::info!("scheduler shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(self.tick) => {
                        // Drain everything due this tick, one schedule per
                        // transaction.
                        loop {
                            match self.tick_once().await {
                                Ok(Some(run)) => {
                                    tracing::info!(
                                        schedule = %run.schedule_id,
                                        target_id = %run.target_id,
                                        run = %run.run_id,
                                        "scheduled pipeline run"
                                    );
                                }
                                Ok(None) => break,
                                Err(err) => {
                                    tracing::warn!(error = %err, "scheduler tick failed");
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        })
    }

    /// Claim one due schedule and enqueue its run. Returns `None` when
    /// nothing is due or every due target already has an active pipeline.
    pub async fn tick_once(&self) -> Result<Option<ScheduledRun>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT s.id, s.target_id, s.interval_seconds, s.pipeline_config,
                   t.root_domain, t.scope
            FROM schedules s
            JOIN targets t ON t.id = s.target_id
            WHERE s.enabled
              AND (s.next_run_at IS NULL OR s.next_run_at <= NOW())
              AND NOT EXISTS (
                  SELECT 1 FROM runs r
                  WHERE r.target_id = s.target_id
                    AND r.status IN ('queued', 'running')
                    AND r.trigger IN ('manual', 'scheduled')
              )
            ORDER BY s.next_run_at NULLS FIRST, s.created_at
            FOR UPDATE OF s SKIP LOCKED
            LIMIT 1
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        let schedule_id = ScheduleId(row.try_get("id")?);
        let target_id = TargetId(row.try_get("target_id")?);
        let interval: i64 = row.try_get("interval_seconds")?;
        let root_domain: String = row.try_get("root_domain")?;
        let scope_json: serde_json::Value = row.try_get("scope")?;
        let scope = ScopePolicy::from_json(&scope_json, &root_domain);
        let requested: PipelineConfig =
            serde_json::from_value(row.try_get::<serde_json::Value, _>("pipeline_config")?)
                .unwrap_or_default();
        let config = effective_config(requested, scope.max_hosts, scope.max_http_targets);

        let run_id = RunId::new();
        sqlx::query(
            r#"
            INSERT INTO runs (id, target_id, trigger, status, config)
            VALUES ($1, $2, 'scheduled', 'queued', $3)
            "#,
        )
        .bind(run_id.0)
        .bind(target_id.0)
        .bind(serde_json::to_value(config)?)
        .execute(&mut *tx)
        .await?;

        let payload = JobPayload::Pipeline(PipelineJob {
            run_id,
            stage: PipelineStage::FIRST,
            config,
        });
        let job_id = JobId::new();
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, kind, status, target_id, run_id, payload, priority,
                attempts, max_attempts, available_at, dedupe_key
            )
            VALUES ($1, 'pipeline', 'queued', $2, $3, $4, $5, 0, $6, NOW(), $7)
            "#,
        )
        .bind(job_id.0)
        .bind(target_id.0)
        .bind(run_id.0)
        .bind(serde_json::to_value(&payload)?)
        .bind(PRIORITY_PIPELINE)
        .bind(self.default_max_attempts)
        .bind(payload.dedupe_key())
        .execute(&mut *tx)
        .await?;

        // Drift corrects forward: a scheduler that was down for three
        // intervals fires once, not three times.
        sqlx::query(
            r#"
            UPDATE schedules
            SET last_run_at = NOW(),
                next_run_at = GREATEST(
                    COALESCE(next_run_at, NOW()) + ($2::bigint) * INTERVAL '1 second',
                    NOW() + ($2::bigint) * INTERVAL '1 second'
                ),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(schedule_id.0)
        .bind(interval)
        .execute(&mut *tx)
        .await?;

        audit::log_event(
            &mut *tx,
            target_id,
            Some(run_id),
            "run_scheduled",
            json!({ "schedule_id": schedule_id, "job_id": job_id }),
            "scheduler",
        )
        .await?;

        tx.commit().await?;
        Ok(Some(ScheduledRun {
            schedule_id,
            target_id,
            run_id,
            job_id,
        }))
    }
}
