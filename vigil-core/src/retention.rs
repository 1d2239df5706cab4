//! Retention sweeper: ages out raw scan output and completed runs.
//! Inventory and findings are append-evolving and never purged here.

use std::time::Duration;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::config::RetentionConfig;
use crate::error::Result;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PurgeSummary {
    pub raw_output_cleared: u64,
    pub scans_deleted: u64,
    pub jobs_deleted: u64,
    pub runs_deleted: u64,
}

pub struct RetentionSweeper {
    pool: PgPool,
    config: RetentionConfig,
    shutdown: CancellationToken,
}

impl RetentionSweeper {
    pub fn new(pool: PgPool, config: RetentionConfig, shutdown: CancellationToken) -> Self {
        Self {
            pool,
            config,
            shutdown,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_secs(self.config.sweep_interval_secs.max(60));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        tracing::info!("retention sweeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        match purge_old_data(&self.pool, &self.config).await {
                            Ok(summary) if summary != PurgeSummary::default() => {
                                tracing::info!(
                                    raw_cleared = summary.raw_output_cleared,
                                    scans = summary.scans_deleted,
                                    jobs = summary.jobs_deleted,
                                    runs = summary.runs_deleted,
                                    "retention purge completed"
                                );
                            }
                            Ok(_) => {}
                            Err(err) => {
                                tracing::warn!(error = %err, "retention purge failed");
                            }
                        }
                    }
                }
            }
        })
    }
}

pub async fn purge_old_data(pool: &PgPool, config: &RetentionConfig) -> Result<PurgeSummary> {
    let mut summary = PurgeSummary::default();

    // Raw output ages out first, long before the scan rows themselves go.
    let cleared = sqlx::query(
        r#"
        UPDATE scans
        SET raw_output = NULL
        WHERE completed_at IS NOT NULL
          AND completed_at < NOW() - ($1::bigint) * INTERVAL '1 day'
          AND raw_output IS NOT NULL
        "#,
    )
    .bind(config.raw_output_days)
    .execute(pool)
    .await?;
    summary.raw_output_cleared = cleared.rows_affected();

    // Terminal runs past the horizon go away with their scans and jobs;
    // assets, services, edges and findings stay.
    let old_runs: Vec<uuid::Uuid> = sqlx::query_scalar(
        r#"
        SELECT id FROM runs
        WHERE status IN ('completed', 'failed', 'cancelled', 'discarded')
          AND completed_at IS NOT NULL
          AND completed_at < NOW() - ($1::bigint) * INTERVAL '1 day'
        "#,
    )
    .bind(config.completed_runs_days)
    .fetch_all(pool)
    .await?;

    if old_runs.is_empty() {
        return Ok(summary);
    }

    let mut tx = pool.begin().await?;

    // Findings and inventory provenance columns reference runs with
    // ON DELETE SET NULL, so deleting the run detaches rather than destroys.
    let scans = sqlx::query("DELETE FROM scans WHERE run_id = ANY($1)")
        .bind(&old_runs)
        .execute(&mut *tx)
        .await?;
    summary.scans_deleted = scans.rows_affected();

    let jobs = sqlx::query("DELETE FROM jobs WHERE run_id = ANY($1)")
        .bind(&old_runs)
        .execute(&mut *tx)
        .await?;
    summary.jobs_deleted = jobs.rows_affected();

    let runs = sqlx::query("DELETE FROM runs WHERE id = ANY($1)")
        .bind(&old_runs)
        .execute(&mut *tx)
        .await?;
    summary.runs_deleted = runs.rows_affected();

    tx.commit().await?;
    Ok(summary)
}
