//! Post-run change detection: `new` and `candidate-stale` diffs.
//!
//! Both diffs and the verification enqueue happen in one transaction, so a
//! crash never leaves an artifact marked stale without its re-probe job.
//! Revival of previously-stale artifacts that were observed again is handled
//! at ingestion time by the upserts.

use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};

use crate::error::Result;
use crate::model::{AssetKind, PipelineConfig};
use crate::orchestration::job::{
    JobPayload, VerifyAssetJob, VerifyServiceJob, PRIORITY_VERIFY,
};
use crate::pipeline::PipelineStage;
use crate::types::{AssetId, JobId, RunId, ServiceId, TargetId};

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub new_assets: u64,
    pub new_services: u64,
    pub new_edges: u64,
    pub stale_assets: u64,
    pub stale_services: u64,
}

#[derive(Clone, Debug)]
pub struct ChangeDetector {
    pool: PgPool,
}

impl ChangeDetector {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Compute the run diff, transition candidates to `stale`, and enqueue
    /// their verification jobs. `executed_stages` limits which artifact kinds
    /// may go stale: a run that never executed nmap says nothing about
    /// services.
    pub async fn detect(
        &self,
        target_id: TargetId,
        run_id: RunId,
        executed_stages: &[PipelineStage],
        max_attempts: i32,
    ) -> Result<ChangeSummary> {
        let mut summary = ChangeSummary::default();
        let reason = format!("not_seen_in_run:{run_id}");

        let mut stale_asset_kinds: Vec<&str> = Vec::new();
        if executed_stages.contains(&PipelineStage::Subfinder)
            && executed_stages.contains(&PipelineStage::DnsResolve)
        {
            stale_asset_kinds.push(AssetKind::Subdomain.as_str());
        }
        if executed_stages.contains(&PipelineStage::Httpx) {
            stale_asset_kinds.push(AssetKind::Url.as_str());
        }
        let stale_services = executed_stages.contains(&PipelineStage::Nmap);

        let mut tx = self.pool.begin().await?;

        let new_counts = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM assets
                  WHERE target_id = $1 AND first_seen_run_id = $2) AS new_assets,
                (SELECT COUNT(*) FROM services
                  WHERE target_id = $1 AND first_seen_run_id = $2) AS new_services,
                (SELECT COUNT(*) FROM edges
                  WHERE target_id = $1 AND first_seen_run_id = $2) AS new_edges
            "#,
        )
        .bind(target_id.0)
        .bind(run_id.0)
        .fetch_one(&mut *tx)
        .await?;
        summary.new_assets = new_counts.try_get::<i64, _>("new_assets")?.max(0) as u64;
        summary.new_services = new_counts.try_get::<i64, _>("new_services")?.max(0) as u64;
        summary.new_edges = new_counts.try_get::<i64, _>("new_edges")?.max(0) as u64;

        if !stale_asset_kinds.is_empty() {
            let rows = sqlx::query(
                r#"
                UPDATE assets
                SET status = 'stale', status_reason = $3
                WHERE target_id = $1
                  AND status = 'active'
                  AND last_seen_run_id IS NOT NULL
                  AND last_seen_run_id <> $2
                  AND kind = ANY($4)
                RETURNING id
                "#,
            )
            .bind(target_id.0)
            .bind(run_id.0)
            .bind(&reason)
            .bind(&stale_asset_kinds)
            .fetch_all(&mut *tx)
            .await?;

            summary.stale_assets = rows.len() as u64;
            for row in rows {
                let asset_id = AssetId(row.try_get("id")?);
                enqueue_in_tx(
                    &mut tx,
                    target_id,
                    JobPayload::VerifyAsset(VerifyAssetJob { asset_id, run_id }),
                    max_attempts,
                )
                .await?;
            }
        }

        if stale_services {
            let rows = sqlx::query(
                r#"
                UPDATE services
                SET status = 'stale', status_reason = $3
                WHERE target_id = $1
                  AND status = 'active'
                  AND last_seen_run_id IS NOT NULL
                  AND last_seen_run_id <> $2
                RETURNING id
                "#,
            )
            .bind(target_id.0)
            .bind(run_id.0)
            .bind(&reason)
            .fetch_all(&mut *tx)
            .await?;

            summary.stale_services = rows.len() as u64;
            for row in rows {
                let service_id = ServiceId(row.try_get("id")?);
                enqueue_in_tx(
                    &mut tx,
                    target_id,
                    JobPayload::VerifyService(VerifyServiceJob { service_id, run_id }),
                    max_attempts,
                )
                .await?;
            }
        }

        tx.commit().await?;
        Ok(summary)
    }
}

/// Insert a verification job inside the caller's transaction, merging with
/// any active job for the same artifact.
async fn enqueue_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    target_id: TargetId,
    payload: JobPayload,
    max_attempts: i32,
) -> Result<Option<JobId>> {
    let dedupe_key = payload.dedupe_key();
    let existing: Option<uuid::Uuid> = sqlx::query_scalar(
        r#"
        SELECT id FROM jobs
        WHERE dedupe_key = $1 AND status IN ('queued', 'running')
        LIMIT 1
        "#,
    )
    .bind(&dedupe_key)
    .fetch_optional(&mut **tx)
    .await?;
    if existing.is_some() {
        return Ok(None);
    }

    let job_id = JobId::new();
    sqlx::query(
        r#"
        INSERT INTO jobs (
            id, kind, status, target_id, run_id, payload, priority,
            attempts, max_attempts, available_at, dedupe_key
        )
        VALUES ($1, $2, 'queued', $3, $4, $5, $6, 0, $7, NOW(), $8)
        "#,
    )
    .bind(job_id.0)
    .bind(payload.kind().as_string())
    .bind(target_id.0)
    .bind(payload.run_id().map(|r| r.0))
    .bind(serde_json::to_value(&payload)?)
    .bind(PRIORITY_VERIFY)
    .bind(max_attempts)
    .bind(&dedupe_key)
    .execute(&mut **tx)
    .await?;
    Ok(Some(job_id))
}

/// Stages considered executed for a run: the stage jobs that completed, read
/// back from the queue so the diff survives worker restarts.
pub async fn executed_stages(pool: &PgPool, run_id: RunId) -> Result<Vec<PipelineStage>> {
    let rows: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT payload -> 'payload' ->> 'stage'
        FROM jobs
        WHERE run_id = $1 AND kind = 'pipeline' AND status = 'completed'
        "#,
    )
    .bind(run_id.0)
    .fetch_all(pool)
    .await?;

    let mut stages = Vec::new();
    for raw in rows {
        if let Ok(stage) = PipelineStage::parse(&raw) {
            if !stages.contains(&stage) {
                stages.push(stage);
            }
        }
    }
    Ok(stages)
}

/// Default pipeline run config merged with the target scope's limits.
pub fn effective_config(config: PipelineConfig, max_hosts: usize, max_http: usize) -> PipelineConfig {
    PipelineConfig {
        max_hosts: config.max_hosts.min(max_hosts.max(1)),
        max_http_targets: config.max_http_targets.min(max_http.max(1)),
    }
}
