use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::error::{EngineError, Result};
use crate::model::{PipelineConfig, RunRecord, RunStatus, RunTrigger};
use crate::types::{RunId, TargetId};

#[derive(Clone, Debug)]
pub struct RunRepo {
    pool: PgPool,
}

impl RunRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        target_id: TargetId,
        trigger: RunTrigger,
        config: PipelineConfig,
    ) -> Result<RunRecord> {
        let id = RunId::new();
        let row = sqlx::query(
            r#"
            INSERT INTO runs (id, target_id, trigger, status, config)
            VALUES ($1, $2, $3, 'queued', $4)
            RETURNING id, target_id, trigger, status, config, failure_summary,
                      started_at, completed_at, created_at
            "#,
        )
        .bind(id.0)
        .bind(target_id.0)
        .bind(trigger.as_str())
        .bind(serde_json::to_value(config)?)
        .fetch_one(&self.pool)
        .await?;
        run_from_row(&row)
    }

    pub async fn get(&self, id: RunId) -> Result<RunRecord> {
        let row = sqlx::query(
            r#"
            SELECT id, target_id, trigger, status, config, failure_summary,
                   started_at, completed_at, created_at
            FROM runs WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("run {id}")))?;
        run_from_row(&row)
    }

    /// Transition queued -> running, stamping started_at once.
    pub async fn mark_running(&self, id: RunId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE runs
            SET status = 'running', started_at = COALESCE(started_at, NOW())
            WHERE id = $1 AND status IN ('queued', 'running')
            "#,
        )
        .bind(id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Terminal transition; never overwrites an earlier terminal status
    /// (a discarded run stays discarded even if a worker finishes late).
    pub async fn mark_terminal(
        &self,
        id: RunId,
        status: RunStatus,
        failure_summary: Option<&str>,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE runs
            SET status = $2, failure_summary = $3, completed_at = NOW()
            WHERE id = $1 AND status IN ('queued', 'running')
            "#,
        )
        .bind(id.0)
        .bind(status.as_str())
        .bind(failure_summary)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Stamp completed_at on a run that was discarded/cancelled externally.
    pub async fn stamp_completed_at(&self, id: RunId) -> Result<()> {
        sqlx::query("UPDATE runs SET completed_at = COALESCE(completed_at, NOW()) WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// At most one non-terminal pipeline run may exist per target.
    pub async fn active_pipeline_exists(&self, target_id: TargetId) -> Result<bool> {
        let row: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT 1 FROM runs
            WHERE target_id = $1
              AND status IN ('queued', 'running')
              AND trigger IN ('manual', 'scheduled')
            LIMIT 1
            "#,
        )
        .bind(target_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn started_at(&self, id: RunId) -> Result<Option<DateTime<Utc>>> {
        let started: Option<Option<DateTime<Utc>>> =
            sqlx::query_scalar("SELECT started_at FROM runs WHERE id = $1")
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(started.flatten())
    }
}

pub fn run_from_row(row: &PgRow) -> Result<RunRecord> {
    let status: String = row.try_get("status")?;
    let trigger: String = row.try_get("trigger")?;
    let config: serde_json::Value = row.try_get("config")?;
    Ok(RunRecord {
        id: RunId(row.try_get("id")?),
        target_id: TargetId(row.try_get("target_id")?),
        trigger: RunTrigger::parse(&trigger)?,
        status: RunStatus::parse(&status)?,
        config: serde_json::from_value(config).unwrap_or_default(),
        failure_summary: row.try_get("failure_summary")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        created_at: row.try_get("created_at")?,
    })
}
