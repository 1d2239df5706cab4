use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::error::Result;
use crate::model::{PipelineConfig, ScheduleRecord};
use crate::types::{ScheduleId, TargetId};

#[derive(Clone, Debug)]
pub struct ScheduleRepo {
    pool: PgPool,
}

impl ScheduleRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn upsert(
        &self,
        target_id: TargetId,
        interval_seconds: i64,
        enabled: bool,
        pipeline_config: PipelineConfig,
        start_immediately: bool,
    ) -> Result<ScheduleRecord> {
        let id = ScheduleId::new();
        let row = sqlx::query(
            r#"
            INSERT INTO schedules (id, target_id, enabled, interval_seconds, pipeline_config, next_run_at)
            VALUES (
                $1, $2, $3, $4, $5,
                CASE WHEN $6 THEN NOW() ELSE NOW() + ($4::bigint) * INTERVAL '1 second' END
            )
            RETURNING id, target_id, enabled, interval_seconds, pipeline_config,
                      next_run_at, last_run_at
            "#,
        )
        .bind(id.0)
        .bind(target_id.0)
        .bind(enabled)
        .bind(interval_seconds)
        .bind(serde_json::to_value(pipeline_config)?)
        .bind(start_immediately)
        .fetch_one(&self.pool)
        .await?;
        schedule_from_row(&row)
    }

    pub async fn set_enabled(&self, id: ScheduleId, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE schedules SET enabled = $2, updated_at = NOW() WHERE id = $1")
            .bind(id.0)
            .bind(enabled)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

pub fn schedule_from_row(row: &PgRow) -> Result<ScheduleRecord> {
    let config: serde_json::Value = row.try_get("pipeline_config")?;
    Ok(ScheduleRecord {
        id: ScheduleId(row.try_get("id")?),
        target_id: TargetId(row.try_get("target_id")?),
        enabled: row.try_get("enabled")?,
        interval_seconds: row.try_get("interval_seconds")?,
        pipeline_config: serde_json::from_value::<PipelineConfig>(config).unwrap_or_default(),
        next_run_at: row.try_get("next_run_at")?,
        last_run_at: row.try_get("last_run_at")?,
    })
}
