//! Append-only audit trail persisted to the `run_events` table.

use serde_json::Value;
use sqlx::{PgExecutor, PgPool};

use crate::error::Result;
use crate::types::{RunEventId, RunId, TargetId};

#[derive(Clone, Debug)]
pub struct AuditLog {
    pool: PgPool,
}

impl AuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn log(
        &self,
        target_id: TargetId,
        run_id: Option<RunId>,
        kind: &str,
        payload: Value,
        actor: &str,
    ) -> Result<RunEventId> {
        log_event(&self.pool, target_id, run_id, kind, payload, actor).await
    }
}

/// Write one audit row with any executor, so callers inside a transaction can
/// make the event part of the same commit.
pub async fn log_event<'e, E>(
    executor: E,
    target_id: TargetId,
    run_id: Option<RunId>,
    kind: &str,
    payload: Value,
    actor: &str,
) -> Result<RunEventId>
where
    E: PgExecutor<'e>,
{
    let id = RunEventId::new();
    sqlx::query(
        r#"
        INSERT INTO run_events (id, target_id, run_id, kind, payload, actor)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(id.0)
    .bind(target_id.0)
    .bind(run_id.map(|r| r.0))
    .bind(kind)
    .bind(payload)
    .bind(actor)
    .execute(executor)
    .await?;
    Ok(id)
}
