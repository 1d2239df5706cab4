use serde_json::Value;
use sqlx::PgPool;

use crate::error::Result;
use crate::types::{RunId, ScanId, TargetId};

/// Scan rows are the durable record of one scanner execution. They become
/// immutable once finished; retention later nulls out old raw output.
#[derive(Clone, Debug)]
pub struct ScanRepo {
    pool: PgPool,
}

impl ScanRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert_started(
        &self,
        target_id: TargetId,
        run_id: Option<RunId>,
        scanner: &str,
        target: &str,
        config: Option<Value>,
    ) -> Result<ScanId> {
        let id = ScanId::new();
        sqlx::query(
            r#"
            INSERT INTO scans (id, target_id, run_id, scanner, target, status, config)
            VALUES ($1, $2, $3, $4, $5, 'running', $6)
            "#,
        )
        .bind(id.0)
        .bind(target_id.0)
        .bind(run_id.map(|r| r.0))
        .bind(scanner)
        .bind(target)
        .bind(config)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn finish(&self, id: ScanId, status: &str, raw_output: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scans
            SET status = $2, raw_output = $3, completed_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id.0)
        .bind(status)
        .bind(raw_output)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Retire leftovers of a crashed earlier attempt at the same scan. Jobs
    /// run at-least-once; dropping the orphaned scan's findings keeps the
    /// rerun's findings from appearing twice.
    pub async fn supersede_incomplete(
        &self,
        target_id: TargetId,
        run_id: RunId,
        scanner: &str,
        target: &str,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let orphans: Vec<uuid::Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM scans
            WHERE target_id = $1 AND run_id = $2 AND scanner = $3 AND target = $4
              AND status = 'running'
            "#,
        )
        .bind(target_id.0)
        .bind(run_id.0)
        .bind(scanner)
        .bind(target)
        .fetch_all(&mut *tx)
        .await?;

        if orphans.is_empty() {
            tx.rollback().await?;
            return Ok(0);
        }

        sqlx::query("DELETE FROM findings WHERE scan_id = ANY($1)")
            .bind(&orphans)
            .execute(&mut *tx)
            .await?;
        let updated = sqlx::query(
            "UPDATE scans SET status = 'superseded', completed_at = NOW() WHERE id = ANY($1)",
        )
        .bind(&orphans)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(updated.rows_affected())
    }
}
