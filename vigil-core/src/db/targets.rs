use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::error::{EngineError, Result};
use crate::model::TargetRecord;
use crate::scope::ScopePolicy;
use crate::types::TargetId;

#[derive(Clone, Debug)]
pub struct TargetRepo {
    pool: PgPool,
}

impl TargetRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        name: &str,
        root_domain: &str,
        scope: &ScopePolicy,
    ) -> Result<TargetRecord> {
        let id = TargetId::new();
        let scope_json = serde_json::to_value(scope)?;
        let row = sqlx::query(
            r#"
            INSERT INTO targets (id, name, root_domain, scope)
            VALUES ($1, $2, $3, $4)
            RETURNING id, name, root_domain, scope, created_at, updated_at
            "#,
        )
        .bind(id.0)
        .bind(name)
        .bind(root_domain)
        .bind(scope_json)
        .fetch_one(&self.pool)
        .await?;
        target_from_row(&row)
    }

    pub async fn get(&self, id: TargetId) -> Result<TargetRecord> {
        let row = sqlx::query(
            "SELECT id, name, root_domain, scope, created_at, updated_at FROM targets WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("target {id}")))?;
        target_from_row(&row)
    }

    pub async fn get_by_root(&self, root_domain: &str) -> Result<Option<TargetRecord>> {
        let row = sqlx::query(
            "SELECT id, name, root_domain, scope, created_at, updated_at FROM targets WHERE root_domain = $1",
        )
        .bind(root_domain)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(target_from_row).transpose()
    }
}

pub fn target_from_row(row: &PgRow) -> Result<TargetRecord> {
    let root_domain: String = row.try_get("root_domain")?;
    let scope_json: serde_json::Value = row.try_get("scope")?;
    Ok(TargetRecord {
        id: TargetId(row.try_get("id")?),
        name: row.try_get("name")?,
        scope: ScopePolicy::from_json(&scope_json, &root_domain),
        root_domain,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
