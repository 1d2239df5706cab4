//! The inventory store: assets, services and edges with first/last-seen
//! provenance. All upserts are idempotent under replay: re-ingesting the
//! same run's output leaves row state unchanged.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};

use crate::error::{EngineError, Result};
use crate::model::{
    ArtifactStatus, AssetKind, AssetRecord, Proto, RelType, ScanOutput, ServiceRecord,
};
use crate::types::{AssetId, EdgeId, RunId, ServiceId, TargetId};

#[derive(Clone, Debug)]
pub struct InventoryRepo {
    pool: PgPool,
}

#[derive(Clone, Copy, Debug)]
pub struct UpsertOutcome<Id> {
    pub id: Id,
    pub created: bool,
}

/// Raw material for httpx target construction: one row per service observed
/// in the run, with the best name pointing at its host.
#[derive(Clone, Debug)]
pub struct WebCandidate {
    pub host: String,
    pub via_name: Option<String>,
    pub port: u16,
    pub service_name: Option<String>,
}

impl InventoryRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn upsert_asset_seen(
        &self,
        target_id: TargetId,
        run_id: RunId,
        kind: AssetKind,
        value: &str,
        normalized: &str,
    ) -> Result<UpsertOutcome<AssetId>> {
        let mut conn = self.pool.acquire().await?;
        upsert_asset_seen(&mut *conn, target_id, run_id, kind, value, normalized).await
    }

    pub async fn upsert_service_seen(
        &self,
        target_id: TargetId,
        run_id: RunId,
        asset_id: AssetId,
        port: u16,
        proto: Proto,
        name: Option<&str>,
        product: Option<&str>,
        version: Option<&str>,
    ) -> Result<UpsertOutcome<ServiceId>> {
        let mut conn = self.pool.acquire().await?;
        upsert_service_seen(
            &mut *conn, target_id, run_id, asset_id, port, proto, name, product, version,
        )
        .await
    }

    pub async fn upsert_edge_seen(
        &self,
        target_id: TargetId,
        run_id: RunId,
        from: AssetId,
        to: AssetId,
        rel_type: RelType,
    ) -> Result<UpsertOutcome<EdgeId>> {
        let mut conn = self.pool.acquire().await?;
        upsert_edge_seen(&mut *conn, target_id, run_id, from, to, rel_type).await
    }

    /// Ingest one scan's artifacts transactionally. A serialization conflict
    /// (concurrent upserts racing on the same unique key) is retried once;
    /// a second failure aborts the batch.
    pub async fn ingest_batch(
        &self,
        target_id: TargetId,
        run_id: RunId,
        output: &ScanOutput,
    ) -> Result<()> {
        match self.try_ingest_batch(target_id, run_id, output).await {
            Err(EngineError::Database(err)) if is_serialization_conflict(&err) => {
                tracing::debug!(target_id = %target_id, run = %run_id, "ingest batch retrying after serialization conflict");
                self.try_ingest_batch(target_id, run_id, output).await
            }
            other => other,
        }
    }

    async fn try_ingest_batch(
        &self,
        target_id: TargetId,
        run_id: RunId,
        output: &ScanOutput,
    ) -> Result<()> {
        use std::collections::{HashMap, HashSet};

        let mut tx = self.pool.begin().await?;
        let mut asset_ids: HashMap<(AssetKind, String), AssetId> = HashMap::new();

        let mut seen_assets: HashSet<(AssetKind, String)> = HashSet::new();
        for artifact in &output.assets {
            let key = (artifact.kind, artifact.normalized.clone());
            if !seen_assets.insert(key.clone()) {
                continue;
            }
            let outcome = upsert_asset_seen(
                &mut *tx,
                target_id,
                run_id,
                artifact.kind,
                &artifact.value,
                &artifact.normalized,
            )
            .await?;
            asset_ids.insert(key, outcome.id);
        }

        let mut seen_services: HashSet<(AssetKind, String, u16, Proto)> = HashSet::new();
        for service in &output.services {
            let skey = (
                service.host.kind,
                service.host.normalized.clone(),
                service.port,
                service.proto,
            );
            if !seen_services.insert(skey) {
                continue;
            }
            let host_key = (service.host.kind, service.host.normalized.clone());
            let host_id = match asset_ids.get(&host_key) {
                Some(id) => *id,
                None => {
                    let outcome = upsert_asset_seen(
                        &mut *tx,
                        target_id,
                        run_id,
                        service.host.kind,
                        &service.host.value,
                        &service.host.normalized,
                    )
                    .await?;
                    asset_ids.insert(host_key, outcome.id);
                    outcome.id
                }
            };
            upsert_service_seen(
                &mut *tx,
                target_id,
                run_id,
                host_id,
                service.port,
                service.proto,
                service.name.as_deref(),
                service.product.as_deref(),
                service.version.as_deref(),
            )
            .await?;
        }

        let mut seen_edges: HashSet<(AssetKind, String, AssetKind, String, RelType)> =
            HashSet::new();
        for edge in &output.edges {
            let ekey = (
                edge.from.kind,
                edge.from.normalized.clone(),
                edge.to.kind,
                edge.to.normalized.clone(),
                edge.rel_type,
            );
            if !seen_edges.insert(ekey) {
                continue;
            }
            let from_key = (edge.from.kind, edge.from.normalized.clone());
            let from_id = match asset_ids.get(&from_key) {
                Some(id) => *id,
                None => {
                    let outcome = upsert_asset_seen(
                        &mut *tx,
                        target_id,
                        run_id,
                        edge.from.kind,
                        &edge.from.value,
                        &edge.from.normalized,
                    )
                    .await?;
                    asset_ids.insert(from_key, outcome.id);
                    outcome.id
                }
            };
            let to_key = (edge.to.kind, edge.to.normalized.clone());
            let to_id = match asset_ids.get(&to_key) {
                Some(id) => *id,
                None => {
                    let outcome = upsert_asset_seen(
                        &mut *tx,
                        target_id,
                        run_id,
                        edge.to.kind,
                        &edge.to.value,
                        &edge.to.normalized,
                    )
                    .await?;
                    asset_ids.insert(to_key, outcome.id);
                    outcome.id
                }
            };
            upsert_edge_seen(&mut *tx, target_id, run_id, from_id, to_id, edge.rel_type).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_asset(&self, id: AssetId) -> Result<Option<AssetRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, target_id, kind, value, normalized, status, status_reason,
                   first_seen_run_id, last_seen_run_id, first_seen_at, last_seen_at, verified_at
            FROM assets WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(asset_from_row).transpose()
    }

    pub async fn get_service(&self, id: ServiceId) -> Result<Option<ServiceRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, target_id, asset_id, port, proto, name, product, version,
                   status, status_reason, first_seen_run_id, last_seen_run_id,
                   first_seen_at, last_seen_at, verified_at
            FROM services WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(service_from_row).transpose()
    }

    pub async fn asset_id_by_key(
        &self,
        target_id: TargetId,
        kind: AssetKind,
        normalized: &str,
    ) -> Result<Option<AssetId>> {
        let id: Option<uuid::Uuid> = sqlx::query_scalar(
            "SELECT id FROM assets WHERE target_id = $1 AND kind = $2 AND normalized = $3",
        )
        .bind(target_id.0)
        .bind(kind.as_str())
        .bind(normalized)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id.map(AssetId))
    }

    pub async fn set_asset_status(
        &self,
        id: AssetId,
        status: ArtifactStatus,
        reason: Option<&str>,
        verified_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE assets
            SET status = $2, status_reason = $3, verified_at = COALESCE($4, verified_at)
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(status.as_str())
        .bind(reason)
        .bind(verified_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_service_status(
        &self,
        id: ServiceId,
        status: ArtifactStatus,
        reason: Option<&str>,
        verified_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE services
            SET status = $2, status_reason = $3, verified_at = COALESCE($4, verified_at)
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(status.as_str())
        .bind(reason)
        .bind(verified_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Subdomain assets observed in this run, for the dns_resolve stage.
    pub async fn subdomains_seen_in_run(
        &self,
        target_id: TargetId,
        run_id: RunId,
    ) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT normalized FROM assets
            WHERE target_id = $1 AND kind = 'subdomain' AND last_seen_run_id = $2
            ORDER BY normalized
            "#,
        )
        .bind(target_id.0)
        .bind(run_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    /// IP assets resolved in this run, previously-unscanned first (first seen
    /// this run), then by recency.
    pub async fn nmap_candidates(
        &self,
        target_id: TargetId,
        run_id: RunId,
        max_hosts: usize,
    ) -> Result<Vec<String>> {
        let ips: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT normalized FROM assets
            WHERE target_id = $1 AND kind = 'ip' AND last_seen_run_id = $2
            ORDER BY (first_seen_run_id = $2) DESC, last_seen_at DESC, normalized
            LIMIT $3
            "#,
        )
        .bind(target_id.0)
        .bind(run_id.0)
        .bind(max_hosts as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(ips)
    }

    /// TCP services observed in this run joined with a name that resolves to
    /// the owning host (when one was seen this run).
    pub async fn web_candidates(
        &self,
        target_id: TargetId,
        run_id: RunId,
    ) -> Result<Vec<WebCandidate>> {
        let rows = sqlx::query(
            r#"
            SELECT host.normalized AS host, src.normalized AS via_name, s.port, s.name
            FROM services s
            JOIN assets host ON host.id = s.asset_id
            LEFT JOIN edges e
                ON e.to_asset_id = s.asset_id
               AND e.rel_type = 'resolves_to'
               AND e.last_seen_run_id = $2
            LEFT JOIN assets src
                ON src.id = e.from_asset_id AND src.kind IN ('subdomain', 'host')
            WHERE s.target_id = $1
              AND s.last_seen_run_id = $2
              AND s.proto = 'tcp'
            ORDER BY host.normalized, s.port
            "#,
        )
        .bind(target_id.0)
        .bind(run_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let port: i32 = row.try_get("port")?;
                Ok(WebCandidate {
                    host: row.try_get("host")?,
                    via_name: row.try_get("via_name")?,
                    port: port as u16,
                    service_name: row.try_get("name")?,
                })
            })
            .collect()
    }

    pub async fn urls_seen_in_run(
        &self,
        target_id: TargetId,
        run_id: RunId,
    ) -> Result<Vec<String>> {
        let urls: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT normalized FROM assets
            WHERE target_id = $1 AND kind = 'url' AND last_seen_run_id = $2
            ORDER BY normalized
            "#,
        )
        .bind(target_id.0)
        .bind(run_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(urls)
    }
}

pub async fn upsert_asset_seen(
    conn: &mut PgConnection,
    target_id: TargetId,
    run_id: RunId,
    kind: AssetKind,
    value: &str,
    normalized: &str,
) -> Result<UpsertOutcome<AssetId>> {
    let id = AssetId::new();
    let row = sqlx::query(
        r#"
        INSERT INTO assets (
            id, target_id, kind, value, normalized, status,
            first_seen_run_id, last_seen_run_id, first_seen_at, last_seen_at
        )
        VALUES ($1, $2, $3, $4, $5, 'active', $6, $6, NOW(), NOW())
        ON CONFLICT (target_id, kind, normalized) DO UPDATE SET
            value = EXCLUDED.value,
            last_seen_run_id = EXCLUDED.last_seen_run_id,
            last_seen_at = NOW(),
            status_reason = NULL,
            verified_at = CASE
                WHEN assets.status <> 'active' THEN NOW()
                ELSE assets.verified_at
            END,
            status = 'active'
        RETURNING id, (xmax = 0) AS created
        "#,
    )
    .bind(id.0)
    .bind(target_id.0)
    .bind(kind.as_str())
    .bind(value)
    .bind(normalized)
    .bind(run_id.0)
    .fetch_one(&mut *conn)
    .await?;

    let created: bool = row.try_get("created")?;
    Ok(UpsertOutcome {
        id: AssetId(row.try_get("id")?),
        created,
    })
}

#[allow(clippy::too_many_arguments)]
pub async fn upsert_service_seen(
    conn: &mut PgConnection,
    target_id: TargetId,
    run_id: RunId,
    asset_id: AssetId,
    port: u16,
    proto: Proto,
    name: Option<&str>,
    product: Option<&str>,
    version: Option<&str>,
) -> Result<UpsertOutcome<ServiceId>> {
    let id = ServiceId::new();
    let row = sqlx::query(
        r#"
        INSERT INTO services (
            id, target_id, asset_id, port, proto, name, product, version, status,
            first_seen_run_id, last_seen_run_id, first_seen_at, last_seen_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'active', $9, $9, NOW(), NOW())
        ON CONFLICT (target_id, asset_id, port, proto) DO UPDATE SET
            name = COALESCE(EXCLUDED.name, services.name),
            product = COALESCE(EXCLUDED.product, services.product),
            version = COALESCE(EXCLUDED.version, services.version),
            last_seen_run_id = EXCLUDED.last_seen_run_id,
            last_seen_at = NOW(),
            status_reason = NULL,
            verified_at = CASE
                WHEN services.status <> 'active' THEN NOW()
                ELSE services.verified_at
            END,
            status = 'active'
        RETURNING id, (xmax = 0) AS created
        "#,
    )
    .bind(id.0)
    .bind(target_id.0)
    .bind(asset_id.0)
    .bind(i32::from(port))
    .bind(proto.as_str())
    .bind(name)
    .bind(product)
    .bind(version)
    .bind(run_id.0)
    .fetch_one(&mut *conn)
    .await?;

    let created: bool = row.try_get("created")?;
    Ok(UpsertOutcome {
        id: ServiceId(row.try_get("id")?),
        created,
    })
}

pub async fn upsert_edge_seen(
    conn: &mut PgConnection,
    target_id: TargetId,
    run_id: RunId,
    from: AssetId,
    to: AssetId,
    rel_type: RelType,
) -> Result<UpsertOutcome<EdgeId>> {
    let id = EdgeId::new();
    let row = sqlx::query(
        r#"
        INSERT INTO edges (
            id, target_id, from_asset_id, to_asset_id, rel_type,
            first_seen_run_id, last_seen_run_id, first_seen_at, last_seen_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $6, NOW(), NOW())
        ON CONFLICT (from_asset_id, to_asset_id, rel_type) DO UPDATE SET
            last_seen_run_id = EXCLUDED.last_seen_run_id,
            last_seen_at = NOW()
        RETURNING id, (xmax = 0) AS created
        "#,
    )
    .bind(id.0)
    .bind(target_id.0)
    .bind(from.0)
    .bind(to.0)
    .bind(rel_type.as_str())
    .bind(run_id.0)
    .fetch_one(&mut *conn)
    .await?;

    let created: bool = row.try_get("created")?;
    Ok(UpsertOutcome {
        id: EdgeId(row.try_get("id")?),
        created,
    })
}

fn is_serialization_conflict(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
        }
        _ => false,
    }
}

pub fn asset_from_row(row: &PgRow) -> Result<AssetRecord> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    Ok(AssetRecord {
        id: AssetId(row.try_get("id")?),
        target_id: TargetId(row.try_get("target_id")?),
        kind: AssetKind::parse(&kind)?,
        value: row.try_get("value")?,
        normalized: row.try_get("normalized")?,
        status: ArtifactStatus::parse(&status)?,
        status_reason: row.try_get("status_reason")?,
        first_seen_run_id: row.try_get::<Option<uuid::Uuid>, _>("first_seen_run_id")?.map(RunId),
        last_seen_run_id: row.try_get::<Option<uuid::Uuid>, _>("last_seen_run_id")?.map(RunId),
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        verified_at: row.try_get("verified_at")?,
    })
}

pub fn service_from_row(row: &PgRow) -> Result<ServiceRecord> {
    let proto: String = row.try_get("proto")?;
    let status: String = row.try_get("status")?;
    let port: i32 = row.try_get("port")?;
    Ok(ServiceRecord {
        id: ServiceId(row.try_get("id")?),
        target_id: TargetId(row.try_get("target_id")?),
        asset_id: AssetId(row.try_get("asset_id")?),
        port: port as u16,
        proto: Proto::parse(&proto)?,
        name: row.try_get("name")?,
        product: row.try_get("product")?,
        version: row.try_get("version")?,
        status: ArtifactStatus::parse(&status)?,
        status_reason: row.try_get("status_reason")?,
        first_seen_run_id: row.try_get::<Option<uuid::Uuid>, _>("first_seen_run_id")?.map(RunId),
        last_seen_run_id: row.try_get::<Option<uuid::Uuid>, _>("last_seen_run_id")?.map(RunId),
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        verified_at: row.try_get("verified_at")?,
    })
}
