use sqlx::PgPool;

use crate::error::Result;
use crate::model::{AssetKind, FindingArtifact, FindingRow};
use crate::normalize;
use crate::types::{AssetId, FindingId, RunId, ScanId, TargetId};

#[derive(Clone, Debug)]
pub struct FindingRepo {
    pool: PgPool,
}

impl FindingRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Persist a scan's findings. With `link_url_assets` set (nuclei), each
    /// finding is attached to the url asset it matched, creating the asset
    /// row when the scan observed a url the inventory has not seen yet.
    pub async fn insert_for_scan(
        &self,
        target_id: TargetId,
        run_id: Option<RunId>,
        scan_id: ScanId,
        findings: &[FindingArtifact],
        link_url_assets: bool,
    ) -> Result<Vec<FindingRow>> {
        let mut rows = Vec::with_capacity(findings.len());
        let mut tx = self.pool.begin().await?;

        for finding in findings {
            let mut asset_id: Option<AssetId> = None;
            if link_url_assets && !finding.url.is_empty() {
                if let Ok(url_norm) = normalize::normalize_url(&finding.url) {
                    let existing: Option<uuid::Uuid> = sqlx::query_scalar(
                        "SELECT id FROM assets WHERE target_id = $1 AND kind = 'url' AND normalized = $2",
                    )
                    .bind(target_id.0)
                    .bind(&url_norm)
                    .fetch_optional(&mut *tx)
                    .await?;
                    asset_id = match existing {
                        Some(id) => Some(AssetId(id)),
                        None => {
                            if let Some(run_id) = run_id {
                                let outcome = crate::db::inventory::upsert_asset_seen(
                                    &mut *tx,
                                    target_id,
                                    run_id,
                                    AssetKind::Url,
                                    &finding.url,
                                    &url_norm,
                                )
                                .await?;
                                Some(outcome.id)
                            } else {
                                None
                            }
                        }
                    };
                }
            }

            let id = FindingId::new();
            sqlx::query(
                r#"
                INSERT INTO findings (
                    id, scan_id, target_id, run_id, asset_id, severity, title,
                    description, impact, evidence, remediation, remediation_example,
                    url, cve, cvss_score
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                "#,
            )
            .bind(id.0)
            .bind(scan_id.0)
            .bind(target_id.0)
            .bind(run_id.map(|r| r.0))
            .bind(asset_id.map(|a| a.0))
            .bind(finding.severity().as_str())
            .bind(&finding.title)
            .bind(&finding.description)
            .bind(&finding.impact)
            .bind(&finding.evidence)
            .bind(&finding.remediation)
            .bind(&finding.remediation_example)
            .bind(&finding.url)
            .bind(&finding.cve)
            .bind(finding.cvss_score)
            .execute(&mut *tx)
            .await?;

            rows.push(FindingRow {
                id,
                severity: finding.severity(),
                title: finding.title.clone(),
                url: finding.url.clone(),
            });
        }

        tx.commit().await?;
        Ok(rows)
    }
}
