//! Verification: targeted re-probes that decide whether a candidate-stale
//! artifact is really gone.
//!
//! Assets (subdomain/host) are checked against two independent resolvers;
//! only unanimous NXDOMAIN demotes to `unresolved`, any answer revives to
//! `active`, and a mixed or timed-out consensus stays `stale` and retries.
//! URLs get an HTTP probe; services a single-port connect probe. Every
//! terminal transition records an evidence scan and an audit row.

use std::time::Duration;

use serde_json::json;
use sqlx::PgPool;

use crate::audit;
use crate::db::{InventoryRepo, ScanRepo, TargetRepo};
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::model::{
    ArtifactStatus, AssetArtifact, AssetKind, AssetRecord, EdgeArtifact, PipelineConfig,
    Proto, RelType, RunTrigger, ScanOutput, ServiceRecord,
};
use crate::orchestration::job::{
    EnqueueRequest, JobPayload, VerifyAssetJob, VerifyServiceJob, PRIORITY_VERIFY,
};
use crate::orchestration::queue::JobQueue;
use crate::probe::{self, ProbeOutcome};
use crate::resolve::{DnsResolver, ResolveOutcome};
use crate::scope::ScopeEnforcer;
use crate::types::{RunId, ScanId, TargetId};

const TCP_PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const HTTP_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Verifier {
    pool: PgPool,
    targets: TargetRepo,
    scans: ScanRepo,
    inventory: InventoryRepo,
    enforcer: ScopeEnforcer,
    events: std::sync::Arc<EventBus>,
    resolvers: (DnsResolver, DnsResolver),
    http: reqwest::Client,
}

impl Verifier {
    pub fn new(pool: PgPool, events: std::sync::Arc<EventBus>) -> Result<Self> {
        // Probing infrastructure that is expected to be broken: certificate
        // errors must not mask a live service.
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(HTTP_PROBE_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| EngineError::Internal(format!("http client: {e}")))?;
        Ok(Self {
            targets: TargetRepo::new(pool.clone()),
            scans: ScanRepo::new(pool.clone()),
            inventory: InventoryRepo::new(pool.clone()),
            enforcer: ScopeEnforcer::new(pool.clone()),
            resolvers: DnsResolver::consensus_pair(),
            http,
            pool,
            events,
        })
    }

    pub async fn verify_asset(&self, target_id: TargetId, job: &VerifyAssetJob) -> Result<()> {
        let Some(asset) = self.inventory.get_asset(job.asset_id).await? else {
            return Ok(());
        };
        if asset.target_id != target_id {
            return Ok(());
        }

        // Re-probes obey the same scope policy as discovery scans; an asset
        // that has fallen out of scope is not probed again.
        let target = self.targets.get(target_id).await?;
        let decision = target.scope.decide(&asset.normalized, asset.kind);
        if !decision.allowed && asset.kind != AssetKind::Ip {
            audit::log_event(
                &self.pool,
                target_id,
                Some(job.run_id),
                "scope_denied",
                json!({ "asset_id": asset.id, "candidate": asset.normalized }),
                "worker",
            )
            .await?;
            return Err(EngineError::ScopeDenied {
                candidate: asset.normalized.clone(),
                reason: decision.reason.to_string(),
            });
        }

        let scan_id = self
            .scans
            .insert_started(target_id, Some(job.run_id), "verify_asset", &asset.value, None)
            .await?;

        let outcome = match asset.kind {
            AssetKind::Subdomain | AssetKind::Host => {
                self.verify_dns(&asset, target_id, job.run_id).await
            }
            AssetKind::Url => self.verify_url(&asset, job.run_id).await,
            // Bare IPs have no liveness check of their own; their services do.
            AssetKind::Ip => Ok(VerifyOutcome::skipped()),
        };

        match outcome {
            Ok(outcome) => {
                self.scans
                    .finish(
                        scan_id,
                        "completed",
                        &format!(
                            "{} {} -> {} ({})",
                            asset.kind.as_str(),
                            asset.normalized,
                            outcome.status.as_str(),
                            outcome.reason
                        ),
                    )
                    .await?;
                self.record_asset_transition(&asset, &outcome, scan_id, job.run_id)
                    .await?;
                Ok(())
            }
            Err(err) => {
                self.scans
                    .finish(scan_id, "failed", &format!("error: {err}"))
                    .await?;
                Err(err)
            }
        }
    }

    async fn verify_dns(
        &self,
        asset: &AssetRecord,
        target_id: TargetId,
        run_id: RunId,
    ) -> Result<VerifyOutcome> {
        let (primary, secondary) = (
            self.resolvers.0.resolve(&asset.normalized).await,
            self.resolvers.1.resolve(&asset.normalized).await,
        );

        let answers: Vec<&str> = [&primary.outcome, &secondary.outcome]
            .into_iter()
            .flat_map(|outcome| match outcome {
                ResolveOutcome::Resolved(ips) => {
                    ips.iter().map(String::as_str).collect::<Vec<_>>()
                }
                _ => Vec::new(),
            })
            .collect();

        if !answers.is_empty() {
            // Still resolves: revive and re-ingest the resolution edges into
            // the verifying run.
            let target = self.targets.get(target_id).await?;
            let mut output = ScanOutput::default();
            let name_artifact = AssetArtifact {
                kind: asset.kind,
                value: asset.value.clone(),
                normalized: asset.normalized.clone(),
            };
            output.assets.push(name_artifact.clone());
            for ip in &answers {
                if let Ok(ip_norm) = crate::normalize::normalize_ip(ip, &target.scope) {
                    let ip_artifact = AssetArtifact {
                        kind: AssetKind::Ip,
                        value: (*ip).to_string(),
                        normalized: ip_norm,
                    };
                    output.assets.push(ip_artifact.clone());
                    output.edges.push(EdgeArtifact {
                        from: name_artifact.clone(),
                        to: ip_artifact,
                        rel_type: RelType::ResolvesTo,
                    });
                }
            }
            self.inventory.ingest_batch(target_id, run_id, &output).await?;
            return Ok(VerifyOutcome::active("dns_resolved"));
        }

        let nx = |outcome: &ResolveOutcome| matches!(outcome, ResolveOutcome::NxDomain);
        if nx(&primary.outcome) && nx(&secondary.outcome) {
            return Ok(VerifyOutcome::terminal(ArtifactStatus::Unresolved, "NXDOMAIN"));
        }

        // One resolver timed out or disagreed; no verdict yet.
        Err(EngineError::VerificationInconclusive(format!(
            "{}: {:?} / {:?}",
            asset.normalized, primary.outcome, secondary.outcome
        )))
    }

    async fn verify_url(&self, asset: &AssetRecord, run_id: RunId) -> Result<VerifyOutcome> {
        match self.http.get(&asset.normalized).send().await {
            Ok(response) => {
                self.inventory
                    .upsert_asset_seen(
                        asset.target_id,
                        run_id,
                        AssetKind::Url,
                        &asset.value,
                        &asset.normalized,
                    )
                    .await?;
                Ok(VerifyOutcome::active(&format!("http:{}", response.status().as_u16())))
            }
            Err(err) => {
                let rendered = err.to_string();
                let lowered = rendered.to_ascii_lowercase();
                if lowered.contains("dns error") || lowered.contains("failed to lookup") {
                    Ok(VerifyOutcome::terminal(
                        ArtifactStatus::Unresolved,
                        &truncate(&rendered, 300),
                    ))
                } else {
                    Ok(VerifyOutcome::terminal(
                        ArtifactStatus::Closed,
                        &truncate(&rendered, 300),
                    ))
                }
            }
        }
    }

    async fn record_asset_transition(
        &self,
        asset: &AssetRecord,
        outcome: &VerifyOutcome,
        scan_id: ScanId,
        run_id: RunId,
    ) -> Result<()> {
        if outcome.skipped {
            return Ok(());
        }
        if outcome.status == ArtifactStatus::Active {
            // The upsert in the probe path already revived the row; make the
            // verification timestamp explicit for rows that were not stale.
            self.inventory
                .set_asset_status(asset.id, ArtifactStatus::Active, None, Some(chrono::Utc::now()))
                .await?;
        } else {
            self.inventory
                .set_asset_status(
                    asset.id,
                    outcome.status,
                    Some(&outcome.reason),
                    Some(chrono::Utc::now()),
                )
                .await?;
        }

        self.events.publish(EngineEvent::AssetStateChanged {
            target_id: asset.target_id,
            asset_id: Some(asset.id),
            service_id: None,
            status: outcome.status,
            reason: Some(outcome.reason.clone()),
        });
        audit::log_event(
            &self.pool,
            asset.target_id,
            Some(run_id),
            "asset_verified",
            json!({
                "asset_id": asset.id,
                "kind": asset.kind.as_str(),
                "normalized": asset.normalized,
                "status": outcome.status.as_str(),
                "reason": outcome.reason,
                "scan_id": scan_id,
            }),
            "worker",
        )
        .await?;
        Ok(())
    }

    pub async fn verify_service(&self, target_id: TargetId, job: &VerifyServiceJob) -> Result<()> {
        let Some(service) = self.inventory.get_service(job.service_id).await? else {
            return Ok(());
        };
        if service.target_id != target_id {
            return Ok(());
        }
        let host = match self.inventory.get_asset(service.asset_id).await? {
            Some(asset) => asset.normalized,
            None => String::new(),
        };

        if !host.is_empty() {
            let target = self.targets.get(target_id).await?;
            let kind = if crate::normalize::is_ip(&host) {
                AssetKind::Ip
            } else {
                AssetKind::Host
            };
            if let Err(err) = self
                .enforcer
                .authorize(target_id.0, &target.scope, &host, kind)
                .await
            {
                audit::log_event(
                    &self.pool,
                    target_id,
                    Some(job.run_id),
                    "scope_denied",
                    json!({ "service_id": service.id, "candidate": host }),
                    "worker",
                )
                .await?;
                return Err(err);
            }
        }

        let scan_id = self
            .scans
            .insert_started(
                target_id,
                Some(job.run_id),
                "verify_service",
                &format!("{host}:{}/{}", service.port, service.proto.as_str()),
                None,
            )
            .await?;

        if host.is_empty() {
            self.scans
                .finish(scan_id, "failed", "error: service host asset missing")
                .await?;
            return Err(EngineError::Internal(format!(
                "service {} has no host asset",
                service.id
            )));
        }

        let probe_result = match service.proto {
            Proto::Tcp => probe::tcp_probe(&host, service.port, TCP_PROBE_TIMEOUT).await,
            Proto::Udp => probe::udp_probe(&host, service.port, TCP_PROBE_TIMEOUT).await,
        };

        let outcome = match probe_result {
            ProbeOutcome::Open => {
                // Reachable: mark seen in the verifying run and revive.
                self.inventory
                    .upsert_service_seen(
                        target_id,
                        job.run_id,
                        service.asset_id,
                        service.port,
                        service.proto,
                        service.name.as_deref(),
                        service.product.as_deref(),
                        service.version.as_deref(),
                    )
                    .await?;
                VerifyOutcome::active("connect_ok")
            }
            ProbeOutcome::Closed(reason) => {
                VerifyOutcome::terminal(ArtifactStatus::Closed, &truncate(&reason, 300))
            }
        };

        self.scans
            .finish(
                scan_id,
                "completed",
                &format!(
                    "{host}:{}/{} -> {} ({})",
                    service.port,
                    service.proto.as_str(),
                    outcome.status.as_str(),
                    outcome.reason
                ),
            )
            .await?;
        self.record_service_transition(&service, &outcome, scan_id, job.run_id)
            .await?;
        Ok(())
    }

    async fn record_service_transition(
        &self,
        service: &ServiceRecord,
        outcome: &VerifyOutcome,
        scan_id: ScanId,
        run_id: RunId,
    ) -> Result<()> {
        if outcome.status == ArtifactStatus::Active {
            self.inventory
                .set_service_status(
                    service.id,
                    ArtifactStatus::Active,
                    None,
                    Some(chrono::Utc::now()),
                )
                .await?;
        } else {
            self.inventory
                .set_service_status(
                    service.id,
                    outcome.status,
                    Some(&outcome.reason),
                    Some(chrono::Utc::now()),
                )
                .await?;
        }

        self.events.publish(EngineEvent::AssetStateChanged {
            target_id: service.target_id,
            asset_id: None,
            service_id: Some(service.id),
            status: outcome.status,
            reason: Some(outcome.reason.clone()),
        });
        audit::log_event(
            &self.pool,
            service.target_id,
            Some(run_id),
            "service_verified",
            json!({
                "service_id": service.id,
                "port": service.port,
                "proto": service.proto.as_str(),
                "status": outcome.status.as_str(),
                "reason": outcome.reason,
                "scan_id": scan_id,
            }),
            "worker",
        )
        .await?;
        Ok(())
    }
}

/// Start a verification sweep run: every currently-stale artifact of the
/// target gets a re-probe job.
pub async fn start_verification_sweep(
    pool: &PgPool,
    queue: &dyn JobQueue,
    target_id: TargetId,
    max_attempts: i32,
) -> Result<(RunId, u64)> {
    let runs = crate::db::RunRepo::new(pool.clone());
    let run = runs
        .create(target_id, RunTrigger::Verification, PipelineConfig::default())
        .await?;
    runs.mark_running(run.id).await?;

    let stale_assets: Vec<uuid::Uuid> = sqlx::query_scalar(
        "SELECT id FROM assets WHERE target_id = $1 AND status = 'stale'",
    )
    .bind(target_id.0)
    .fetch_all(pool)
    .await?;
    let stale_services: Vec<uuid::Uuid> = sqlx::query_scalar(
        "SELECT id FROM services WHERE target_id = $1 AND status = 'stale'",
    )
    .bind(target_id.0)
    .fetch_all(pool)
    .await?;

    let mut requests = Vec::with_capacity(stale_assets.len() + stale_services.len());
    for asset_id in stale_assets {
        let mut request = EnqueueRequest::new(
            target_id,
            JobPayload::VerifyAsset(VerifyAssetJob {
                asset_id: crate::types::AssetId(asset_id),
                run_id: run.id,
            }),
            PRIORITY_VERIFY,
        );
        request.max_attempts = Some(max_attempts);
        requests.push(request);
    }
    for service_id in stale_services {
        let mut request = EnqueueRequest::new(
            target_id,
            JobPayload::VerifyService(VerifyServiceJob {
                service_id: crate::types::ServiceId(service_id),
                run_id: run.id,
            }),
            PRIORITY_VERIFY,
        );
        request.max_attempts = Some(max_attempts);
        requests.push(request);
    }

    let enqueued = requests.len() as u64;
    queue.enqueue_many(requests).await?;
    Ok((run.id, enqueued))
}

#[derive(Clone, Debug)]
struct VerifyOutcome {
    status: ArtifactStatus,
    reason: String,
    skipped: bool,
}

impl VerifyOutcome {
    fn active(reason: &str) -> Self {
        Self {
            status: ArtifactStatus::Active,
            reason: reason.to_string(),
            skipped: false,
        }
    }

    fn terminal(status: ArtifactStatus, reason: &str) -> Self {
        Self {
            status,
            reason: reason.to_string(),
            skipped: false,
        }
    }

    fn skipped() -> Self {
        Self {
            status: ArtifactStatus::Active,
            reason: "skipped".to_string(),
            skipped: true,
        }
    }
}

fn truncate(raw: &str, max: usize) -> String {
    if raw.len() <= max {
        raw.to_string()
    } else {
        let mut end = max;
        while end > 0 && !raw.is_char_boundary(end) {
            end -= 1;
        }
        raw[..end].to_string()
    }
}
