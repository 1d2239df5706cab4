//! The recon pipeline: a fixed DAG of stages chained through the job queue.
//!
//! subfinder -> dns_resolve -> nmap -> httpx -> nuclei -> finalize
//!
//! A stage job computes its inputs from the inventory and fans out scanner
//! jobs; the last child to finish enqueues the next stage (the enqueue is
//! dedupe-merged, so concurrent finishers cannot double-advance). Stages with
//! no inputs advance immediately and are recorded as completed with zero
//! work. The finalize stage runs change detection and closes the run.

use std::collections::HashSet;
use std::fmt;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::audit;
use crate::changes::{self, ChangeDetector};
use crate::config::EngineConfig;
use crate::db::{FindingRepo, InventoryRepo, RunRepo, ScanRepo, TargetRepo};
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::model::{
    AssetArtifact, AssetKind, EdgeArtifact, PipelineConfig, RelType, RunRecord, RunStatus,
    RunTrigger, ScanOutput, TargetRecord,
};
use crate::normalize;
use crate::orchestration::job::{
    EnqueueRequest, JobPayload, JobRecord, PipelineJob, ScanJob, ScannerKind, PRIORITY_PIPELINE,
    PRIORITY_SCAN,
};
use crate::orchestration::queue::JobQueue;
use crate::resolve::{DnsResolver, ResolveOutcome};
use crate::scanner::{descriptor_for, ScannerRunner};
use crate::scope::ScopeEnforcer;
use crate::types::{JobId, RunId, TargetId};

pub const WEB_PORTS_HTTP: &[u16] = &[80, 8080, 8000, 3000, 5000, 8888, 8081, 9000, 10000];
pub const WEB_PORTS_HTTPS: &[u16] = &[443, 8443, 9443];

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Subfinder,
    DnsResolve,
    Nmap,
    Httpx,
    Nuclei,
    Finalize,
}

impl PipelineStage {
    pub const FIRST: PipelineStage = PipelineStage::Subfinder;

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Subfinder => "subfinder",
            PipelineStage::DnsResolve => "dns_resolve",
            PipelineStage::Nmap => "nmap",
            PipelineStage::Httpx => "httpx",
            PipelineStage::Nuclei => "nuclei",
            PipelineStage::Finalize => "finalize",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "subfinder" => Ok(PipelineStage::Subfinder),
            "dns_resolve" => Ok(PipelineStage::DnsResolve),
            "nmap" => Ok(PipelineStage::Nmap),
            "httpx" => Ok(PipelineStage::Httpx),
            "nuclei" => Ok(PipelineStage::Nuclei),
            "finalize" => Ok(PipelineStage::Finalize),
            other => Err(EngineError::Internal(format!("unknown stage {other:?}"))),
        }
    }

    pub fn next(&self) -> Option<PipelineStage> {
        match self {
            PipelineStage::Subfinder => Some(PipelineStage::DnsResolve),
            PipelineStage::DnsResolve => Some(PipelineStage::Nmap),
            PipelineStage::Nmap => Some(PipelineStage::Httpx),
            PipelineStage::Httpx => Some(PipelineStage::Nuclei),
            PipelineStage::Nuclei => Some(PipelineStage::Finalize),
            PipelineStage::Finalize => None,
        }
    }

    /// dns_resolve failures invalidate everything downstream; the other
    /// stages are best-effort.
    pub fn is_critical(&self) -> bool {
        matches!(self, PipelineStage::DnsResolve)
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build deduplicated, normalized probe URLs from services observed this run.
/// Ports outside the web sets are admitted when the fingerprinted service
/// name looks like HTTP.
pub fn build_http_targets(
    candidates: &[crate::db::inventory::WebCandidate],
    max_targets: usize,
) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut targets = Vec::new();

    for candidate in candidates {
        let https = WEB_PORTS_HTTPS.contains(&candidate.port);
        let http = WEB_PORTS_HTTP.contains(&candidate.port);
        let named_http = candidate
            .service_name
            .as_deref()
            .map(|name| name.to_ascii_lowercase().starts_with("http"))
            .unwrap_or(false);
        if !https && !http && !named_http {
            continue;
        }

        let host = candidate.via_name.as_deref().unwrap_or(&candidate.host);
        let url = if https {
            if candidate.port == 443 {
                format!("https://{host}")
            } else {
                format!("https://{host}:{}", candidate.port)
            }
        } else if candidate.port == 80 {
            format!("http://{host}")
        } else {
            format!("http://{host}:{}", candidate.port)
        };

        let Ok(normalized) = normalize::normalize_url(&url) else {
            continue;
        };
        if seen.insert(normalized.clone()) {
            targets.push(normalized);
            if targets.len() >= max_targets {
                break;
            }
        }
    }
    targets
}

pub struct PipelineOrchestrator {
    pool: PgPool,
    config: EngineConfig,
    queue: std::sync::Arc<dyn JobQueue>,
    events: std::sync::Arc<EventBus>,
    targets: TargetRepo,
    runs: RunRepo,
    scans: ScanRepo,
    inventory: InventoryRepo,
    findings: FindingRepo,
    enforcer: ScopeEnforcer,
    runner: ScannerRunner,
    resolver: DnsResolver,
    detector: ChangeDetector,
}

impl PipelineOrchestrator {
    pub fn new(
        pool: PgPool,
        config: EngineConfig,
        queue: std::sync::Arc<dyn JobQueue>,
        events: std::sync::Arc<EventBus>,
        resolver: DnsResolver,
    ) -> Self {
        let runner = ScannerRunner::new(config.tools_container.clone(), config.raw_output_cap);
        Self {
            targets: TargetRepo::new(pool.clone()),
            runs: RunRepo::new(pool.clone()),
            scans: ScanRepo::new(pool.clone()),
            inventory: InventoryRepo::new(pool.clone()),
            findings: FindingRepo::new(pool.clone()),
            enforcer: ScopeEnforcer::new(pool.clone()),
            detector: ChangeDetector::new(pool.clone()),
            runner,
            resolver,
            pool,
            config,
            queue,
            events,
        }
    }

    /// Create a run and enqueue its first stage. Fails when the target
    /// already has a non-terminal pipeline run.
    pub async fn start_run(
        &self,
        target_id: TargetId,
        trigger: RunTrigger,
        requested: PipelineConfig,
    ) -> Result<(RunId, JobId)> {
        let target = self.targets.get(target_id).await?;
        if self.runs.active_pipeline_exists(target_id).await? {
            return Err(EngineError::Conflict(format!(
                "target {target_id} already has an active pipeline run"
            )));
        }

        let config = changes::effective_config(
            requested,
            target.scope.max_hosts,
            target.scope.max_http_targets,
        );
        let run = self.runs.create(target_id, trigger, config).await?;
        let handle = self
            .queue
            .enqueue(EnqueueRequest::new(
                target_id,
                JobPayload::Pipeline(PipelineJob {
                    run_id: run.id,
                    stage: PipelineStage::FIRST,
                    config,
                }),
                PRIORITY_PIPELINE,
            ))
            .await?;

        audit::log_event(
            &self.pool,
            target_id,
            Some(run.id),
            "run_enqueued",
            json!({ "trigger": trigger.as_str(), "job_id": handle.job_id }),
            "engine",
        )
        .await?;
        Ok((run.id, handle.job_id))
    }

    /// Handle one pipeline-stage job.
    pub async fn run_stage(
        &self,
        job: &JobRecord,
        stage_job: &PipelineJob,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let run = self.ensure_run_active(stage_job.run_id).await?;
        let target = self.targets.get(run.target_id).await?;
        check_cancel(cancel, job.id)?;

        if stage_job.stage == PipelineStage::FIRST {
            self.runs.mark_running(run.id).await?;
            self.events.publish(EngineEvent::RunStarted {
                run_id: run.id,
                target_id: run.target_id,
            });
            audit::log_event(
                &self.pool,
                run.target_id,
                Some(run.id),
                "pipeline_started",
                json!({
                    "trigger": run.trigger.as_str(),
                    "max_hosts": stage_job.config.max_hosts,
                    "max_http_targets": stage_job.config.max_http_targets,
                }),
                "worker",
            )
            .await?;
        }

        if stage_job.stage == PipelineStage::Finalize {
            return self.finalize(&run).await;
        }

        let children = self.stage_children(&target, &run, stage_job).await?;
        if children.is_empty() {
            audit::log_event(
                &self.pool,
                run.target_id,
                Some(run.id),
                "stage_skipped",
                json!({ "stage": stage_job.stage.as_str() }),
                "worker",
            )
            .await?;
            return self.enqueue_next_stage(&run, stage_job.stage, stage_job.config).await;
        }

        let requests: Vec<EnqueueRequest> = children
            .into_iter()
            .map(|scan| {
                EnqueueRequest::new(run.target_id, JobPayload::Scan(scan), PRIORITY_SCAN)
            })
            .collect();
        self.queue.enqueue_many(requests).await?;
        Ok(())
    }

    async fn stage_children(
        &self,
        target: &TargetRecord,
        run: &RunRecord,
        stage_job: &PipelineJob,
    ) -> Result<Vec<ScanJob>> {
        let config = stage_job.config;
        let mut children = Vec::new();
        match stage_job.stage {
            PipelineStage::Subfinder => {
                children.push(ScanJob {
                    run_id: run.id,
                    stage: PipelineStage::Subfinder,
                    scanner: ScannerKind::Subfinder,
                    target: target.root_domain.clone(),
                    targets: Vec::new(),
                    config,
                });
            }
            PipelineStage::DnsResolve => {
                // Resolve everything seen this run plus the root itself; an
                // empty subfinder result degrades to the root host only.
                let mut names = self
                    .inventory
                    .subdomains_seen_in_run(run.target_id, run.id)
                    .await?;
                let root = normalize::normalize_host(&target.root_domain).map_err(|err| {
                    EngineError::Normalization {
                        value: target.root_domain.clone(),
                        reason: err.to_string(),
                    }
                })?;
                if !names.contains(&root) {
                    names.insert(0, root);
                }
                children.push(ScanJob {
                    run_id: run.id,
                    stage: PipelineStage::DnsResolve,
                    scanner: ScannerKind::DnsResolve,
                    target: target.root_domain.clone(),
                    targets: names,
                    config,
                });
            }
            PipelineStage::Nmap => {
                let ips = self
                    .inventory
                    .nmap_candidates(run.target_id, run.id, config.max_hosts)
                    .await?;
                for ip in ips {
                    children.push(ScanJob {
                        run_id: run.id,
                        stage: PipelineStage::Nmap,
                        scanner: ScannerKind::Nmap,
                        target: ip,
                        targets: Vec::new(),
                        config,
                    });
                }
            }
            PipelineStage::Httpx => {
                let candidates = self
                    .inventory
                    .web_candidates(run.target_id, run.id)
                    .await?;
                let targets = build_http_targets(&candidates, config.max_http_targets);
                if !targets.is_empty() {
                    children.push(ScanJob {
                        run_id: run.id,
                        stage: PipelineStage::Httpx,
                        scanner: ScannerKind::Httpx,
                        target: target.root_domain.clone(),
                        targets,
                        config,
                    });
                }
            }
            PipelineStage::Nuclei => {
                let urls = self.inventory.urls_seen_in_run(run.target_id, run.id).await?;
                if !urls.is_empty() {
                    children.push(ScanJob {
                        run_id: run.id,
                        stage: PipelineStage::Nuclei,
                        scanner: ScannerKind::Nuclei,
                        target: target.root_domain.clone(),
                        targets: urls,
                        config,
                    });
                }
            }
            PipelineStage::Finalize => {}
        }
        Ok(children)
    }

    /// Handle one scanner job inside a stage.
    pub async fn run_scan(
        &self,
        job: &JobRecord,
        scan_job: &ScanJob,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let run = self.ensure_run_active(scan_job.run_id).await?;
        let target = self.targets.get(run.target_id).await?;
        check_cancel(cancel, job.id)?;

        // Scope gate before anything touches the network. A deny is fatal to
        // the job and audited.
        let scope_kind = match scan_job.scanner {
            ScannerKind::Subfinder | ScannerKind::DnsResolve => AssetKind::Host,
            ScannerKind::Nmap => {
                if normalize::is_ip(&scan_job.target) {
                    AssetKind::Ip
                } else {
                    AssetKind::Host
                }
            }
            ScannerKind::Httpx | ScannerKind::Nuclei => AssetKind::Host,
        };
        if let Err(err) = self
            .enforcer
            .authorize(run.target_id.0, &target.scope, &scan_job.target, scope_kind)
            .await
        {
            audit::log_event(
                &self.pool,
                run.target_id,
                Some(run.id),
                "scope_denied",
                json!({
                    "scanner": scan_job.scanner.as_str(),
                    "target": scan_job.target,
                }),
                "worker",
            )
            .await?;
            return Err(err);
        }
        // Batch target lists were built from in-scope inventory; anything
        // that no longer passes the policy is dropped rather than scanned.
        let mut batch_targets = Vec::with_capacity(scan_job.targets.len());
        for candidate in &scan_job.targets {
            let kind = match scan_job.scanner {
                ScannerKind::Httpx | ScannerKind::Nuclei => AssetKind::Url,
                _ => AssetKind::Host,
            };
            match self
                .enforcer
                .authorize(run.target_id.0, &target.scope, candidate, kind)
                .await
            {
                Ok(()) => batch_targets.push(candidate.clone()),
                Err(_) => {
                    tracing::warn!(%candidate, scanner = %scan_job.scanner, "dropped out-of-scope batch target");
                }
            }
        }
        if !scan_job.targets.is_empty() && batch_targets.is_empty() {
            return Err(EngineError::ScopeDenied {
                candidate: scan_job.target.clone(),
                reason: "all batch targets out of scope".to_string(),
            });
        }

        // A retried job may be rerunning after a crash mid-scan; retire the
        // orphaned attempt so its findings are not counted twice.
        self.scans
            .supersede_incomplete(
                run.target_id,
                run.id,
                scan_job.scanner.as_str(),
                &scan_job.target,
            )
            .await?;

        let scan_id = self
            .scans
            .insert_started(
                run.target_id,
                Some(run.id),
                scan_job.scanner.as_str(),
                &scan_job.target,
                Some(json!({
                    "stage": scan_job.stage.as_str(),
                    "targets": batch_targets.len(),
                })),
            )
            .await?;
        self.events.publish(EngineEvent::ScanStarted {
            scan_id,
            run_id: Some(run.id),
            scanner: scan_job.scanner.as_str().to_string(),
            target: scan_job.target.clone(),
        });
        audit::log_event(
            &self.pool,
            run.target_id,
            Some(run.id),
            "scan_started",
            json!({ "scanner": scan_job.scanner.as_str(), "target": scan_job.target, "scan_id": scan_id }),
            "worker",
        )
        .await?;

        let execution = match scan_job.scanner {
            ScannerKind::DnsResolve => self.execute_dns_resolve(&target, &batch_targets).await,
            scanner => {
                let descriptor = descriptor_for(scanner).ok_or_else(|| {
                    EngineError::Internal(format!("no descriptor for scanner {scanner}"))
                })?;
                self.runner
                    .run(
                        descriptor,
                        scan_id,
                        &scan_job.target,
                        &batch_targets,
                        &target.scope,
                        &self.events,
                        cancel,
                    )
                    .await
                    .map(|exec| (exec.output, exec.raw_output))
            }
        };

        let (output, raw_output) = match execution {
            Ok(result) => result,
            Err(err) => {
                self.scans
                    .finish(scan_id, "failed", &format!("error: {err}"))
                    .await?;
                self.events.publish(EngineEvent::ScanCompleted {
                    scan_id,
                    run_id: Some(run.id),
                    scanner: scan_job.scanner.as_str().to_string(),
                    status: "failed".to_string(),
                });
                return Err(err);
            }
        };

        self.inventory
            .ingest_batch(run.target_id, run.id, &output)
            .await?;

        let link_urls = scan_job.scanner == ScannerKind::Nuclei;
        let rows = self
            .findings
            .insert_for_scan(run.target_id, Some(run.id), scan_id, &output.findings, link_urls)
            .await?;
        for row in &rows {
            self.events.publish(EngineEvent::FindingDiscovered {
                finding_id: row.id,
                scan_id: Some(scan_id),
                severity: row.severity,
                title: row.title.clone(),
            });
        }

        self.scans.finish(scan_id, "completed", &raw_output).await?;
        self.events.publish(EngineEvent::ScanCompleted {
            scan_id,
            run_id: Some(run.id),
            scanner: scan_job.scanner.as_str().to_string(),
            status: "completed".to_string(),
        });
        audit::log_event(
            &self.pool,
            run.target_id,
            Some(run.id),
            "scan_completed",
            json!({
                "scanner": scan_job.scanner.as_str(),
                "target": scan_job.target,
                "scan_id": scan_id,
                "findings": output.findings.len(),
                "warnings": output.warnings,
            }),
            "worker",
        )
        .await?;
        Ok(())
    }

    async fn execute_dns_resolve(
        &self,
        target: &TargetRecord,
        names: &[String],
    ) -> Result<(ScanOutput, String)> {
        let results = self.resolver.resolve_many(names, 50).await;
        let mut output = ScanOutput::default();
        let mut raw_lines = Vec::with_capacity(results.len());

        for result in &results {
            let Ok(name_norm) = normalize::normalize_host(&result.name) else {
                continue;
            };
            let name_artifact = AssetArtifact {
                kind: AssetKind::Subdomain,
                value: result.name.clone(),
                normalized: name_norm.clone(),
            };
            output.assets.push(name_artifact.clone());

            match &result.outcome {
                ResolveOutcome::Resolved(ips) => {
                    let mut kept = Vec::new();
                    for ip in ips {
                        let Ok(ip_norm) = normalize::normalize_ip(ip, &target.scope) else {
                            output.warnings.push(format!("skipped address {ip} for {name_norm}"));
                            continue;
                        };
                        kept.push(ip_norm.clone());
                        let ip_artifact = AssetArtifact {
                            kind: AssetKind::Ip,
                            value: ip.clone(),
                            normalized: ip_norm,
                        };
                        output.assets.push(ip_artifact.clone());
                        output.edges.push(EdgeArtifact {
                            from: name_artifact.clone(),
                            to: ip_artifact,
                            rel_type: RelType::ResolvesTo,
                        });
                    }
                    raw_lines.push(format!("{name_norm} -> {}", kept.join(", ")));
                }
                ResolveOutcome::NxDomain => {
                    // Not observed as resolving this run; the change detector
                    // decides later whether that makes the name a candidate.
                    raw_lines.push(format!("{name_norm} -> unresolved (NXDOMAIN)"));
                }
                ResolveOutcome::Error(reason) => {
                    raw_lines.push(format!("{name_norm} -> unresolved ({reason})"));
                }
            }
        }

        Ok((output, raw_lines.join("\n")))
    }

    /// Called by the worker after a scanner job reached a terminal state.
    /// The last finished child of a stage enqueues the successor; a critical
    /// stage failure fails the whole run instead.
    pub async fn on_scan_terminal(
        &self,
        job: &JobRecord,
        scan_job: &ScanJob,
        success: bool,
    ) -> Result<()> {
        let run = match self.runs.get(scan_job.run_id).await {
            Ok(run) => run,
            Err(EngineError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        if run.status.is_terminal() {
            return Ok(());
        }

        if !success {
            if scan_job.stage.is_critical() {
                return self
                    .fail_run(
                        &run,
                        &format!("critical stage {} failed", scan_job.stage),
                    )
                    .await;
            }
            audit::log_event(
                &self.pool,
                run.target_id,
                Some(run.id),
                "stage_child_failed",
                json!({
                    "stage": scan_job.stage.as_str(),
                    "scanner": scan_job.scanner.as_str(),
                    "target": scan_job.target,
                    "job_id": job.id,
                }),
                "worker",
            )
            .await?;
        }

        let open = self
            .queue
            .open_stage_jobs(run.id, scan_job.stage.as_str())
            .await?;
        if open == 0 {
            self.enqueue_next_stage(&run, scan_job.stage, scan_job.config).await?;
        }
        Ok(())
    }

    /// Close out a verification sweep run once its last re-probe finished.
    pub async fn on_verify_terminal(&self, job: &JobRecord) -> Result<()> {
        let Some(run_id) = job.run_id else {
            return Ok(());
        };
        let run = match self.runs.get(run_id).await {
            Ok(run) => run,
            Err(EngineError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        if run.trigger != RunTrigger::Verification || run.status.is_terminal() {
            return Ok(());
        }
        if self.queue.open_run_jobs(run_id).await? == 0 {
            let completed = self.runs.mark_terminal(run_id, RunStatus::Completed, None).await?;
            if completed {
                self.events.publish(EngineEvent::RunCompleted {
                    run_id,
                    target_id: run.target_id,
                    status: RunStatus::Completed,
                });
            }
        }
        Ok(())
    }

    async fn enqueue_next_stage(
        &self,
        run: &RunRecord,
        stage: PipelineStage,
        config: PipelineConfig,
    ) -> Result<()> {
        let Some(next) = stage.next() else {
            return Ok(());
        };
        self.queue
            .enqueue(EnqueueRequest::new(
                run.target_id,
                JobPayload::Pipeline(PipelineJob {
                    run_id: run.id,
                    stage: next,
                    config,
                }),
                PRIORITY_PIPELINE,
            ))
            .await?;
        Ok(())
    }

    async fn finalize(&self, run: &RunRecord) -> Result<()> {
        let executed = changes::executed_stages(&self.pool, run.id).await?;
        let summary = self
            .detector
            .detect(
                run.target_id,
                run.id,
                &executed,
                self.config.retry.max_attempts,
            )
            .await?;

        let completed = self.runs.mark_terminal(run.id, RunStatus::Completed, None).await?;
        if completed {
            self.events.publish(EngineEvent::RunCompleted {
                run_id: run.id,
                target_id: run.target_id,
                status: RunStatus::Completed,
            });
            audit::log_event(
                &self.pool,
                run.target_id,
                Some(run.id),
                "pipeline_completed",
                json!({
                    "new_assets": summary.new_assets,
                    "new_services": summary.new_services,
                    "new_edges": summary.new_edges,
                    "stale_assets": summary.stale_assets,
                    "stale_services": summary.stale_services,
                }),
                "worker",
            )
            .await?;
        }
        Ok(())
    }

    pub async fn fail_run(&self, run: &RunRecord, summary: &str) -> Result<()> {
        let changed = self
            .runs
            .mark_terminal(run.id, RunStatus::Failed, Some(summary))
            .await?;
        if changed {
            self.queue.cancel_for_run(run.id, "run failed").await?;
            self.events.publish(EngineEvent::RunCompleted {
                run_id: run.id,
                target_id: run.target_id,
                status: RunStatus::Failed,
            });
            audit::log_event(
                &self.pool,
                run.target_id,
                Some(run.id),
                "pipeline_failed",
                json!({ "summary": summary }),
                "worker",
            )
            .await?;
        }
        Ok(())
    }

    /// Discard a non-terminal run and cascade cancellation to its jobs.
    pub async fn discard_run(&self, run_id: RunId) -> Result<bool> {
        let run = self.runs.get(run_id).await?;
        let changed = self
            .runs
            .mark_terminal(run_id, RunStatus::Discarded, None)
            .await?;
        if changed {
            self.queue.cancel_for_run(run_id, "run discarded").await?;
            self.runs.stamp_completed_at(run_id).await?;
            self.events.publish(EngineEvent::RunCompleted {
                run_id,
                target_id: run.target_id,
                status: RunStatus::Discarded,
            });
            audit::log_event(
                &self.pool,
                run.target_id,
                Some(run_id),
                "run_discarded",
                json!({}),
                "api",
            )
            .await?;
        }
        Ok(changed)
    }

    /// Load the run, honouring external discard/cancel and the run deadline.
    async fn ensure_run_active(&self, run_id: RunId) -> Result<RunRecord> {
        let run = self.runs.get(run_id).await?;
        if run.status.is_terminal() {
            return Err(EngineError::Cancelled(format!(
                "run {run_id} is {}",
                run.status.as_str()
            )));
        }
        if let Some(started_at) = run.started_at {
            let deadline = started_at + Duration::seconds(self.config.run_deadline_secs);
            if Utc::now() > deadline {
                self.fail_run(&run, "run deadline exceeded").await?;
                return Err(EngineError::Cancelled(format!(
                    "run {run_id} exceeded its deadline"
                )));
            }
        }
        Ok(run)
    }
}

fn check_cancel(cancel: &CancellationToken, job_id: JobId) -> Result<()> {
    if cancel.is_cancelled() {
        Err(EngineError::Cancelled(format!("job {job_id} cancelled")))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::inventory::WebCandidate;

    #[test]
    fn stage_chain_is_the_documented_dag() {
        let mut stage = PipelineStage::FIRST;
        let mut chain = vec![stage];
        while let Some(next) = stage.next() {
            chain.push(next);
            stage = next;
        }
        assert_eq!(
            chain,
            vec![
                PipelineStage::Subfinder,
                PipelineStage::DnsResolve,
                PipelineStage::Nmap,
                PipelineStage::Httpx,
                PipelineStage::Nuclei,
                PipelineStage::Finalize,
            ]
        );
    }

    #[test]
    fn only_dns_resolve_is_critical() {
        for stage in [
            PipelineStage::Subfinder,
            PipelineStage::Nmap,
            PipelineStage::Httpx,
            PipelineStage::Nuclei,
            PipelineStage::Finalize,
        ] {
            assert!(!stage.is_critical());
        }
        assert!(PipelineStage::DnsResolve.is_critical());
    }

    fn candidate(host: &str, via: Option<&str>, port: u16, name: Option<&str>) -> WebCandidate {
        WebCandidate {
            host: host.to_string(),
            via_name: via.map(str::to_string),
            port,
            service_name: name.map(str::to_string),
        }
    }

    #[test]
    fn http_targets_prefer_resolving_names_and_elide_default_ports() {
        let targets = build_http_targets(
            &[
                candidate("1.2.3.4", Some("a.example.com"), 80, Some("http")),
                candidate("1.2.3.4", Some("a.example.com"), 443, Some("https")),
                candidate("1.2.3.4", None, 8443, None),
            ],
            10,
        );
        assert_eq!(
            targets,
            vec![
                "http://a.example.com/",
                "https://a.example.com/",
                "https://1.2.3.4:8443/",
            ]
        );
    }

    #[test]
    fn http_targets_skip_non_web_ports_unless_named_http() {
        let targets = build_http_targets(
            &[
                candidate("1.2.3.4", None, 22, Some("ssh")),
                candidate("1.2.3.4", None, 9999, Some("http-alt")),
            ],
            10,
        );
        assert_eq!(targets, vec!["http://1.2.3.4:9999/"]);
    }

    #[test]
    fn http_targets_dedupe_and_respect_cap() {
        let targets = build_http_targets(
            &[
                candidate("1.2.3.4", Some("a.example.com"), 80, Some("http")),
                candidate("5.6.7.8", Some("a.example.com"), 80, Some("http")),
                candidate("1.2.3.4", Some("b.example.com"), 80, Some("http")),
            ],
            1,
        );
        assert_eq!(targets, vec!["http://a.example.com/"]);
    }

    #[test]
    fn stage_string_round_trip() {
        for stage in [
            PipelineStage::Subfinder,
            PipelineStage::DnsResolve,
            PipelineStage::Nmap,
            PipelineStage::Httpx,
            PipelineStage::Nuclei,
            PipelineStage::Finalize,
        ] {
            assert_eq!(PipelineStage::parse(stage.as_str()).unwrap(), stage);
        }
    }
}
