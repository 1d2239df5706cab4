//! Job envelope, payloads and enqueue types for the durable queue.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::model::PipelineConfig;
use crate::pipeline::PipelineStage;
use crate::types::{AssetId, JobId, RunId, ServiceId, TargetId};

/// The fixed set of scanners the pipeline drives. Adding a scanner means
/// adding a variant here plus a descriptor row in the registry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScannerKind {
    Subfinder,
    DnsResolve,
    Nmap,
    Httpx,
    Nuclei,
}

impl ScannerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScannerKind::Subfinder => "subfinder",
            ScannerKind::DnsResolve => "dns_resolve",
            ScannerKind::Nmap => "nmap",
            ScannerKind::Httpx => "httpx",
            ScannerKind::Nuclei => "nuclei",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "subfinder" => Ok(ScannerKind::Subfinder),
            "dns_resolve" => Ok(ScannerKind::DnsResolve),
            "nmap" => Ok(ScannerKind::Nmap),
            "httpx" => Ok(ScannerKind::Httpx),
            "nuclei" => Ok(ScannerKind::Nuclei),
            other => Err(EngineError::Internal(format!("unknown scanner {other:?}"))),
        }
    }
}

impl fmt::Display for ScannerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum JobKind {
    Pipeline,
    Scanner(ScannerKind),
    VerifyAsset,
    VerifyService,
}

impl JobKind {
    pub fn as_string(&self) -> String {
        match self {
            JobKind::Pipeline => "pipeline".to_string(),
            JobKind::Scanner(scanner) => format!("scanner:{scanner}"),
            JobKind::VerifyAsset => "verify_asset".to_string(),
            JobKind::VerifyService => "verify_service".to_string(),
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        if let Some(scanner) = raw.strip_prefix("scanner:") {
            return Ok(JobKind::Scanner(ScannerKind::parse(scanner)?));
        }
        match raw {
            "pipeline" => Ok(JobKind::Pipeline),
            "verify_asset" => Ok(JobKind::VerifyAsset),
            "verify_service" => Ok(JobKind::VerifyService),
            other => Err(EngineError::Internal(format!("unknown job kind {other:?}"))),
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(EngineError::Internal(format!("unknown job status {other:?}"))),
        }
    }
}

/// Priorities: higher dequeues sooner. Verification re-probes jump ahead of
/// routine pipeline work.
pub const PRIORITY_PIPELINE: i32 = 0;
pub const PRIORITY_SCAN: i32 = 0;
pub const PRIORITY_VERIFY: i32 = 10;

/// One pipeline-stage step for a run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineJob {
    pub run_id: RunId,
    pub stage: PipelineStage,
    #[serde(default)]
    pub config: PipelineConfig,
}

/// One scanner execution inside a stage. Fan-out stages carry a single
/// `target`; batch stages also carry the full target list.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanJob {
    pub run_id: RunId,
    pub stage: PipelineStage,
    pub scanner: ScannerKind,
    pub target: String,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub config: PipelineConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VerifyAssetJob {
    pub asset_id: AssetId,
    pub run_id: RunId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VerifyServiceJob {
    pub service_id: ServiceId,
    pub run_id: RunId,
}

/// Structured payload per job kind, stored as JSON on the queue row.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum JobPayload {
    Pipeline(PipelineJob),
    Scan(ScanJob),
    VerifyAsset(VerifyAssetJob),
    VerifyService(VerifyServiceJob),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Pipeline(_) => JobKind::Pipeline,
            JobPayload::Scan(job) => JobKind::Scanner(job.scanner),
            JobPayload::VerifyAsset(_) => JobKind::VerifyAsset,
            JobPayload::VerifyService(_) => JobKind::VerifyService,
        }
    }

    pub fn run_id(&self) -> Option<RunId> {
        match self {
            JobPayload::Pipeline(job) => Some(job.run_id),
            JobPayload::Scan(job) => Some(job.run_id),
            JobPayload::VerifyAsset(job) => Some(job.run_id),
            JobPayload::VerifyService(job) => Some(job.run_id),
        }
    }

    /// Structural identity: at most one active job per dedupe key exists in
    /// the queue; duplicate enqueues merge into the survivor.
    pub fn dedupe_key(&self) -> String {
        match self {
            JobPayload::Pipeline(job) => format!("pipeline:{}:{}", job.run_id, job.stage),
            JobPayload::Scan(job) => format!(
                "scan:{}:{}:{}:{}",
                job.run_id, job.stage, job.scanner, job.target
            ),
            JobPayload::VerifyAsset(job) => format!("verify_asset:{}", job.asset_id),
            JobPayload::VerifyService(job) => format!("verify_service:{}", job.service_id),
        }
    }
}

/// Envelope stored in the `jobs` table.
#[derive(Clone, Debug)]
pub struct JobRecord {
    pub id: JobId,
    pub target_id: TargetId,
    pub run_id: Option<RunId>,
    pub kind: JobKind,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub priority: i32,
    pub attempts: i32,
    pub max_attempts: i32,
    pub available_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub dedupe_key: String,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// High-level enqueue request used by producers.
#[derive(Clone, Debug)]
pub struct EnqueueRequest {
    pub target_id: TargetId,
    pub payload: JobPayload,
    pub priority: i32,
    pub max_attempts: Option<i32>,
    pub available_at: Option<DateTime<Utc>>,
}

impl EnqueueRequest {
    pub fn new(target_id: TargetId, payload: JobPayload, priority: i32) -> Self {
        Self {
            target_id,
            payload,
            priority,
            max_attempts: None,
            available_at: None,
        }
    }
}

/// Returned to callers after enqueue: either a fresh row or a merge into an
/// existing active job with the same dedupe key.
#[derive(Clone, Copy, Debug)]
pub struct JobHandle {
    pub job_id: JobId,
    pub accepted: bool,
}

impl JobHandle {
    pub fn accepted(job_id: JobId) -> Self {
        Self {
            job_id,
            accepted: true,
        }
    }

    pub fn merged(existing: JobId) -> Self {
        Self {
            job_id: existing,
            accepted: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_kind_string_round_trip() {
        for kind in [
            JobKind::Pipeline,
            JobKind::Scanner(ScannerKind::Subfinder),
            JobKind::Scanner(ScannerKind::DnsResolve),
            JobKind::Scanner(ScannerKind::Nuclei),
            JobKind::VerifyAsset,
            JobKind::VerifyService,
        ] {
            assert_eq!(JobKind::parse(&kind.as_string()).unwrap(), kind);
        }
        assert!(JobKind::parse("scanner:unknown").is_err());
    }

    #[test]
    fn payload_json_round_trip() {
        let payload = JobPayload::Scan(ScanJob {
            run_id: RunId::new(),
            stage: PipelineStage::Nmap,
            scanner: ScannerKind::Nmap,
            target: "198.51.100.7".to_string(),
            targets: Vec::new(),
            config: PipelineConfig::default(),
        });
        let json = serde_json::to_value(&payload).unwrap();
        let back: JobPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), payload.kind());
        assert_eq!(back.dedupe_key(), payload.dedupe_key());
    }

    #[test]
    fn dedupe_key_distinguishes_stage_and_target() {
        let run = RunId::new();
        let base = ScanJob {
            run_id: run,
            stage: PipelineStage::Nmap,
            scanner: ScannerKind::Nmap,
            target: "198.51.100.7".to_string(),
            targets: Vec::new(),
            config: PipelineConfig::default(),
        };
        let mut other = base.clone();
        other.target = "198.51.100.8".to_string();
        assert_ne!(
            JobPayload::Scan(base).dedupe_key(),
            JobPayload::Scan(other).dedupe_key()
        );
    }
}
