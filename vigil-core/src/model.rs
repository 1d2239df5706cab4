//! Domain records and the string mappings used at the database boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::scope::ScopePolicy;
use crate::types::{
    AssetId, EdgeId, FindingId, RunId, ScanId, ScheduleId, ServiceId, TargetId,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Manual,
    Scheduled,
    Verification,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTrigger::Manual => "manual",
            RunTrigger::Scheduled => "scheduled",
            RunTrigger::Verification => "verification",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "manual" => Ok(RunTrigger::Manual),
            "scheduled" => Ok(RunTrigger::Scheduled),
            "verification" => Ok(RunTrigger::Verification),
            other => Err(EngineError::Internal(format!("unknown run trigger {other:?}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Discarded,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Discarded => "discarded",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "queued" => Ok(RunStatus::Queued),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            "discarded" => Ok(RunStatus::Discarded),
            other => Err(EngineError::Internal(format!("unknown run status {other:?}"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Queued | RunStatus::Running)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Active,
    Stale,
    Closed,
    Unresolved,
}

impl ArtifactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactStatus::Active => "active",
            ArtifactStatus::Stale => "stale",
            ArtifactStatus::Closed => "closed",
            ArtifactStatus::Unresolved => "unresolved",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "active" => Ok(ArtifactStatus::Active),
            "stale" => Ok(ArtifactStatus::Stale),
            "closed" => Ok(ArtifactStatus::Closed),
            "unresolved" => Ok(ArtifactStatus::Unresolved),
            other => Err(EngineError::Internal(format!(
                "unknown artifact status {other:?}"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Subdomain,
    Host,
    Ip,
    Url,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Subdomain => "subdomain",
            AssetKind::Host => "host",
            AssetKind::Ip => "ip",
            AssetKind::Url => "url",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "subdomain" => Ok(AssetKind::Subdomain),
            "host" => Ok(AssetKind::Host),
            "ip" => Ok(AssetKind::Ip),
            "url" => Ok(AssetKind::Url),
            other => Err(EngineError::Internal(format!("unknown asset kind {other:?}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Proto {
    Tcp,
    Udp,
}

impl Proto {
    pub fn as_str(&self) -> &'static str {
        match self {
            Proto::Tcp => "tcp",
            Proto::Udp => "udp",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "tcp" => Ok(Proto::Tcp),
            "udp" => Ok(Proto::Udp),
            other => Err(EngineError::Internal(format!("unknown proto {other:?}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelType {
    ResolvesTo,
    Serves,
    RedirectsTo,
    Cname,
    Alias,
}

impl RelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelType::ResolvesTo => "resolves_to",
            RelType::Serves => "serves",
            RelType::RedirectsTo => "redirects_to",
            RelType::Cname => "cname",
            RelType::Alias => "alias",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "resolves_to" => Ok(RelType::ResolvesTo),
            "serves" => Ok(RelType::Serves),
            "redirects_to" => Ok(RelType::RedirectsTo),
            "cname" => Ok(RelType::Cname),
            "alias" => Ok(RelType::Alias),
            other => Err(EngineError::Internal(format!("unknown rel type {other:?}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Info => "info",
        }
    }

    /// Unknown severities map to info rather than failing the parse; scanner
    /// vocabularies drift.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "medium" => Severity::Medium,
            "low" => Severity::Low,
            _ => Severity::Info,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TargetRecord {
    pub id: TargetId,
    pub name: String,
    pub root_domain: String,
    pub scope: ScopePolicy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Pipeline limits snapshotted onto each run.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "PipelineConfig::default_max_hosts")]
    pub max_hosts: usize,
    #[serde(default = "PipelineConfig::default_max_http_targets")]
    pub max_http_targets: usize,
}

impl PipelineConfig {
    const fn default_max_hosts() -> usize {
        50
    }

    const fn default_max_http_targets() -> usize {
        200
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_hosts: Self::default_max_hosts(),
            max_http_targets: Self::default_max_http_targets(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunRecord {
    pub id: RunId,
    pub target_id: TargetId,
    pub trigger: RunTrigger,
    pub status: RunStatus,
    pub config: PipelineConfig,
    pub failure_summary: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct ScanRecord {
    pub id: ScanId,
    pub target_id: TargetId,
    pub run_id: Option<RunId>,
    pub scanner: String,
    pub target: String,
    pub status: String,
    pub config: Option<Value>,
    pub raw_output: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug)]
pub struct AssetRecord {
    pub id: AssetId,
    pub target_id: TargetId,
    pub kind: AssetKind,
    pub value: String,
    pub normalized: String,
    pub status: ArtifactStatus,
    pub status_reason: Option<String>,
    pub first_seen_run_id: Option<RunId>,
    pub last_seen_run_id: Option<RunId>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug)]
pub struct ServiceRecord {
    pub id: ServiceId,
    pub target_id: TargetId,
    pub asset_id: AssetId,
    pub port: u16,
    pub proto: Proto,
    pub name: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
    pub status: ArtifactStatus,
    pub status_reason: Option<String>,
    pub first_seen_run_id: Option<RunId>,
    pub last_seen_run_id: Option<RunId>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug)]
pub struct EdgeRecord {
    pub id: EdgeId,
    pub target_id: TargetId,
    pub from_asset_id: AssetId,
    pub to_asset_id: AssetId,
    pub rel_type: RelType,
    pub first_seen_run_id: Option<RunId>,
    pub last_seen_run_id: Option<RunId>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct ScheduleRecord {
    pub id: ScheduleId,
    pub target_id: TargetId,
    pub enabled: bool,
    pub interval_seconds: i64,
    pub pipeline_config: PipelineConfig,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Scanner output artifacts. These are the normalized, pre-ingestion shape of
// everything a scan can observe.
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AssetArtifact {
    pub kind: AssetKind,
    pub value: String,
    pub normalized: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceArtifact {
    pub host: AssetArtifact,
    pub port: u16,
    pub proto: Proto,
    pub name: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EdgeArtifact {
    pub from: AssetArtifact,
    pub to: AssetArtifact,
    pub rel_type: RelType,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FindingArtifact {
    pub severity: Option<Severity>,
    pub title: String,
    pub description: String,
    pub impact: String,
    pub evidence: String,
    pub remediation: String,
    pub remediation_example: String,
    pub url: String,
    pub cve: String,
    pub cvss_score: f64,
}

impl FindingArtifact {
    pub fn severity(&self) -> Severity {
        self.severity.unwrap_or(Severity::Info)
    }
}

/// Everything one scan produced, ready for ingestion.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ScanOutput {
    pub assets: Vec<AssetArtifact>,
    pub services: Vec<ServiceArtifact>,
    pub edges: Vec<EdgeArtifact>,
    pub findings: Vec<FindingArtifact>,
    /// Non-fatal notes (partial parses, non-zero exits with usable output).
    pub warnings: Vec<String>,
}

impl ScanOutput {
    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
            && self.services.is_empty()
            && self.edges.is_empty()
            && self.findings.is_empty()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct FindingRow {
    pub id: FindingId,
    pub severity: Severity,
    pub title: String,
    pub url: String,
}
