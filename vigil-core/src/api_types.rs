//! Wire contract for the external HTTP/WebSocket surface.
//!
//! The engine does not serve HTTP itself; these types define the request and
//! response shapes an API layer exposes on top of it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::changes::ChangeSummary;
use crate::events::EngineEvent;
use crate::model::{ArtifactStatus, AssetKind, PipelineConfig, Proto, RelType, RunStatus, RunTrigger, Severity};
use crate::scope::ScopePolicy;
use crate::types::{AssetId, EdgeId, JobId, RunId, ScanId, ScheduleId, ServiceId, TargetId};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateTargetRequest {
    pub name: String,
    pub root_domain: String,
    #[serde(default)]
    pub scope: Option<ScopePolicy>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TargetResponse {
    pub id: TargetId,
    pub name: String,
    pub root_domain: String,
    pub scope: ScopePolicy,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StartPipelineRequest {
    #[serde(default)]
    pub max_hosts: Option<usize>,
    #[serde(default)]
    pub max_http_targets: Option<usize>,
}

impl StartPipelineRequest {
    pub fn into_config(self) -> PipelineConfig {
        let defaults = PipelineConfig::default();
        PipelineConfig {
            max_hosts: self.max_hosts.unwrap_or(defaults.max_hosts),
            max_http_targets: self.max_http_targets.unwrap_or(defaults.max_http_targets),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StartPipelineResponse {
    pub run_id: RunId,
    pub job_id: JobId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: RunId,
    pub target_id: TargetId,
    pub trigger: RunTrigger,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_summary: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiscardRunResponse {
    pub run_id: RunId,
    pub discarded: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VerifySweepResponse {
    pub run_id: RunId,
    pub enqueued_jobs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateScheduleRequest {
    pub interval_seconds: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub pipeline_config: Option<PipelineConfig>,
    #[serde(default)]
    pub start_immediately: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduleResponse {
    pub id: ScheduleId,
    pub target_id: TargetId,
    pub enabled: bool,
    pub interval_seconds: i64,
    pub next_run_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangesResponse {
    pub run_id: RunId,
    pub summary: ChangeSummary,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssetSummary {
    pub id: AssetId,
    pub kind: AssetKind,
    pub normalized: String,
    pub status: ArtifactStatus,
    pub status_reason: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceSummary {
    pub id: ServiceId,
    pub asset_id: AssetId,
    pub port: u16,
    pub proto: Proto,
    pub name: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
    pub status: ArtifactStatus,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EdgeSummary {
    pub id: EdgeId,
    pub from_asset_id: AssetId,
    pub to_asset_id: AssetId,
    pub rel_type: RelType,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanSummary {
    pub id: ScanId,
    pub run_id: Option<RunId>,
    pub scanner: String,
    pub target: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindingSummary {
    pub severity: Severity,
    pub title: String,
    pub url: String,
    pub cve: String,
}

/// One WebSocket frame: the engine event plus its delivery sequence number
/// on this subscription (gaps mean the subscriber lagged and lost events).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WsFrame {
    pub seq: u64,
    #[serde(flatten)]
    pub event: EngineEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_pipeline_request_applies_defaults() {
        let config = StartPipelineRequest::default().into_config();
        assert_eq!(config.max_hosts, 50);
        assert_eq!(config.max_http_targets, 200);

        let config = StartPipelineRequest {
            max_hosts: Some(10),
            max_http_targets: None,
        }
        .into_config();
        assert_eq!(config.max_hosts, 10);
        assert_eq!(config.max_http_targets, 200);
    }

    #[test]
    fn ws_frame_flattens_the_event() {
        let frame = WsFrame {
            seq: 7,
            event: EngineEvent::RunStarted {
                run_id: RunId::new(),
                target_id: TargetId::new(),
            },
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["seq"], 7);
        assert_eq!(value["event"], "run_started");
    }
}
