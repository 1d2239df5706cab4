//! In-process publish/subscribe bus for engine lifecycle events.
//!
//! Subscribers receive events in publication order; each subscriber has a
//! bounded queue and a slow subscriber drops the oldest events (surfaced as a
//! `Lagged` count on its receiver). Terminal transitions additionally persist
//! `run_events` audit rows via [`crate::audit`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{ArtifactStatus, RunStatus, Severity};
use crate::types::{AssetId, FindingId, RunId, ScanId, ServiceId, TargetId};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    RunStarted {
        run_id: RunId,
        target_id: TargetId,
    },
    RunCompleted {
        run_id: RunId,
        target_id: TargetId,
        status: RunStatus,
    },
    ScanStarted {
        scan_id: ScanId,
        run_id: Option<RunId>,
        scanner: String,
        target: String,
    },
    /// One redacted line of raw scanner output.
    ScanLine {
        scan_id: ScanId,
        line: String,
    },
    ScanCompleted {
        scan_id: ScanId,
        run_id: Option<RunId>,
        scanner: String,
        status: String,
    },
    FindingDiscovered {
        finding_id: FindingId,
        scan_id: Option<ScanId>,
        severity: Severity,
        title: String,
    },
    AssetStateChanged {
        target_id: TargetId,
        asset_id: Option<AssetId>,
        service_id: Option<ServiceId>,
        status: ArtifactStatus,
        reason: Option<String>,
    },
}

pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
    capacity: usize,
    dropped: AtomicU64,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish()
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(16));
        Self {
            sender,
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Publish is best effort: with no subscribers the event is counted and
    /// dropped rather than treated as an error.
    pub fn publish(&self, event: EngineEvent) {
        if self.sender.send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_publication_order() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        for i in 0..3u32 {
            bus.publish(EngineEvent::ScanLine {
                scan_id: ScanId::new(),
                line: format!("line-{i}"),
            });
        }
        for i in 0..3u32 {
            match rx.recv().await.unwrap() {
                EngineEvent::ScanLine { line, .. } => assert_eq!(line, format!("line-{i}")),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_counts_drops() {
        let bus = EventBus::new(16);
        bus.publish(EngineEvent::RunStarted {
            run_id: RunId::new(),
            target_id: TargetId::new(),
        });
        assert_eq!(bus.dropped(), 1);
    }
}
