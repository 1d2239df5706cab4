//! Wires the engine together inside one process: queue, dispatcher, worker
//! pool, scheduler, janitor and retention sweeper. All coordination between
//! them goes through Postgres rows and the event bus, never shared memory.

use std::sync::Arc;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::audit::AuditLog;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::events::EventBus;
use crate::orchestration::{EngineDispatcher, PostgresJobQueue, WorkerPool};
use crate::pipeline::PipelineOrchestrator;
use crate::resolve::DnsResolver;
use crate::retention::RetentionSweeper;
use crate::schedule::Scheduler;
use crate::verify::Verifier;

pub struct EngineRuntime {
    pub queue: Arc<PostgresJobQueue>,
    pub events: Arc<EventBus>,
    shutdown: CancellationToken,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl EngineRuntime {
    /// Build and start every engine component. The returned runtime owns the
    /// task handles; `shutdown` drains them.
    pub async fn start(pool: PgPool, config: EngineConfig) -> Result<Self> {
        let shutdown = CancellationToken::new();
        let events = Arc::new(EventBus::new(config.event_capacity));
        let queue = Arc::new(PostgresJobQueue::new(
            pool.clone(),
            config.limits,
            config.lease,
            config.retry,
        ));

        let resolver = DnsResolver::system()?;
        let queue_handle: Arc<dyn crate::orchestration::JobQueue> = queue.clone();
        let orchestrator = PipelineOrchestrator::new(
            pool.clone(),
            config.clone(),
            queue_handle,
            Arc::clone(&events),
            resolver,
        );
        let verifier = Verifier::new(pool.clone(), Arc::clone(&events))?;
        let dispatcher = Arc::new(EngineDispatcher::new(orchestrator, verifier));

        let workers = WorkerPool::new(
            Arc::clone(&queue),
            dispatcher,
            AuditLog::new(pool.clone()),
            config.lease,
            config.worker_count,
            shutdown.clone(),
        );
        let mut handles = workers.start();

        handles.push(
            Scheduler::new(
                pool.clone(),
                config.scheduler_tick_secs,
                config.retry.max_attempts,
                shutdown.clone(),
            )
            .spawn(),
        );
        handles.push(
            RetentionSweeper::new(pool.clone(), config.retention, shutdown.clone()).spawn(),
        );

        tracing::info!(
            workers = config.worker_count,
            tick = config.scheduler_tick_secs,
            "engine runtime started"
        );

        Ok(Self {
            queue,
            events,
            shutdown,
            handles,
        })
    }

    /// Cooperative shutdown: signal every task and wait for it to finish its
    /// current job.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
        tracing::info!("engine runtime stopped");
    }
}
