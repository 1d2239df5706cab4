use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vigil_core::events::EngineEvent;
use vigil_core::{db, EngineConfig, EngineRuntime};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vigil_core=info,vigil_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::from_env();
    info!(
        workers = config.worker_count,
        global_cap = config.limits.max_concurrent_jobs_global,
        per_target_cap = config.limits.max_concurrent_jobs_per_target,
        "starting vigil"
    );

    let pool = db::connect(&config.database_url).await?;
    db::migrate(&pool).await?;

    let runtime = EngineRuntime::start(pool, config).await?;

    // Surface high-signal lifecycle events in the daemon log.
    let mut events = runtime.events.subscribe();
    let log_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(EngineEvent::RunStarted { run_id, target_id }) => {
                    info!(%run_id, %target_id, "run started");
                }
                Ok(EngineEvent::RunCompleted {
                    run_id, status, ..
                }) => {
                    info!(%run_id, status = status.as_str(), "run finished");
                }
                Ok(EngineEvent::FindingDiscovered {
                    severity, title, ..
                }) => {
                    info!(severity = severity.as_str(), %title, "finding");
                }
                Ok(EngineEvent::AssetStateChanged { status, reason, .. }) => {
                    info!(status = status.as_str(), ?reason, "artifact state changed");
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event log subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    runtime.shutdown().await;
    log_task.abort();
    Ok(())
}
