//! Postgres access layer: pool construction, embedded migrations and the
//! per-entity repositories.

pub mod findings;
pub mod inventory;
pub mod runs;
pub mod scans;
pub mod schedules;
pub mod targets;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::error::{EngineError, Result};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub async fn connect(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(16)
        .connect(database_url)
        .await
        .map_err(|e| EngineError::DependencyUnreachable(format!("postgres: {e}")))?;
    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> Result<()> {
    MIGRATOR
        .run(pool)
        .await
        .map_err(|e| EngineError::Internal(format!("migration failed: {e}")))?;
    Ok(())
}

pub use findings::FindingRepo;
pub use inventory::InventoryRepo;
pub use runs::RunRepo;
pub use scans::ScanRepo;
pub use schedules::ScheduleRepo;
pub use targets::TargetRepo;
