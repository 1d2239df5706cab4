//! vigil-core: an autonomous reconnaissance and attack-surface monitoring
//! engine. A Postgres-backed job queue and worker pool drive a staged recon
//! pipeline; scanner output is ingested into an inventory with first/last
//! seen provenance, diffed between runs, and re-verified before anything is
//! declared gone.

pub mod api_types;
pub mod audit;
pub mod changes;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod model;
pub mod normalize;
pub mod orchestration;
pub mod pipeline;
pub mod probe;
pub mod resolve;
pub mod retention;
pub mod runtime;
pub mod scanner;
pub mod schedule;
pub mod scope;
pub mod types;
pub mod verify;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use runtime::EngineRuntime;
