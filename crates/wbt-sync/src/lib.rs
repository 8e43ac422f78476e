//! Configuration, sync orchestration, scheduling and daemon lifecycle.

mod app;
mod config;
mod orchestrator;
mod scheduler;

pub use app::{run_daemon, App};
pub use config::{AppConfig, CLEANUP_CRON, DEFAULT_SYNC_CRON, DEFAULT_TIMEZONE};
pub use orchestrator::SyncOrchestrator;
pub use scheduler::{JobStatus, ScheduleSettings, TariffScheduler, CLEANUP_JOB, SYNC_JOB};

pub const CRATE_NAME: &str = "wbt-sync";
