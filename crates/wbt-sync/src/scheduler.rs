use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::CLEANUP_CRON;
use crate::orchestrator::SyncOrchestrator;

pub const SYNC_JOB: &str = "tariff-sync";
pub const CLEANUP_JOB: &str = "cleanup";

/// Prefix a zero seconds field onto classic five-field expressions.
fn with_seconds(expr: &str) -> String {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleSettings {
    pub sync_cron: String,
    pub timezone: Tz,
    pub retention_days: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub name: &'static str,
    pub schedule: String,
    pub next_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct RegisteredJob {
    id: Uuid,
    name: &'static str,
    schedule: String,
}

/// Cron triggers for the periodic sync and the daily retention cleanup.
pub struct TariffScheduler {
    inner: JobScheduler,
    jobs: Vec<RegisteredJob>,
    running: bool,
}

impl TariffScheduler {
    pub async fn new(orchestrator: Arc<SyncOrchestrator>, settings: &ScheduleSettings) -> Result<Self> {
        let inner = JobScheduler::new().await.context("creating scheduler")?;
        let mut jobs = Vec::with_capacity(2);

        let sync = orchestrator.clone();
        let sync_expr = with_seconds(&settings.sync_cron);
        let job = Job::new_async_tz(sync_expr.as_str(), settings.timezone, move |_uuid, _l| {
            let sync = sync.clone();
            Box::pin(async move {
                info!(job = SYNC_JOB, "scheduled sync triggered");
                let outcome = sync.full_sync(None).await;
                if !outcome.wb_sync.success || !outcome.sheets_sync.success {
                    warn!(job = SYNC_JOB, ?outcome, "scheduled sync finished with errors");
                }
            })
        })
        .with_context(|| format!("creating {SYNC_JOB} job for cron {}", settings.sync_cron))?;
        jobs.push(RegisteredJob {
            id: inner.add(job).await.context("adding sync job")?,
            name: SYNC_JOB,
            schedule: settings.sync_cron.clone(),
        });

        let retention_days = settings.retention_days;
        let cleanup_cron = CLEANUP_CRON.to_string();
        let cleanup = orchestrator;
        let cleanup_expr = with_seconds(&cleanup_cron);
        let job = Job::new_async_tz(cleanup_expr.as_str(), settings.timezone, move |_uuid, _l| {
            let cleanup = cleanup.clone();
            Box::pin(async move {
                info!(job = CLEANUP_JOB, retention_days, "scheduled cleanup triggered");
                let outcome = cleanup.cleanup(retention_days).await;
                if !outcome.success {
                    error!(job = CLEANUP_JOB, error = ?outcome.error, "scheduled cleanup failed");
                }
            })
        })
        .with_context(|| format!("creating {CLEANUP_JOB} job for cron {CLEANUP_CRON}"))?;
        jobs.push(RegisteredJob {
            id: inner.add(job).await.context("adding cleanup job")?,
            name: CLEANUP_JOB,
            schedule: cleanup_cron,
        });

        Ok(Self {
            inner,
            jobs,
            running: false,
        })
    }

    pub async fn start(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }
        self.inner.start().await.context("starting scheduler")?;
        self.running = true;
        for job in self.status().await {
            info!(job = job.name, schedule = %job.schedule, next_run = ?job.next_run, "job scheduled");
        }
        Ok(())
    }

    /// Stop triggering jobs; runs already in flight are not awaited.
    pub async fn shutdown(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        self.inner.shutdown().await.context("stopping scheduler")?;
        self.running = false;
        info!("scheduler stopped");
        Ok(())
    }

    pub async fn status(&mut self) -> Vec<JobStatus> {
        let mut statuses = Vec::with_capacity(self.jobs.len());
        for job in &self.jobs {
            let next_run = self.inner.next_tick_for_job(job.id).await.ok().flatten();
            statuses.push(JobStatus {
                name: job.name,
                schedule: job.schedule.clone(),
                next_run,
            });
        }
        statuses
    }
}
