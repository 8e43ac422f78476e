use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use wbt_adapters::{GoogleSheetsClient, PublishClient, WbTariffsClient};
use wbt_core::TariffCalendar;
use wbt_storage::{HttpClientConfig, HttpFetcher, PacingConfig, PgTariffStore};

use crate::config::AppConfig;
use crate::orchestrator::SyncOrchestrator;
use crate::scheduler::{ScheduleSettings, TariffScheduler};

const USER_AGENT: &str = concat!("wbt-sync/", env!("CARGO_PKG_VERSION"));
const SHEETS_MAX_IN_FLIGHT: usize = 4;

/// Fully wired process: pool, clients and orchestrator built from one config.
pub struct App {
    config: AppConfig,
    store: Arc<PgTariffStore>,
    source: Arc<WbTariffsClient>,
    orchestrator: Arc<SyncOrchestrator>,
}

impl App {
    pub async fn connect(config: AppConfig) -> Result<Self> {
        let store = Arc::new(
            PgTariffStore::connect(&config.database)
                .await
                .context("connecting to postgres")?,
        );
        info!(
            min = config.database.min_connections,
            max = config.database.max_connections,
            "database pool ready"
        );

        let wb_http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: Some(USER_AGENT.to_string()),
            ..Default::default()
        })?;
        let source = Arc::new(WbTariffsClient::new(
            Arc::new(wb_http),
            config.wb_api_base_url.clone(),
            config.wb_api_token.clone(),
        ));

        let sheets_http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(60),
            user_agent: Some(USER_AGENT.to_string()),
            max_in_flight: SHEETS_MAX_IN_FLIGHT,
            pacing: config.sheets_requests_per_minute.map(PacingConfig::per_minute),
            ..Default::default()
        })?;
        let sheets = GoogleSheetsClient::new(Arc::new(sheets_http), config.google_credentials.clone());

        let orchestrator = Arc::new(SyncOrchestrator::new(
            source.clone(),
            store.clone(),
            PublishClient::new(Arc::new(sheets)),
            config.spreadsheet_ids.clone(),
            TariffCalendar::new(config.timezone),
        ));

        Ok(Self {
            config,
            store,
            source,
            orchestrator,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &PgTariffStore {
        &self.store
    }

    pub fn source(&self) -> &WbTariffsClient {
        &self.source
    }

    pub fn orchestrator(&self) -> Arc<SyncOrchestrator> {
        self.orchestrator.clone()
    }

    pub fn schedule_settings(&self) -> ScheduleSettings {
        ScheduleSettings {
            sync_cron: self.config.sync_cron.clone(),
            timezone: self.config.timezone,
            retention_days: self.config.retention_days,
        }
    }

    pub async fn close(&self) {
        self.store.close().await;
        info!("database pool closed");
    }
}

fn log_startup(config: &AppConfig) {
    info!(
        env = %config.app_env,
        timezone = %config.timezone,
        sync_cron = %config.sync_cron,
        retention_days = config.retention_days,
        spreadsheets = config.spreadsheet_ids.len(),
        scheduler = config.scheduler_enabled,
        "starting warehouse tariff sync"
    );
    for warning in config.warnings() {
        warn!("{warning}");
    }
}

/// Run until SIGINT/SIGTERM/SIGQUIT: migrate, sync once, then follow the schedule.
///
/// Migration failure aborts startup; a failed initial sync is only logged.
pub async fn run_daemon(config: AppConfig) -> Result<()> {
    log_startup(&config);
    let app = App::connect(config).await?;

    if let Err(err) = app.store().migrate().await {
        error!(error = %err, "database migration failed");
        app.close().await;
        return Err(err).context("running database migrations");
    }

    let initial = app.orchestrator().full_sync(None).await;
    if initial.wb_sync.success && initial.sheets_sync.success {
        info!(stored = initial.wb_sync.count, updated = initial.sheets_sync.updated, "initial sync complete");
    } else {
        warn!(?initial, "initial sync finished with errors; continuing startup");
    }

    let mut scheduler = if app.config().scheduler_enabled {
        let mut scheduler = TariffScheduler::new(app.orchestrator(), &app.schedule_settings()).await?;
        scheduler.start().await?;
        Some(scheduler)
    } else {
        info!("scheduler disabled; waiting for shutdown signal");
        None
    };

    let signal = wait_for_shutdown_signal().await?;
    info!(signal, "shutdown requested");
    tokio::spawn(async {
        if let Ok(signal) = wait_for_shutdown_signal().await {
            warn!(signal, "second signal received; forcing exit");
            std::process::exit(1);
        }
    });

    if let Some(scheduler) = scheduler.as_mut() {
        if let Err(err) = scheduler.shutdown().await {
            error!(error = %err, "scheduler did not stop cleanly");
        }
    }
    app.close().await;
    info!("shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut quit = signal(SignalKind::quit()).context("installing SIGQUIT handler")?;
    let name = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = quit.recv() => "SIGQUIT",
    };
    Ok(name)
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c().await.context("installing Ctrl-C handler")?;
    Ok("ctrl-c")
}
