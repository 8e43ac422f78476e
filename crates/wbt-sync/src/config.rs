use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono_tz::Tz;
use wbt_adapters::{GoogleCredentials, WB_API_BASE_URL};
use wbt_core::DEFAULT_RETENTION_DAYS;
use wbt_storage::PoolSettings;

pub const DEFAULT_SYNC_CRON: &str = "0 * * * *";
pub const CLEANUP_CRON: &str = "0 3 * * *";
pub const DEFAULT_TIMEZONE: &str = "Europe/Moscow";

/// Process configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub app_env: String,
    pub database: PoolSettings,
    pub wb_api_token: Option<String>,
    pub wb_api_base_url: String,
    pub http_timeout: Duration,
    pub google_credentials: GoogleCredentials,
    pub spreadsheet_ids: Vec<String>,
    pub sheets_requests_per_minute: Option<u32>,
    pub sync_cron: String,
    pub timezone: Tz,
    pub retention_days: u32,
    pub scheduler_enabled: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self> {
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let or = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());

        let database_url = match var("DATABASE_URL") {
            Some(url) => url,
            None => format!(
                "postgres://{}:{}@{}:{}/{}",
                or("POSTGRES_USER", "postgres"),
                or("POSTGRES_PASSWORD", "postgres"),
                or("POSTGRES_HOST", "localhost"),
                parse_number::<u16>(&var, "POSTGRES_PORT")?.unwrap_or(5432),
                or("POSTGRES_DB", "postgres"),
            ),
        };
        let defaults = PoolSettings::default();
        let database = PoolSettings {
            database_url,
            min_connections: parse_number(&var, "POSTGRES_POOL_MIN")?.unwrap_or(defaults.min_connections),
            max_connections: parse_number(&var, "POSTGRES_POOL_MAX")?.unwrap_or(defaults.max_connections),
            ..defaults
        };

        let timezone_name = or("TARIFF_TIMEZONE", DEFAULT_TIMEZONE);
        let timezone = timezone_name
            .parse::<Tz>()
            .map_err(|err| anyhow!("TARIFF_TIMEZONE={timezone_name}: {err}"))?;

        let scheduler_enabled = match var("SCHEDULER_ENABLED") {
            None => true,
            Some(v) => parse_flag(&v).with_context(|| format!("SCHEDULER_ENABLED={v}"))?,
        };

        let spreadsheet_ids = var("GOOGLE_SHEETS_IDS")
            .map(|ids| {
                ids.split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            app_env: or("APP_ENV", "development"),
            database,
            wb_api_token: var("WB_API_TOKEN"),
            wb_api_base_url: or("WB_API_BASE_URL", WB_API_BASE_URL),
            http_timeout: Duration::from_secs(parse_number(&var, "WB_HTTP_TIMEOUT_SECS")?.unwrap_or(30)),
            google_credentials: GoogleCredentials::from_parts(
                &var("GOOGLE_SERVICE_ACCOUNT_EMAIL").unwrap_or_default(),
                &var("GOOGLE_PRIVATE_KEY").unwrap_or_default(),
                &var("GOOGLE_ACCESS_TOKEN").unwrap_or_default(),
            ),
            spreadsheet_ids,
            sheets_requests_per_minute: parse_number(&var, "SHEETS_REQUESTS_PER_MINUTE")?,
            sync_cron: or("SYNC_CRON_SCHEDULE", DEFAULT_SYNC_CRON),
            timezone,
            retention_days: parse_number(&var, "TARIFF_RETENTION_DAYS")?.unwrap_or(DEFAULT_RETENTION_DAYS),
            scheduler_enabled,
        })
    }

    /// Non-fatal misconfigurations to surface at startup.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.wb_api_token.is_none() {
            warnings.push("WB_API_TOKEN is not set; tariff requests will be rejected upstream".to_string());
        }
        if self.spreadsheet_ids.is_empty() {
            warnings.push("GOOGLE_SHEETS_IDS is empty; tariffs will not be published".to_string());
        } else if !self.google_credentials.is_configured() {
            warnings.push("Google credentials are not configured; publishing will fail".to_string());
        }
        warnings
    }
}

fn parse_number<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(key)
        .map(|v| v.parse::<T>().with_context(|| format!("{key}={v} is not a valid number")))
        .transpose()
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("expected a boolean, got {other:?}")),
    }
}
