//! Core domain model for warehouse box tariffs: amounts, tariff dates and sync outcomes.

use std::str::FromStr;

use chrono::{DateTime, Days, NaiveDate, Utc};
use chrono_tz::Tz;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "wbt-core";

/// Retention window applied by the cleanup job when nothing else is configured.
pub const DEFAULT_RETENTION_DAYS: u32 = 90;

/// Fractional digits kept for every monetary amount.
pub const AMOUNT_SCALE: u32 = 2;

/// Upstream monetary value before normalization.
///
/// The tariffs API mixes JSON numbers with comma-decimal strings (`"11,2"`) and
/// occasionally sends `null` or placeholders such as `"-"`. Any other JSON value
/// lands in `Other` and normalizes to zero.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawAmount {
    Number(f64),
    Text(String),
    #[default]
    Missing,
    Other(serde_json::Value),
}

impl From<f64> for RawAmount {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RawAmount {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Normalize an upstream amount into a 2-digit fixed-point decimal.
///
/// Comma decimals become dot decimals, whitespace (including thousands
/// separators) is dropped, and anything that still does not parse is zero.
pub fn normalize_amount(raw: &RawAmount) -> Decimal {
    let value = match raw {
        RawAmount::Number(n) => Decimal::from_f64(*n).unwrap_or(Decimal::ZERO),
        RawAmount::Text(text) => parse_amount_text(text),
        RawAmount::Missing | RawAmount::Other(_) => Decimal::ZERO,
    };
    value.round_dp_with_strategy(AMOUNT_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

fn parse_amount_text(text: &str) -> Decimal {
    let cleaned = text
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == ',' { '.' } else { c })
        .collect::<String>();
    if cleaned.is_empty() {
        return Decimal::ZERO;
    }
    Decimal::from_str(&cleaned)
        .or_else(|_| Decimal::from_scientific(&cleaned))
        .unwrap_or(Decimal::ZERO)
}

/// One warehouse entry as delivered by the tariffs API.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TariffDraft {
    pub warehouse_name: String,
    pub delivery_and_storage_expr: Option<String>,
    pub delivery_base: RawAmount,
    pub delivery_per_liter: RawAmount,
    pub storage_base: RawAmount,
    pub storage_per_liter: RawAmount,
}

impl TariffDraft {
    pub fn normalize(&self, tariff_date: NaiveDate) -> NormalizedTariff {
        NormalizedTariff {
            tariff_date,
            warehouse_name: self.warehouse_name.clone(),
            delivery_and_storage_expr: self.delivery_and_storage_expr.clone().unwrap_or_default(),
            delivery_base: normalize_amount(&self.delivery_base),
            delivery_per_liter: normalize_amount(&self.delivery_per_liter),
            storage_base: normalize_amount(&self.storage_base),
            storage_per_liter: normalize_amount(&self.storage_per_liter),
        }
    }
}

/// Storage-ready tariff values keyed by (tariff_date, warehouse_name).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedTariff {
    pub tariff_date: NaiveDate,
    pub warehouse_name: String,
    pub delivery_and_storage_expr: String,
    pub delivery_base: Decimal,
    pub delivery_per_liter: Decimal,
    pub storage_base: Decimal,
    pub storage_per_liter: Decimal,
}

/// Persisted tariff row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TariffRecord {
    pub tariff_date: NaiveDate,
    pub warehouse_name: String,
    pub delivery_and_storage_expr: String,
    pub delivery_base: Decimal,
    pub delivery_per_liter: Decimal,
    pub storage_base: Decimal,
    pub storage_per_liter: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TariffRecord {
    /// Sum of the four cost components; only used to order published rows.
    pub fn coefficient(&self) -> Decimal {
        self.delivery_base + self.delivery_per_liter + self.storage_base + self.storage_per_liter
    }
}

/// Maps instants onto tariff days in the deployment timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TariffCalendar {
    tz: Tz,
}

impl Default for TariffCalendar {
    fn default() -> Self {
        Self::new(chrono_tz::Europe::Moscow)
    }
}

impl TariffCalendar {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    /// Truncate an instant to its calendar day in the deployment timezone.
    pub fn tariff_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.tz).date_naive()
    }

    pub fn today(&self) -> NaiveDate {
        self.tariff_date(Utc::now())
    }

    pub fn retention_cutoff(&self, retention_days: u32) -> NaiveDate {
        retention_cutoff(self.today(), retention_days)
    }
}

/// First day that survives a cleanup: rows dated strictly before it are removed.
pub fn retention_cutoff(today: NaiveDate, retention_days: u32) -> NaiveDate {
    today
        .checked_sub_days(Days::new(u64::from(retention_days)))
        .unwrap_or(NaiveDate::MIN)
}

/// Canonical `YYYY-MM-DD` rendering of a tariff date.
pub fn day_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn parse_day_key(text: &str) -> Result<NaiveDate, chrono::ParseError> {
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
}

/// Result of pulling one day of tariffs from the API into the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceSyncOutcome {
    pub success: bool,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SourceSyncOutcome {
    pub fn synced(count: usize) -> Self {
        Self {
            success: true,
            count,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            count: 0,
            error: Some(error.into()),
        }
    }
}

/// A publish error; `spreadsheet_id` is `None` when no single target is to blame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishFailure {
    pub spreadsheet_id: Option<String>,
    pub error: String,
}

/// Per-target tally of one publish pass.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct PublishReport {
    pub success_count: usize,
    pub failed_count: usize,
    pub errors: Vec<PublishFailure>,
}

impl PublishReport {
    pub fn record_success(&mut self) {
        self.success_count += 1;
    }

    pub fn record_failure(&mut self, spreadsheet_id: impl Into<String>, error: impl Into<String>) {
        self.failed_count += 1;
        self.errors.push(PublishFailure {
            spreadsheet_id: Some(spreadsheet_id.into()),
            error: error.into(),
        });
    }
}

/// Result of republishing a stored day to the spreadsheets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SheetsSyncOutcome {
    pub success: bool,
    pub updated: usize,
    pub errors: Vec<PublishFailure>,
}

impl SheetsSyncOutcome {
    /// Nothing to publish; skipping counts as success.
    pub fn skipped() -> Self {
        Self {
            success: true,
            updated: 0,
            errors: Vec::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            updated: 0,
            errors: vec![PublishFailure {
                spreadsheet_id: None,
                error: error.into(),
            }],
        }
    }
}

impl From<PublishReport> for SheetsSyncOutcome {
    fn from(report: PublishReport) -> Self {
        Self {
            success: report.failed_count == 0,
            updated: report.success_count,
            errors: report.errors,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FullSyncOutcome {
    pub tariff_date: NaiveDate,
    pub wb_sync: SourceSyncOutcome,
    pub sheets_sync: SheetsSyncOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupOutcome {
    pub success: bool,
    pub deleted_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
