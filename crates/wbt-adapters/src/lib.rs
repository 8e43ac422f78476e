//! Upstream tariff source and spreadsheet publishing adapters.

mod sheets;
mod wb;

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;
use wbt_core::TariffDraft;

pub use sheets::{
    GoogleCredentials, GoogleSheetsClient, PublishClient, SheetSnapshot, SpreadsheetClient,
    GOOGLE_SHEETS_API_URL, GOOGLE_TOKEN_URL, SHEET_HEADERS, SHEET_NAME,
};
pub use wb::{parse_tariff_envelope, WbTariffsClient, WB_API_BASE_URL};

pub const CRATE_NAME: &str = "wbt-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("tariffs API request failed: {message}")]
    Unavailable { status: Option<u16>, message: String },
    #[error("invalid response structure from tariffs API: {0}")]
    MalformedEnvelope(String),
}

impl SourceError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Unavailable { status, .. } => *status,
            Self::MalformedEnvelope(_) => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    /// Shared client initialization failed; no target was attempted.
    #[error("spreadsheet publishing unavailable: {0}")]
    Unavailable(String),
    #[error("failed to update spreadsheet {spreadsheet_id}: {message}")]
    Target {
        spreadsheet_id: String,
        message: String,
    },
}

/// Supplier of one day's warehouse tariffs.
#[async_trait]
pub trait TariffSource: Send + Sync {
    /// An empty list means "no tariffs for that date" and is not an error.
    async fn fetch_tariffs(&self, tariff_date: NaiveDate) -> Result<Vec<TariffDraft>, SourceError>;
}
