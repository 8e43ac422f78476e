//! Tariff persistence (Postgres + in-memory) and the shared HTTP transport.

mod http;
mod memory;
mod postgres;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;
use wbt_core::{retention_cutoff, TariffDraft, TariffRecord};

pub use http::{
    FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, PacingConfig, RequestPacer,
    RetryPolicy,
};
pub use memory::MemoryTariffStore;
pub use postgres::{MigrationStatus, PgTariffStore, PoolSettings, MIGRATOR};

pub const CRATE_NAME: &str = "wbt-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Date-scoped tariff persistence keyed by (tariff_date, warehouse_name).
#[async_trait]
pub trait TariffStore: Send + Sync {
    /// Insert or merge every draft for `tariff_date`; returns the number of rows written.
    ///
    /// Amounts are normalized on the way in. Re-running with identical input only
    /// advances `updated_at`. A failing row fails the whole batch.
    async fn upsert(&self, drafts: &[TariffDraft], tariff_date: NaiveDate) -> Result<usize, StoreError>;

    /// All rows for one day, ordered by formula then warehouse name.
    async fn query_by_date(&self, tariff_date: NaiveDate) -> Result<Vec<TariffRecord>, StoreError>;

    /// Rows with `start <= tariff_date <= end`, ordered by date, formula, warehouse.
    async fn query_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<TariffRecord>, StoreError>;

    /// Delete every row dated strictly before `cutoff`.
    async fn delete_before(&self, cutoff: NaiveDate) -> Result<u64, StoreError>;

    async fn delete_older_than(&self, retention_days: u32, today: NaiveDate) -> Result<u64, StoreError> {
        self.delete_before(retention_cutoff(today, retention_days)).await
    }
}
