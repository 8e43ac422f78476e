use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;
use wbt_adapters::{PublishClient, TariffSource};
use wbt_core::{
    CleanupOutcome, FullSyncOutcome, SheetsSyncOutcome, SourceSyncOutcome, TariffCalendar,
};
use wbt_storage::TariffStore;

/// Coordinates fetch, store and publish for one tariff day.
///
/// Stage failures become outcome fields; no method here returns an error.
pub struct SyncOrchestrator {
    source: Arc<dyn TariffSource>,
    store: Arc<dyn TariffStore>,
    publisher: PublishClient,
    targets: Vec<String>,
    calendar: TariffCalendar,
}

impl SyncOrchestrator {
    pub fn new(
        source: Arc<dyn TariffSource>,
        store: Arc<dyn TariffStore>,
        publisher: PublishClient,
        targets: Vec<String>,
        calendar: TariffCalendar,
    ) -> Self {
        Self {
            source,
            store,
            publisher,
            targets,
            calendar,
        }
    }

    pub fn calendar(&self) -> TariffCalendar {
        self.calendar
    }

    /// Fetch `date` (default: today in the tariff timezone) and upsert it.
    pub async fn sync_from_source(&self, date: Option<NaiveDate>) -> SourceSyncOutcome {
        let date = date.unwrap_or_else(|| self.calendar.today());
        let span = info_span!("sync_from_source", run_id = %Uuid::new_v4(), %date);
        self.fetch_and_store(date).instrument(span).await
    }

    /// Republish whatever is stored for `date` to every target.
    pub async fn sync_to_sheets(&self, date: Option<NaiveDate>) -> SheetsSyncOutcome {
        let date = date.unwrap_or_else(|| self.calendar.today());
        let span = info_span!("sync_to_sheets", run_id = %Uuid::new_v4(), %date);
        self.publish_stored(date).instrument(span).await
    }

    pub async fn full_sync(&self, date: Option<NaiveDate>) -> FullSyncOutcome {
        let tariff_date = date.unwrap_or_else(|| self.calendar.today());
        let span = info_span!("full_sync", run_id = %Uuid::new_v4(), date = %tariff_date);
        async {
            info!("starting full sync");
            let wb_sync = self.fetch_and_store(tariff_date).await;
            let sheets_sync = if wb_sync.success && wb_sync.count > 0 {
                self.publish_stored(tariff_date).await
            } else {
                info!("no new tariffs stored; skipping publish");
                SheetsSyncOutcome::skipped()
            };
            info!(
                wb_success = wb_sync.success,
                stored = wb_sync.count,
                sheets_success = sheets_sync.success,
                updated = sheets_sync.updated,
                "full sync finished"
            );
            FullSyncOutcome {
                tariff_date,
                wb_sync,
                sheets_sync,
            }
        }
        .instrument(span)
        .await
    }

    /// Drop tariffs older than `retention_days` before today.
    pub async fn cleanup(&self, retention_days: u32) -> CleanupOutcome {
        self.cleanup_as_of(retention_days, self.calendar.today()).await
    }

    /// Drop tariffs dated more than `retention_days` before `today`.
    pub async fn cleanup_as_of(&self, retention_days: u32, today: NaiveDate) -> CleanupOutcome {
        let span = info_span!("cleanup", run_id = %Uuid::new_v4(), retention_days, %today);
        async {
            match self.store.delete_older_than(retention_days, today).await {
                Ok(deleted_count) => {
                    info!(deleted_count, "old tariffs removed");
                    CleanupOutcome {
                        success: true,
                        deleted_count,
                        error: None,
                    }
                }
                Err(err) => {
                    error!(error = %err, "tariff cleanup failed");
                    CleanupOutcome {
                        success: false,
                        deleted_count: 0,
                        error: Some(err.to_string()),
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn fetch_and_store(&self, date: NaiveDate) -> SourceSyncOutcome {
        let drafts = match self.source.fetch_tariffs(date).await {
            Ok(drafts) => drafts,
            Err(err) => {
                error!(error = %err, status = ?err.status(), "fetching tariffs failed");
                return SourceSyncOutcome::failed(err.to_string());
            }
        };
        if drafts.is_empty() {
            warn!("tariffs API returned no warehouses");
            return SourceSyncOutcome::synced(0);
        }
        match self.store.upsert(&drafts, date).await {
            Ok(count) => {
                info!(count, "tariffs stored");
                SourceSyncOutcome::synced(count)
            }
            Err(err) => {
                error!(error = %err, "storing tariffs failed");
                SourceSyncOutcome::failed(err.to_string())
            }
        }
    }

    async fn publish_stored(&self, date: NaiveDate) -> SheetsSyncOutcome {
        let records = match self.store.query_by_date(date).await {
            Ok(records) => records,
            Err(err) => {
                error!(error = %err, "reading stored tariffs failed");
                return SheetsSyncOutcome::failed(format!("reading stored tariffs: {err}"));
            }
        };
        if records.is_empty() {
            info!("no stored tariffs for date; nothing to publish");
            return SheetsSyncOutcome::skipped();
        }
        match self.publisher.publish_all(&self.targets, &records).await {
            Ok(report) => {
                if report.failed_count > 0 {
                    warn!(
                        succeeded = report.success_count,
                        failed = report.failed_count,
                        "some spreadsheets were not updated"
                    );
                }
                report.into()
            }
            Err(err) => {
                error!(error = %err, "publishing unavailable");
                SheetsSyncOutcome::failed(err.to_string())
            }
        }
    }
}
