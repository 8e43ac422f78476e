use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tokio::sync::Mutex;
use wbt_core::{TariffDraft, TariffRecord};

use crate::{StoreError, TariffStore};

/// Process-local store with the same keying and ordering rules as the Postgres table.
#[derive(Debug, Default)]
pub struct MemoryTariffStore {
    rows: Mutex<BTreeMap<(NaiveDate, String), TariffRecord>>,
}

impl MemoryTariffStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }

    /// Seed a fully formed record, bypassing normalization.
    pub async fn insert_record(&self, record: TariffRecord) {
        let key = (record.tariff_date, record.warehouse_name.clone());
        self.rows.lock().await.insert(key, record);
    }
}

fn sort_for_output(records: &mut [TariffRecord]) {
    records.sort_by(|a, b| {
        a.tariff_date
            .cmp(&b.tariff_date)
            .then_with(|| a.delivery_and_storage_expr.cmp(&b.delivery_and_storage_expr))
            .then_with(|| a.warehouse_name.cmp(&b.warehouse_name))
    });
}

#[async_trait]
impl TariffStore for MemoryTariffStore {
    async fn upsert(&self, drafts: &[TariffDraft], tariff_date: NaiveDate) -> Result<usize, StoreError> {
        let written_at = Utc::now();
        let mut rows = self.rows.lock().await;
        for draft in drafts {
            let tariff = draft.normalize(tariff_date);
            let key = (tariff.tariff_date, tariff.warehouse_name.clone());
            let created_at = rows.get(&key).map(|r| r.created_at).unwrap_or(written_at);
            rows.insert(
                key,
                TariffRecord {
                    tariff_date: tariff.tariff_date,
                    warehouse_name: tariff.warehouse_name,
                    delivery_and_storage_expr: tariff.delivery_and_storage_expr,
                    delivery_base: tariff.delivery_base,
                    delivery_per_liter: tariff.delivery_per_liter,
                    storage_base: tariff.storage_base,
                    storage_per_liter: tariff.storage_per_liter,
                    created_at,
                    updated_at: written_at,
                },
            );
        }
        Ok(drafts.len())
    }

    async fn query_by_date(&self, tariff_date: NaiveDate) -> Result<Vec<TariffRecord>, StoreError> {
        self.query_range(tariff_date, tariff_date).await
    }

    async fn query_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<TariffRecord>, StoreError> {
        let rows = self.rows.lock().await;
        let mut out = rows
            .values()
            .filter(|r| r.tariff_date >= start && r.tariff_date <= end)
            .cloned()
            .collect::<Vec<_>>();
        sort_for_output(&mut out);
        Ok(out)
    }

    async fn delete_before(&self, cutoff: NaiveDate) -> Result<u64, StoreError> {
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        rows.retain(|(date, _), _| *date >= cutoff);
        Ok((before - rows.len()) as u64)
    }
}
