use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use tracing::{debug, info, warn};
use wbt_core::{day_key, RawAmount, TariffDraft};
use wbt_storage::{FetchError, HttpFetcher};

use crate::{SourceError, TariffSource};

pub const WB_API_BASE_URL: &str = "https://common-api.wildberries.ru";
const TARIFFS_BOX_PATH: &str = "/api/v1/tariffs/box";

#[derive(Debug, Deserialize)]
struct TariffEnvelope {
    response: Option<TariffResponse>,
}

#[derive(Debug, Deserialize)]
struct TariffResponse {
    data: Option<TariffData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TariffData {
    #[serde(default)]
    warehouse_list: Option<Vec<WarehouseBoxTariff>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WarehouseBoxTariff {
    #[serde(default)]
    warehouse_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    box_delivery_and_storage_expr: Option<String>,
    #[serde(default)]
    box_delivery_base: RawAmount,
    #[serde(default)]
    box_delivery_liter: RawAmount,
    #[serde(default)]
    box_storage_base: RawAmount,
    #[serde(default)]
    box_storage_liter: RawAmount,
}

/// Accept the formula as a string or a bare number; anything else is treated as absent.
fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(text) => Some(text),
        serde_json::Value::Number(number) => Some(number.to_string()),
        _ => None,
    })
}

impl WarehouseBoxTariff {
    fn into_draft(self) -> Option<TariffDraft> {
        let warehouse_name = self.warehouse_name.filter(|name| !name.trim().is_empty())?;
        Some(TariffDraft {
            warehouse_name,
            delivery_and_storage_expr: self.box_delivery_and_storage_expr,
            delivery_base: self.box_delivery_base,
            delivery_per_liter: self.box_delivery_liter,
            storage_base: self.box_storage_base,
            storage_per_liter: self.box_storage_liter,
        })
    }
}

/// Decode the `/api/v1/tariffs/box` envelope into drafts.
///
/// A missing `response.data` object is malformed; a missing or null
/// `warehouseList` means there are no tariffs for the day. Entries without a
/// usable warehouse name are skipped rather than failing the whole day.
pub fn parse_tariff_envelope(body: &[u8]) -> Result<Vec<TariffDraft>, SourceError> {
    let envelope: TariffEnvelope = serde_json::from_slice(body)
        .map_err(|err| SourceError::MalformedEnvelope(err.to_string()))?;
    let data = envelope
        .response
        .and_then(|r| r.data)
        .ok_or_else(|| SourceError::MalformedEnvelope("missing response.data".to_string()))?;

    let mut drafts = Vec::new();
    for item in data.warehouse_list.unwrap_or_default() {
        match item.into_draft() {
            Some(draft) => drafts.push(draft),
            None => warn!("skipping tariff entry without a warehouse name"),
        }
    }
    Ok(drafts)
}

/// Pull the human readable message out of an upstream error body.
fn upstream_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    ["message", "detail", "title", "errorText"]
        .iter()
        .find_map(|key| value.get(*key).and_then(|v| v.as_str()))
        .filter(|m| !m.is_empty())
        .map(str::to_string)
}

fn source_error(err: FetchError) -> SourceError {
    let message = err
        .body()
        .and_then(upstream_message)
        .unwrap_or_else(|| err.to_string());
    SourceError::Unavailable {
        status: err.status(),
        message,
    }
}

/// Wildberries box tariffs client.
#[derive(Debug, Clone)]
pub struct WbTariffsClient {
    http: Arc<HttpFetcher>,
    base_url: String,
    token: Option<String>,
}

impl WbTariffsClient {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Issue one tariff request for `tariff_date` and report whether it was accepted.
    pub async fn validate_token(&self, tariff_date: NaiveDate) -> bool {
        match self.fetch_tariffs(tariff_date).await {
            Ok(_) => true,
            Err(err) => {
                warn!(error = %err, status = ?err.status(), "tariffs API token check failed");
                false
            }
        }
    }
}

#[async_trait]
impl TariffSource for WbTariffsClient {
    async fn fetch_tariffs(&self, tariff_date: NaiveDate) -> Result<Vec<TariffDraft>, SourceError> {
        let date = day_key(tariff_date);
        let mut request = self
            .http
            .client()
            .get(format!("{}{}", self.base_url, TARIFFS_BOX_PATH))
            .query(&[("date", date.as_str())]);
        if let Some(token) = &self.token {
            request = request.header(reqwest::header::AUTHORIZATION, token);
        }

        debug!(%date, "requesting box tariffs");
        let response = self
            .http
            .execute("wb_tariffs_box", request)
            .await
            .map_err(source_error)?;
        let drafts = parse_tariff_envelope(&response.body)?;
        info!(%date, warehouses = drafts.len(), "fetched box tariffs");
        Ok(drafts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wbt_storage::test_support::MockApi;
    use wbt_storage::{HttpClientConfig, RetryPolicy};

    fn client(server: &MockApi, token: Option<&str>) -> WbTariffsClient {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            retry: RetryPolicy::disabled(),
            ..Default::default()
        })
        .unwrap();
        WbTariffsClient::new(Arc::new(http), server.url(), token.map(str::to_string))
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn missing_data_object_is_malformed() {
        let err = parse_tariff_envelope(br#"{"response":{}}"#).unwrap_err();
        assert!(matches!(err, SourceError::MalformedEnvelope(_)));
        let err = parse_tariff_envelope(b"not json").unwrap_err();
        assert!(matches!(err, SourceError::MalformedEnvelope(_)));
    }

    #[test]
    fn missing_or_null_warehouse_list_is_empty() {
        assert!(parse_tariff_envelope(br#"{"response":{"data":{}}}"#).unwrap().is_empty());
        assert!(parse_tariff_envelope(br#"{"response":{"data":{"warehouseList":null}}}"#)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn entries_keep_raw_amounts_and_drop_nameless_rows() {
        let body = r#"{"response":{"data":{"warehouseList":[
            {"warehouseName":"Коледино","boxDeliveryAndStorageExpr":"160",
             "boxDeliveryBase":"48","boxDeliveryLiter":"11,2","boxStorageBase":"0,1","boxStorageLiter":"-"},
            {"warehouseName":"","boxDeliveryBase":"1"}
        ]}}}"#;
        let drafts = parse_tariff_envelope(body.as_bytes()).unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].warehouse_name, "Коледино");
        assert_eq!(drafts[0].delivery_per_liter, RawAmount::Text("11,2".to_string()));
        assert_eq!(drafts[0].storage_per_liter, RawAmount::Text("-".to_string()));
    }

    #[test]
    fn null_names_and_odd_amounts_do_not_fail_the_day() {
        let body = r#"{"response":{"data":{"warehouseList":[
            {"warehouseName":"Коледино","boxDeliveryAndStorageExpr":160,
             "boxDeliveryBase":true,"boxDeliveryLiter":{"value":"11,2"},"boxStorageBase":"0,1"},
            {"warehouseName":null,"boxDeliveryBase":"1"},
            {"boxDeliveryBase":"2"}
        ]}}}"#;
        let drafts = parse_tariff_envelope(body.as_bytes()).unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].warehouse_name, "Коледино");
        assert_eq!(drafts[0].delivery_and_storage_expr.as_deref(), Some("160"));

        let tariff = drafts[0].normalize(day(2025, 2, 25));
        assert_eq!(tariff.delivery_base, rust_decimal::Decimal::ZERO);
        assert_eq!(tariff.delivery_per_liter, rust_decimal::Decimal::ZERO);
        assert_eq!(tariff.storage_base, rust_decimal::Decimal::new(1, 1));
    }

    #[tokio::test]
    async fn request_carries_date_and_raw_token() {
        let server = MockApi::start(|_| {
            (
                200,
                r#"{"response":{"data":{"warehouseList":[{"warehouseName":"Казань","boxDeliveryBase":"60"}]}}}"#
                    .to_string(),
            )
        })
        .await;

        let drafts = client(&server, Some("secret-token"))
            .fetch_tariffs(day(2025, 2, 25))
            .await
            .unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].warehouse_name, "Казань");

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].path, "/api/v1/tariffs/box");
        assert_eq!(requests[0].query, "date=2025-02-25");
        assert_eq!(requests[0].header("authorization"), Some("secret-token"));
    }

    #[tokio::test]
    async fn blank_token_sends_no_authorization_header() {
        let server = MockApi::start(|_| (200, r#"{"response":{"data":{}}}"#.to_string())).await;

        let drafts = client(&server, Some("  ")).fetch_tariffs(day(2025, 2, 25)).await.unwrap();
        assert!(drafts.is_empty());
        assert_eq!(server.requests()[0].header("authorization"), None);
    }

    #[tokio::test]
    async fn upstream_error_message_and_status_are_surfaced() {
        let server = MockApi::start(|_| {
            (401, r#"{"title":"unauthorized","detail":"token expired"}"#.to_string())
        })
        .await;

        let client = client(&server, Some("stale"));
        let err = client.fetch_tariffs(day(2025, 2, 25)).await.unwrap_err();
        assert_eq!(err.status(), Some(401));
        assert!(err.to_string().contains("token expired"));
        assert!(!client.validate_token(day(2025, 2, 25)).await);
    }
}
