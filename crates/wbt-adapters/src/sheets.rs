use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use wbt_core::{PublishReport, TariffRecord, AMOUNT_SCALE};
use wbt_storage::HttpFetcher;

use crate::PublishError;

pub const GOOGLE_SHEETS_API_URL: &str = "https://sheets.googleapis.com";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const TOKEN_LIFETIME_SECS: i64 = 3600;
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

pub const SHEET_NAME: &str = "stocks_coefs";
pub const SHEET_HEADERS: [&str; 7] = [
    "Склад",
    "Коэффициент",
    "Формула",
    "Доставка база",
    "Доставка за литр",
    "Хранение база",
    "Хранение за литр",
];

/// Header plus one row per tariff, ready to be written verbatim to a sheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetSnapshot {
    pub rows: Vec<Vec<String>>,
}

fn format_amount(value: Decimal) -> String {
    let rounded = value.round_dp_with_strategy(AMOUNT_SCALE, RoundingStrategy::MidpointAwayFromZero);
    format!("{rounded:.2}")
}

impl SheetSnapshot {
    /// Rows are ordered by ascending coefficient; ties keep the input order.
    pub fn from_records(records: &[TariffRecord]) -> Self {
        let mut sorted = records.iter().collect::<Vec<_>>();
        sorted.sort_by_key(|r| r.coefficient());

        let mut rows = Vec::with_capacity(sorted.len() + 1);
        rows.push(SHEET_HEADERS.iter().map(|h| h.to_string()).collect());
        for record in sorted {
            rows.push(vec![
                record.warehouse_name.clone(),
                format_amount(record.coefficient()),
                record.delivery_and_storage_expr.clone(),
                format_amount(record.delivery_base),
                format_amount(record.delivery_per_liter),
                format_amount(record.storage_base),
                format_amount(record.storage_per_liter),
            ]);
        }
        Self { rows }
    }

    pub fn data_rows(&self) -> usize {
        self.rows.len().saturating_sub(1)
    }
}

/// A spreadsheet backend that can replace the contents of the tariff sheet.
#[async_trait]
pub trait SpreadsheetClient: Send + Sync {
    /// Shared initialization, run once per publish pass before any target.
    async fn ensure_ready(&self) -> Result<(), PublishError>;

    /// Clear the tariff sheet of `spreadsheet_id` and write `snapshot`, creating the sheet if needed.
    async fn replace_sheet(&self, spreadsheet_id: &str, snapshot: &SheetSnapshot) -> Result<(), PublishError>;
}

/// Fans one snapshot out to every configured spreadsheet.
#[derive(Clone)]
pub struct PublishClient {
    sheets: Arc<dyn SpreadsheetClient>,
}

impl fmt::Debug for PublishClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishClient").finish_non_exhaustive()
    }
}

impl PublishClient {
    pub fn new(sheets: Arc<dyn SpreadsheetClient>) -> Self {
        Self { sheets }
    }

    /// Publish `records` to every target concurrently.
    ///
    /// Returns `Err` only when shared initialization fails, in which case no target
    /// is attempted. Per-target failures are tallied in the report.
    pub async fn publish_all(
        &self,
        targets: &[String],
        records: &[TariffRecord],
    ) -> Result<PublishReport, PublishError> {
        if targets.is_empty() {
            return Ok(PublishReport::default());
        }
        self.sheets.ensure_ready().await?;

        let snapshot = SheetSnapshot::from_records(records);
        let results = join_all(targets.iter().map(|id| {
            let snapshot = &snapshot;
            async move { (id, self.sheets.replace_sheet(id, snapshot).await) }
        }))
        .await;

        let mut report = PublishReport::default();
        for (id, result) in results {
            match result {
                Ok(()) => {
                    info!(spreadsheet_id = %id, rows = snapshot.data_rows(), "spreadsheet updated");
                    report.record_success();
                }
                Err(err) => {
                    warn!(spreadsheet_id = %id, error = %err, "spreadsheet update failed");
                    report.record_failure(id.clone(), err.to_string());
                }
            }
        }
        Ok(report)
    }
}

#[derive(Clone, Default)]
pub enum GoogleCredentials {
    /// Service account key exchanged for short-lived access tokens.
    ServiceAccount {
        client_email: String,
        private_key: String,
    },
    /// Pre-issued OAuth access token used as-is.
    AccessToken(String),
    #[default]
    Missing,
}

impl fmt::Debug for GoogleCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServiceAccount { client_email, .. } => f
                .debug_struct("ServiceAccount")
                .field("client_email", client_email)
                .finish_non_exhaustive(),
            Self::AccessToken(_) => f.write_str("AccessToken(..)"),
            Self::Missing => f.write_str("Missing"),
        }
    }
}

impl GoogleCredentials {
    /// A complete service account wins over a static token; blanks count as unset.
    pub fn from_parts(client_email: &str, private_key: &str, access_token: &str) -> Self {
        let (email, key, token) = (client_email.trim(), private_key.trim(), access_token.trim());
        if !email.is_empty() && !key.is_empty() {
            Self::ServiceAccount {
                client_email: email.to_string(),
                private_key: key.to_string(),
            }
        } else if !token.is_empty() {
            Self::AccessToken(token.to_string())
        } else {
            Self::Missing
        }
    }

    pub fn is_configured(&self) -> bool {
        !matches!(self, Self::Missing)
    }
}

#[derive(Debug, Serialize)]
struct ServiceAccountClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Option<Instant>,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        self.expires_at
            .map(|at| Instant::now() + TOKEN_REFRESH_MARGIN < at)
            .unwrap_or(true)
    }
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Debug, Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    #[serde(default)]
    sheet_id: i64,
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct BatchUpdateResponse {
    #[serde(default)]
    replies: Vec<BatchReply>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchReply {
    add_sheet: Option<AddSheetReply>,
}

#[derive(Debug, Deserialize)]
struct AddSheetReply {
    properties: SheetProperties,
}

/// Google Sheets v4 client with a cached, shared access token.
#[derive(Debug)]
pub struct GoogleSheetsClient {
    http: Arc<HttpFetcher>,
    api_base: String,
    token_url: String,
    credentials: GoogleCredentials,
    token: Mutex<Option<CachedToken>>,
}

impl GoogleSheetsClient {
    pub fn new(http: Arc<HttpFetcher>, credentials: GoogleCredentials) -> Self {
        Self {
            http,
            api_base: GOOGLE_SHEETS_API_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            credentials,
            token: Mutex::new(None),
        }
    }

    pub fn with_endpoints(mut self, api_base: impl Into<String>, token_url: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self.token_url = token_url.into();
        self
    }

    async fn access_token(&self) -> Result<String, PublishError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.value.clone());
        }
        let fresh = self.authorize().await?;
        let value = fresh.value.clone();
        *cached = Some(fresh);
        info!("google sheets client authorized");
        Ok(value)
    }

    async fn authorize(&self) -> Result<CachedToken, PublishError> {
        let (client_email, private_key) = match &self.credentials {
            GoogleCredentials::Missing => {
                return Err(PublishError::Unavailable(
                    "Google credentials are not configured".to_string(),
                ))
            }
            GoogleCredentials::AccessToken(token) => {
                return Ok(CachedToken {
                    value: token.clone(),
                    expires_at: None,
                })
            }
            GoogleCredentials::ServiceAccount {
                client_email,
                private_key,
            } => (client_email, private_key),
        };

        let pem = private_key.replace("\\n", "\n");
        let key = EncodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|err| PublishError::Unavailable(format!("invalid service account key: {err}")))?;
        let now = Utc::now().timestamp();
        let claims = ServiceAccountClaims {
            iss: client_email,
            scope: SHEETS_SCOPE,
            aud: &self.token_url,
            iat: now,
            exp: now + TOKEN_LIFETIME_SECS,
        };
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|err| PublishError::Unavailable(format!("signing token request: {err}")))?;

        let request = self
            .http
            .client()
            .post(&self.token_url)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())]);
        let response = self
            .http
            .execute("google_token", request)
            .await
            .map_err(|err| PublishError::Unavailable(format!("token exchange failed: {err}")))?;
        let token: TokenResponse = response
            .json()
            .map_err(|err| PublishError::Unavailable(format!("invalid token response: {err}")))?;
        Ok(CachedToken {
            value: token.access_token,
            expires_at: token
                .expires_in
                .map(|secs| Instant::now() + Duration::from_secs(secs)),
        })
    }

    fn spreadsheet_url(&self, spreadsheet_id: &str) -> String {
        format!("{}/v4/spreadsheets/{}", self.api_base, spreadsheet_id)
    }

    async fn find_sheet_id(&self, spreadsheet_id: &str, token: &str) -> anyhow::Result<Option<i64>> {
        let request = self
            .http
            .client()
            .get(self.spreadsheet_url(spreadsheet_id))
            .query(&[("fields", "sheets.properties(sheetId,title)")])
            .bearer_auth(token);
        let meta: SpreadsheetMeta = self
            .http
            .execute("sheets_metadata", request)
            .await
            .context("reading spreadsheet metadata")?
            .json()
            .context("decoding spreadsheet metadata")?;
        Ok(meta
            .sheets
            .into_iter()
            .find(|s| s.properties.title == SHEET_NAME)
            .map(|s| s.properties.sheet_id))
    }

    fn batch_update_request(
        &self,
        spreadsheet_id: &str,
        token: &str,
        requests: serde_json::Value,
    ) -> reqwest::RequestBuilder {
        self.http
            .client()
            .post(format!("{}:batchUpdate", self.spreadsheet_url(spreadsheet_id)))
            .bearer_auth(token)
            .json(&json!({ "requests": requests }))
    }

    /// Create the tariff sheet and return its id.
    ///
    /// `addSheet` is not idempotent, so it is sent once; if it fails, the
    /// metadata is read again in case the server applied it anyway.
    async fn add_sheet(&self, spreadsheet_id: &str, token: &str) -> anyhow::Result<i64> {
        let requests = json!([{ "addSheet": { "properties": { "title": SHEET_NAME } } }]);
        let request = self.batch_update_request(spreadsheet_id, token, requests);
        let sent = match self.http.execute_once("sheets_add_sheet", request).await {
            Ok(response) => response,
            Err(err) => {
                if let Some(sheet_id) = self.find_sheet_id(spreadsheet_id, token).await? {
                    warn!(spreadsheet_id, error = %err, "addSheet failed but the sheet exists");
                    return Ok(sheet_id);
                }
                return Err(err).with_context(|| format!("creating sheet {SHEET_NAME}"));
            }
        };
        let reply: BatchUpdateResponse = sent.json().context("decoding addSheet response")?;
        let sheet_id = reply
            .replies
            .into_iter()
            .find_map(|r| r.add_sheet)
            .map(|a| a.properties.sheet_id)
            .ok_or_else(|| anyhow!("addSheet reply did not include the new sheet"))?;
        info!(spreadsheet_id, sheet_id, "created tariff sheet");
        Ok(sheet_id)
    }

    async fn write_snapshot(
        &self,
        spreadsheet_id: &str,
        snapshot: &SheetSnapshot,
    ) -> anyhow::Result<()> {
        let token = self.access_token().await?;
        let sheet_id = match self.find_sheet_id(spreadsheet_id, &token).await? {
            Some(id) => id,
            None => self.add_sheet(spreadsheet_id, &token).await?,
        };

        let clear = self
            .http
            .client()
            .post(format!(
                "{}/values/{SHEET_NAME}!A:Z:clear",
                self.spreadsheet_url(spreadsheet_id)
            ))
            .bearer_auth(&token)
            .json(&json!({}));
        self.http
            .execute("sheets_clear", clear)
            .await
            .context("clearing sheet values")?;

        let range = format!("{SHEET_NAME}!A1");
        let update = self
            .http
            .client()
            .put(format!("{}/values/{range}", self.spreadsheet_url(spreadsheet_id)))
            .query(&[("valueInputOption", "RAW")])
            .bearer_auth(&token)
            .json(&json!({
                "range": range,
                "majorDimension": "ROWS",
                "values": snapshot.rows,
            }));
        self.http
            .execute("sheets_update", update)
            .await
            .context("writing sheet values")?;

        let columns = SHEET_HEADERS.len();
        let formatting = json!([
            {
                "repeatCell": {
                    "range": { "sheetId": sheet_id, "startRowIndex": 0, "endRowIndex": 1 },
                    "cell": {
                        "userEnteredFormat": {
                            "textFormat": { "bold": true },
                            "backgroundColor": { "red": 0.9, "green": 0.9, "blue": 0.9 }
                        }
                    },
                    "fields": "userEnteredFormat(textFormat,backgroundColor)"
                }
            },
            {
                "autoResizeDimensions": {
                    "dimensions": {
                        "sheetId": sheet_id,
                        "dimension": "COLUMNS",
                        "startIndex": 0,
                        "endIndex": columns
                    }
                }
            }
        ]);
        let format = self.batch_update_request(spreadsheet_id, &token, formatting);
        self.http
            .execute("sheets_format", format)
            .await
            .context("formatting header row")?;
        debug!(spreadsheet_id, sheet_id, rows = snapshot.data_rows(), "sheet rewritten");
        Ok(())
    }
}

#[async_trait]
impl SpreadsheetClient for GoogleSheetsClient {
    async fn ensure_ready(&self) -> Result<(), PublishError> {
        self.access_token().await.map(|_| ())
    }

    async fn replace_sheet(&self, spreadsheet_id: &str, snapshot: &SheetSnapshot) -> Result<(), PublishError> {
        self.write_snapshot(spreadsheet_id, snapshot)
            .await
            .map_err(|err| PublishError::Target {
                spreadsheet_id: spreadsheet_id.to_string(),
                message: format!("{err:#}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wbt_storage::test_support::{MockApi, RecordedRequest};
    use wbt_storage::{HttpClientConfig, RetryPolicy};

    fn record(warehouse: &str, base: i64) -> TariffRecord {
        TariffRecord {
            tariff_date: NaiveDate::from_ymd_opt(2025, 2, 25).unwrap(),
            warehouse_name: warehouse.to_string(),
            delivery_and_storage_expr: "160".to_string(),
            delivery_base: Decimal::new(base, 0),
            delivery_per_liter: Decimal::new(112, 1),
            storage_base: Decimal::new(1, 1),
            storage_per_liter: Decimal::ZERO,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    struct FakeSheets {
        ready: bool,
        failing: &'static str,
        writes: AtomicUsize,
    }

    impl FakeSheets {
        fn new(ready: bool, failing: &'static str) -> Self {
            Self {
                ready,
                failing,
                writes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SpreadsheetClient for FakeSheets {
        async fn ensure_ready(&self) -> Result<(), PublishError> {
            if self.ready {
                Ok(())
            } else {
                Err(PublishError::Unavailable("no credentials".to_string()))
            }
        }

        async fn replace_sheet(&self, spreadsheet_id: &str, _: &SheetSnapshot) -> Result<(), PublishError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if spreadsheet_id == self.failing {
                return Err(PublishError::Target {
                    spreadsheet_id: spreadsheet_id.to_string(),
                    message: "permission denied".to_string(),
                });
            }
            Ok(())
        }
    }

    fn targets(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn snapshot_sorts_by_coefficient_and_formats_two_decimals() {
        let records = vec![record("C", 30), record("A", 10), record("B", 20)];
        let snapshot = SheetSnapshot::from_records(&records);
        assert_eq!(snapshot.rows[0], SHEET_HEADERS.map(String::from).to_vec());
        let names = snapshot.rows[1..].iter().map(|r| r[0].as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["A", "B", "C"]);
        assert_eq!(
            snapshot.rows[1],
            vec!["A", "21.30", "160", "10.00", "11.20", "0.10", "0.00"]
        );
        assert_eq!(snapshot.data_rows(), 3);
    }

    #[test]
    fn snapshot_of_no_records_is_header_only() {
        let snapshot = SheetSnapshot::from_records(&[]);
        assert_eq!(snapshot.rows.len(), 1);
        assert_eq!(snapshot.data_rows(), 0);
    }

    #[test]
    fn credentials_prefer_service_account_and_treat_blanks_as_unset() {
        assert!(matches!(
            GoogleCredentials::from_parts("svc@x.iam", "KEY", "tok"),
            GoogleCredentials::ServiceAccount { .. }
        ));
        assert!(matches!(
            GoogleCredentials::from_parts("svc@x.iam", " ", "tok"),
            GoogleCredentials::AccessToken(_)
        ));
        assert!(!GoogleCredentials::from_parts("", "", " ").is_configured());
        assert!(!format!("{:?}", GoogleCredentials::AccessToken("secret".into())).contains("secret"));
    }

    #[tokio::test]
    async fn one_failing_target_does_not_stop_the_others() {
        let fake = Arc::new(FakeSheets::new(true, "sheet-2"));
        let publisher = PublishClient::new(fake.clone());
        let report = publisher
            .publish_all(&targets(&["sheet-1", "sheet-2", "sheet-3"]), &[record("A", 1)])
            .await
            .unwrap();

        assert_eq!(report.success_count, 2);
        assert_eq!(report.failed_count, 1);
        assert_eq!(report.errors[0].spreadsheet_id.as_deref(), Some("sheet-2"));
        assert!(report.errors[0].error.contains("permission denied"));
        assert_eq!(fake.writes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failed_initialization_attempts_no_target() {
        let fake = Arc::new(FakeSheets::new(false, ""));
        let publisher = PublishClient::new(fake.clone());
        let err = publisher
            .publish_all(&targets(&["sheet-1", "sheet-2"]), &[record("A", 1)])
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Unavailable(_)));
        assert_eq!(fake.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_targets_is_an_empty_report() {
        let fake = Arc::new(FakeSheets::new(false, ""));
        let report = PublishClient::new(fake).publish_all(&[], &[record("A", 1)]).await.unwrap();
        assert_eq!(report, PublishReport::default());
    }

    fn google_client(server: &MockApi, credentials: GoogleCredentials) -> GoogleSheetsClient {
        let http = HttpFetcher::new(HttpClientConfig {
            retry: RetryPolicy::disabled(),
            ..Default::default()
        })
        .unwrap();
        GoogleSheetsClient::new(Arc::new(http), credentials)
            .with_endpoints(server.url(), format!("{}/token", server.url()))
    }

    fn fake_sheets_api(request: &RecordedRequest) -> (u16, String) {
        let body = match (request.method.as_str(), request.path.as_str()) {
            ("GET", "/v4/spreadsheets/doc-1") => {
                r#"{"sheets":[{"properties":{"sheetId":0,"title":"Sheet1"}}]}"#
            }
            ("POST", "/v4/spreadsheets/doc-1:batchUpdate") => {
                r#"{"replies":[{"addSheet":{"properties":{"sheetId":777,"title":"stocks_coefs"}}}]}"#
            }
            ("POST", "/v4/spreadsheets/doc-1/values/stocks_coefs!A:Z:clear")
            | ("PUT", "/v4/spreadsheets/doc-1/values/stocks_coefs!A1") => "{}",
            _ => return (404, r#"{"error":{"message":"not found"}}"#.to_string()),
        };
        (200, body.to_string())
    }

    #[tokio::test]
    async fn missing_credentials_fail_before_any_request() {
        let server = MockApi::start(fake_sheets_api).await;
        let client = google_client(&server, GoogleCredentials::Missing);
        let err = client.ensure_ready().await.unwrap_err();
        assert!(matches!(err, PublishError::Unavailable(_)));
        assert!(server.requests().is_empty());
    }

    #[tokio::test]
    async fn malformed_service_account_key_is_unavailable() {
        let server = MockApi::start(fake_sheets_api).await;
        let client = google_client(
            &server,
            GoogleCredentials::ServiceAccount {
                client_email: "svc@example.iam.gserviceaccount.com".to_string(),
                private_key: "not a pem key".to_string(),
            },
        );
        let err = client.ensure_ready().await.unwrap_err();
        assert!(matches!(err, PublishError::Unavailable(_)));
        assert!(server.requests().is_empty());
    }

    #[tokio::test]
    async fn missing_sheet_is_created_then_cleared_written_and_formatted() {
        let server = MockApi::start(fake_sheets_api).await;
        let client = google_client(&server, GoogleCredentials::AccessToken("static-token".into()));
        let snapshot = SheetSnapshot::from_records(&[record("B", 20), record("A", 10)]);
        client.ensure_ready().await.unwrap();
        client.replace_sheet("doc-1", &snapshot).await.unwrap();

        let requests = server.requests();
        let calls = requests
            .iter()
            .map(|r| format!("{} {}", r.method, r.path))
            .collect::<Vec<_>>();
        assert_eq!(
            calls,
            vec![
                "GET /v4/spreadsheets/doc-1",
                "POST /v4/spreadsheets/doc-1:batchUpdate",
                "POST /v4/spreadsheets/doc-1/values/stocks_coefs!A:Z:clear",
                "PUT /v4/spreadsheets/doc-1/values/stocks_coefs!A1",
                "POST /v4/spreadsheets/doc-1:batchUpdate",
            ]
        );
        assert!(requests
            .iter()
            .all(|r| r.header("authorization") == Some("Bearer static-token")));

        assert_eq!(requests[1].json()["requests"][0]["addSheet"]["properties"]["title"], SHEET_NAME);
        assert_eq!(requests[3].query, "valueInputOption=RAW");
        let written = requests[3].json();
        assert_eq!(written["values"][0][0], "Склад");
        assert_eq!(written["values"][1][0], "A");
        assert_eq!(written["values"][2][0], "B");

        let format = requests[4].json();
        assert_eq!(format["requests"][0]["repeatCell"]["range"]["sheetId"], 777);
        assert_eq!(format["requests"][1]["autoResizeDimensions"]["dimensions"]["endIndex"], 7);
    }

    #[tokio::test]
    async fn target_errors_name_the_spreadsheet() {
        let server = MockApi::start(fake_sheets_api).await;
        let client = google_client(&server, GoogleCredentials::AccessToken("t".into()));
        let err = client
            .replace_sheet("doc-9", &SheetSnapshot::from_records(&[]))
            .await
            .unwrap_err();
        assert!(matches!(&err, PublishError::Target { spreadsheet_id, .. } if spreadsheet_id == "doc-9"));
        assert!(err.to_string().contains("reading spreadsheet metadata"));
    }

    fn test_service_account() -> GoogleCredentials {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/google/test_service_account_key.pem");
        let pem = std::fs::read_to_string(path).expect("test key readable");
        GoogleCredentials::ServiceAccount {
            client_email: "tariffs@example.iam.gserviceaccount.com".to_string(),
            // Keys pasted into env files carry literal \n sequences.
            private_key: pem.trim().replace('\n', "\\n"),
        }
    }

    fn token_api(expires_in: u64) -> impl Fn(&RecordedRequest) -> (u16, String) + Send + Sync + 'static {
        move |request: &RecordedRequest| {
            if request.path == "/token" {
                let body = format!(r#"{{"access_token":"sa-token","expires_in":{expires_in},"token_type":"Bearer"}}"#);
                (200, body)
            } else {
                fake_sheets_api(request)
            }
        }
    }

    #[tokio::test]
    async fn service_account_token_is_granted_once_and_reused() {
        let server = MockApi::start(token_api(3600)).await;
        let client = google_client(&server, test_service_account());
        client.ensure_ready().await.unwrap();
        client.ensure_ready().await.unwrap();

        let grants = server
            .requests()
            .into_iter()
            .filter(|r| r.path == "/token")
            .collect::<Vec<_>>();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].header("content-type"), Some("application/x-www-form-urlencoded"));
        let form = String::from_utf8(grants[0].body.clone()).unwrap();
        assert!(form.contains("grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer"));
        let assertion = form
            .split('&')
            .find_map(|pair| pair.strip_prefix("assertion="))
            .expect("assertion field");
        assert_eq!(jsonwebtoken::decode_header(assertion).unwrap().alg, Algorithm::RS256);

        client.replace_sheet("doc-1", &SheetSnapshot::from_records(&[])).await.unwrap();
        let requests = server.requests();
        assert_eq!(requests.iter().filter(|r| r.path == "/token").count(), 1);
        assert!(requests
            .iter()
            .filter(|r| r.path != "/token")
            .all(|r| r.header("authorization") == Some("Bearer sa-token")));
    }

    #[tokio::test]
    async fn token_inside_the_refresh_margin_is_granted_again() {
        let server = MockApi::start(token_api(30)).await;
        let client = google_client(&server, test_service_account());
        client.ensure_ready().await.unwrap();
        client.ensure_ready().await.unwrap();
        assert_eq!(server.requests().iter().filter(|r| r.path == "/token").count(), 2);
    }

    fn is_add_sheet(request: &RecordedRequest) -> bool {
        request.path.ends_with(":batchUpdate") && request.json()["requests"][0].get("addSheet").is_some()
    }

    #[tokio::test]
    async fn failed_add_sheet_is_not_resent_and_rechecks_metadata() {
        let metadata_reads = Arc::new(AtomicUsize::new(0));
        let reads = metadata_reads.clone();
        let server = MockApi::start(move |request: &RecordedRequest| {
            if request.method == "GET" && request.path == "/v4/spreadsheets/doc-1" {
                let body = if reads.fetch_add(1, Ordering::SeqCst) == 0 {
                    r#"{"sheets":[{"properties":{"sheetId":0,"title":"Sheet1"}}]}"#
                } else {
                    r#"{"sheets":[{"properties":{"sheetId":0,"title":"Sheet1"}},{"properties":{"sheetId":555,"title":"stocks_coefs"}}]}"#
                };
                return (200, body.to_string());
            }
            if is_add_sheet(request) {
                return (503, r#"{"error":{"message":"backend error"}}"#.to_string());
            }
            fake_sheets_api(request)
        })
        .await;

        let http = HttpFetcher::new(HttpClientConfig {
            retry: RetryPolicy {
                max_retries: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..Default::default()
        })
        .unwrap();
        let client = GoogleSheetsClient::new(Arc::new(http), GoogleCredentials::AccessToken("t".into()))
            .with_endpoints(server.url(), format!("{}/token", server.url()));
        client
            .replace_sheet("doc-1", &SheetSnapshot::from_records(&[record("A", 1)]))
            .await
            .unwrap();

        let requests = server.requests();
        assert_eq!(requests.iter().filter(|r| is_add_sheet(r)).count(), 1);
        assert_eq!(metadata_reads.load(Ordering::SeqCst), 2);
        let format = requests.last().unwrap().json();
        assert_eq!(format["requests"][0]["repeatCell"]["range"]["sheetId"], 555);
    }
}
