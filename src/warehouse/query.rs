//! BigQuery query execution with polling and pagination.
//!
//! Runs standard-SQL queries through `jobs.query` and follows up with
//! `jobs.getQueryResults` until the job is complete and every page has been
//! read. Key features:
//!
//! - **Automatic pagination** - fetches all rows across pages
//! - **Polling** - waits for jobs that do not finish within the request timeout
//! - **Secure logging** - never logs the SQL text above debug level
//! - **Error mapping** - parses API error envelopes into `AppError`

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::WarehouseSettings;
use crate::error::AppError;
use crate::extract::{TabularData, WarehouseQuery};
use crate::warehouse::client::BigQueryClient;

// ─────────────────────────────────────────────────────────────────────────────
// Internal Wire Types (match BigQuery JSON exactly)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireQueryRequest<'a> {
    query: &'a str,
    use_legacy_sql: bool,
    max_results: u32,
    timeout_ms: u64,
}

/// Shared shape of `jobs.query` and `jobs.getQueryResults` responses.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireQueryResponse {
    #[serde(default)]
    job_complete: bool,
    job_reference: Option<WireJobReference>,
    schema: Option<WireSchema>,
    #[serde(default)]
    rows: Vec<WireRow>,
    page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireJobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireSchema {
    #[serde(default)]
    fields: Vec<WireField>,
}

#[derive(Debug, Deserialize)]
struct WireField {
    name: String,
}

#[derive(Debug, Deserialize)]
struct WireRow {
    #[serde(default)]
    f: Vec<WireCell>,
}

#[derive(Debug, Deserialize)]
struct WireCell {
    #[serde(default)]
    v: Value,
}

#[derive(Debug, Deserialize)]
struct WireErrorEnvelope {
    error: WireErrorBody,
}

#[derive(Debug, Deserialize)]
struct WireErrorBody {
    message: String,
    status: Option<String>,
    #[serde(default)]
    errors: Vec<WireErrorItem>,
}

#[derive(Debug, Deserialize)]
struct WireErrorItem {
    reason: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// QueryClient
// ─────────────────────────────────────────────────────────────────────────────

/// Executes SQL against BigQuery and materializes the result as `TabularData`.
#[derive(Clone)]
pub struct QueryClient {
    client: BigQueryClient,
    page_size: u32,
    timeout_ms: u64,
    poll_interval: Duration,
    deadline: Duration,
}

impl QueryClient {
    pub fn new(client: BigQueryClient, settings: &WarehouseSettings) -> Self {
        Self {
            client,
            page_size: settings.page_size,
            timeout_ms: settings.query_timeout_ms,
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            deadline: Duration::from_secs(settings.query_deadline_secs),
        }
    }

    /// Runs a query and returns every row.
    ///
    /// # Errors
    ///
    /// - `AppError::Warehouse` - query syntax error, API error, or a job still
    ///   incomplete when the deadline passes
    /// - `AppError::RateLimited` - HTTP 429
    /// - `AppError::ConnectionFailed` - network error
    pub async fn query(&self, sql: &str) -> Result<TabularData, AppError> {
        debug!("[BQ] Query: {}", sql);
        let started = Instant::now();

        let mut response = self.start_query(sql).await?;
        let mut job: Option<WireJobReference> = None;
        let mut data = TabularData::default();
        let mut page_count: u32 = 0;

        loop {
            if let Some(reference) = response.job_reference.take() {
                job = Some(reference);
            }

            if !response.job_complete {
                let reference = job.as_ref().ok_or_else(|| {
                    AppError::Warehouse("Incomplete query response without a job reference".into())
                })?;
                if started.elapsed() >= self.deadline {
                    return Err(AppError::Warehouse(format!(
                        "Query job {} did not complete within {}s",
                        reference.job_id,
                        self.deadline.as_secs()
                    )));
                }
                tokio::time::sleep(self.poll_interval).await;
                response = self.fetch_results(reference, None).await?;
                continue;
            }

            page_count += 1;
            if data.columns.is_empty() {
                if let Some(schema) = response.schema.take() {
                    data.columns = schema.fields.into_iter().map(|f| f.name).collect();
                }
            }
            data.rows.extend(
                response
                    .rows
                    .drain(..)
                    .map(|row| row.f.iter().map(|cell| cell_to_string(&cell.v)).collect()),
            );

            let Some(token) = response.page_token.take() else {
                break;
            };
            let reference = job.as_ref().ok_or_else(|| {
                AppError::Warehouse("Paged query response without a job reference".into())
            })?;
            response = self.fetch_results(reference, Some(&token)).await?;
        }

        info!(
            "[BQ] Query complete: {} rows, {} columns, {} page(s)",
            data.rows.len(),
            data.columns.len(),
            page_count
        );

        Ok(data)
    }

    /// POST `projects/{project}/queries`.
    async fn start_query(&self, sql: &str) -> Result<WireQueryResponse, AppError> {
        let url = self
            .client
            .build_url(&format!("projects/{}/queries", self.client.project_id()))?;

        let body = serde_json::to_vec(&WireQueryRequest {
            query: sql,
            use_legacy_sql: false,
            max_results: self.page_size,
            timeout_ms: self.timeout_ms,
        })
        .map_err(|e| AppError::Internal(format!("Failed to serialize query request: {}", e)))?;

        let response = self.client.request_authed(Method::POST, url, Some(body)).await?;
        parse_response(response).await
    }

    /// GET `projects/{project}/queries/{jobId}`.
    async fn fetch_results(
        &self,
        job: &WireJobReference,
        page_token: Option<&str>,
    ) -> Result<WireQueryResponse, AppError> {
        let mut url = self.client.build_url(&format!(
            "projects/{}/queries/{}",
            self.client.project_id(),
            job.job_id
        ))?;

        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("maxResults", &self.page_size.to_string());
            pairs.append_pair("timeoutMs", &self.timeout_ms.to_string());
            if let Some(location) = &job.location {
                pairs.append_pair("location", location);
            }
            if let Some(token) = page_token {
                pairs.append_pair("pageToken", token);
            }
        }

        let response = self.client.request_authed(Method::GET, url, None).await?;
        parse_response(response).await
    }
}

impl WarehouseQuery for QueryClient {
    fn run_query<'a>(
        &'a self,
        sql: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TabularData, AppError>> + Send + 'a>> {
        Box::pin(self.query(sql))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Response Handling
// ─────────────────────────────────────────────────────────────────────────────

async fn parse_response(response: reqwest::Response) -> Result<WireQueryResponse, AppError> {
    let status = response.status();
    if !status.is_success() {
        return Err(map_error_response(response, status).await);
    }

    response
        .json()
        .await
        .map_err(|e| AppError::Warehouse(format!("Failed to parse query response: {}", e)))
}

/// Parses an error response body into an `AppError`.
async fn map_error_response(response: reqwest::Response, status: reqwest::StatusCode) -> AppError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        return AppError::RateLimited { retry_after_secs };
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("Unable to read error body"));

    if let Ok(envelope) = serde_json::from_str::<WireErrorEnvelope>(&body) {
        let reason = envelope
            .error
            .errors
            .iter()
            .find_map(|item| item.reason.clone())
            .or(envelope.error.status)
            .unwrap_or_else(|| status.as_u16().to_string());
        return AppError::Warehouse(format!("[{}] {}", reason, envelope.error.message));
    }

    AppError::Warehouse(format!(
        "HTTP {} - {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown error")
    ))
}

/// Stringifies one cell. Null becomes empty; nested values become compact JSON.
fn cell_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::credentials::WarehouseCredentials;
    use secrecy::SecretString;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const QUERIES_PATH: &str = "/projects/billing-proj/queries";
    const JOB_PATH: &str = "/projects/billing-proj/queries/job_1";

    /// Helper to create a QueryClient against the mock server.
    fn create_test_client(base_url: &str) -> QueryClient {
        let creds = WarehouseCredentials {
            project_id: "billing-proj".into(),
            access_token: SecretString::from("test_token".to_string()),
        };
        let settings = WarehouseSettings {
            base_url: base_url.to_string(),
            page_size: 2,
            poll_interval_ms: 1,
            ..WarehouseSettings::default()
        };
        QueryClient::new(BigQueryClient::new(creds, &settings).unwrap(), &settings)
    }

    fn schema() -> Value {
        serde_json::json!({"fields": [{"name": "id", "type": "INTEGER"}, {"name": "name", "type": "STRING"}]})
    }

    fn rows(ids: &[i64]) -> Value {
        Value::Array(
            ids.iter()
                .map(|i| serde_json::json!({"f": [{"v": i.to_string()}, {"v": format!("n{}", i)}]}))
                .collect(),
        )
    }

    fn job_reference() -> Value {
        serde_json::json!({"projectId": "billing-proj", "jobId": "job_1", "location": "US"})
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Pagination Flow
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_pagination_fetches_all_pages() {
        let mock_server = MockServer::start().await;
        let client = create_test_client(&mock_server.uri());

        Mock::given(method("POST"))
            .and(path(QUERIES_PATH))
            .and(body_partial_json(serde_json::json!({
                "query": "SELECT * FROM `p.d.t`",
                "useLegacySql": false,
                "maxResults": 2
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jobReference": job_reference(),
                "jobComplete": true,
                "schema": schema(),
                "rows": rows(&[1, 2]),
                "pageToken": "page-2",
                "totalRows": "3"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path(JOB_PATH))
            .and(query_param("pageToken", "page-2"))
            .and(query_param("location", "US"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jobReference": job_reference(),
                "jobComplete": true,
                "schema": schema(),
                "rows": rows(&[3]),
                "totalRows": "3"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let data = client.query("SELECT * FROM `p.d.t`").await.expect("Query should succeed");

        assert_eq!(data.columns, vec!["id", "name"]);
        assert_eq!(data.row_count(), 3);
        assert_eq!(data.rows[2], vec!["3", "n3"]);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Polling
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_incomplete_job_is_polled() {
        let mock_server = MockServer::start().await;
        let client = create_test_client(&mock_server.uri());

        Mock::given(method("POST"))
            .and(path(QUERIES_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jobReference": job_reference(),
                "jobComplete": false
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path(JOB_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jobReference": job_reference(),
                "jobComplete": true,
                "schema": schema(),
                "rows": rows(&[7])
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let data = client.query("SELECT 1").await.expect("Query should succeed");
        assert_eq!(data.rows, vec![vec!["7".to_string(), "n7".to_string()]]);
    }

    #[tokio::test]
    async fn test_job_incomplete_past_deadline_is_warehouse_error() {
        let mock_server = MockServer::start().await;
        let creds = WarehouseCredentials {
            project_id: "billing-proj".into(),
            access_token: SecretString::from("test_token".to_string()),
        };
        let settings = WarehouseSettings {
            base_url: mock_server.uri(),
            poll_interval_ms: 50,
            query_deadline_secs: 1,
            ..WarehouseSettings::default()
        };
        let client = QueryClient::new(BigQueryClient::new(creds, &settings).unwrap(), &settings);

        let incomplete = serde_json::json!({
            "jobReference": job_reference(),
            "jobComplete": false
        });
        Mock::given(method("POST"))
            .and(path(QUERIES_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(incomplete.clone()))
            .expect(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path(JOB_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(incomplete))
            .mount(&mock_server)
            .await;

        let result = client.query("SELECT 1").await;

        match result {
            Err(AppError::Warehouse(msg)) => assert!(msg.contains("did not complete"), "{}", msg),
            other => panic!("Expected Warehouse error, got {:?}", other),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Empty results and cell conversion
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_empty_result_keeps_columns() {
        let mock_server = MockServer::start().await;
        let client = create_test_client(&mock_server.uri());

        Mock::given(method("POST"))
            .and(path(QUERIES_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jobReference": job_reference(),
                "jobComplete": true,
                "schema": schema(),
                "totalRows": "0"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let data = client.query("SELECT * FROM `p.d.t` WHERE c = 'none'").await.unwrap();
        assert_eq!(data.row_count(), 0);
        assert_eq!(data.columns, vec!["id", "name"]);
    }

    #[test]
    fn test_cell_conversion() {
        assert_eq!(cell_to_string(&Value::Null), "");
        assert_eq!(cell_to_string(&serde_json::json!("abc")), "abc");
        assert_eq!(cell_to_string(&serde_json::json!(true)), "true");
        assert_eq!(cell_to_string(&serde_json::json!(12)), "12");
        assert_eq!(
            cell_to_string(&serde_json::json!([{"v": "a"}, {"v": "b"}])),
            r#"[{"v":"a"},{"v":"b"}]"#
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Error Parsing
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_error_response_parsing() {
        let mock_server = MockServer::start().await;
        let client = create_test_client(&mock_server.uri());

        Mock::given(method("POST"))
            .and(path(QUERIES_PATH))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {
                    "code": 400,
                    "message": "Unrecognized name: bogus at [1:8]",
                    "status": "INVALID_ARGUMENT",
                    "errors": [{"reason": "invalidQuery", "message": "Unrecognized name: bogus"}]
                }
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        match client.query("SELECT bogus FROM `p.d.t`").await {
            Err(AppError::Warehouse(msg)) => {
                assert!(msg.contains("invalidQuery"), "Error should contain reason: {}", msg);
                assert!(msg.contains("Unrecognized name"), "Error should contain message: {}", msg);
            }
            other => panic!("Expected Warehouse error, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_generic_http_error() {
        let mock_server = MockServer::start().await;
        let client = create_test_client(&mock_server.uri());

        Mock::given(method("POST"))
            .and(path(QUERIES_PATH))
            .respond_with(ResponseTemplate::new(500).set_body_string("Internal Server Error"))
            .expect(1)
            .mount(&mock_server)
            .await;

        match client.query("SELECT 1").await {
            Err(AppError::Warehouse(msg)) => assert!(msg.contains("500"), "got: {}", msg),
            other => panic!("Expected Warehouse error, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rate_limit_reads_retry_after() {
        let mock_server = MockServer::start().await;
        let client = create_test_client(&mock_server.uri());

        Mock::given(method("POST"))
            .and(path(QUERIES_PATH))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "30"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let result = client.query("SELECT 1").await;
        assert!(matches!(
            result,
            Err(AppError::RateLimited {
                retry_after_secs: Some(30)
            })
        ));
    }
}
