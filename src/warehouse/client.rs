//! BigQuery HTTP client with secure credential handling and safe logging.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::Method;
use secrecy::ExposeSecret;
use tracing::info;
use url::Url;

use crate::config::WarehouseSettings;
use crate::error::AppError;
use crate::warehouse::credentials::WarehouseCredentials;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// User agent string for all warehouse API requests.
const CLIENT_USER_AGENT: &str = "warehouse-extractor/0.1.0";

/// Query parameter keys (case-insensitive) that should have their values redacted.
const SENSITIVE_QUERY_PARAMS: &[&str] = &[
    "access_token",
    "key",
    "token",
    "client_secret",
    "authorization",
];

// ─────────────────────────────────────────────────────────────────────────────
// LoggingMode
// ─────────────────────────────────────────────────────────────────────────────

/// Controls how URLs are sanitized for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoggingMode {
    /// Log only the path component. Strips scheme, host, query, and fragment.
    /// Example: `/bigquery/v2/projects/p/queries`
    #[default]
    PathOnly,

    /// Log path and query parameters, but redact sensitive values.
    /// Example: `/bigquery/v2/projects/p/queries/job_1?location=US&access_token=***`
    PathAndQueryRedacted,
}

impl LoggingMode {
    fn from_settings(settings: &WarehouseSettings) -> Self {
        if settings.log_query_params {
            LoggingMode::PathAndQueryRedacted
        } else {
            LoggingMode::PathOnly
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// URL Sanitization
// ─────────────────────────────────────────────────────────────────────────────

/// Determines if a query parameter key is sensitive and should be redacted.
fn is_sensitive_param(key: &str) -> bool {
    let key_lower = key.to_ascii_lowercase();
    SENSITIVE_QUERY_PARAMS
        .iter()
        .any(|&sensitive| key_lower == sensitive)
}

/// Sanitizes a URL for safe logging. The result never contains the scheme,
/// host, or fragment.
pub fn sanitize_url_for_logs(url: &Url, mode: LoggingMode) -> String {
    let path = url.path();

    match mode {
        LoggingMode::PathOnly => path.to_string(),
        LoggingMode::PathAndQueryRedacted => {
            let query_pairs: Vec<_> = url.query_pairs().collect();
            if query_pairs.is_empty() {
                return path.to_string();
            }

            let redacted_pairs: Vec<String> = query_pairs
                .into_iter()
                .map(|(key, value)| {
                    if is_sensitive_param(&key) {
                        format!("{}=***", key)
                    } else {
                        format!("{}={}", key, value)
                    }
                })
                .collect();

            format!("{}?{}", path, redacted_pairs.join("&"))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// BigQueryClient
// ─────────────────────────────────────────────────────────────────────────────

/// Authenticated HTTP client for the BigQuery REST API.
///
/// Cheap to clone; credentials are shared behind an `Arc`.
#[derive(Clone)]
pub struct BigQueryClient {
    http: reqwest::Client,
    base_url: Url,
    creds: Arc<WarehouseCredentials>,
    logging_mode: LoggingMode,
}

impl BigQueryClient {
    /// Creates a client for the API rooted at `settings.base_url`.
    ///
    /// # Errors
    ///
    /// - `AppError::Config` if the base URL is not a valid URL
    /// - `AppError::Internal` if the HTTP client fails to initialize
    pub fn new(creds: WarehouseCredentials, settings: &WarehouseSettings) -> Result<Self, AppError> {
        let http = build_http_client(Duration::from_secs(settings.request_timeout_secs))?;

        // Url::join replaces the last segment unless the base ends with '/'
        let mut base = settings.base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .map_err(|e| AppError::Config(format!("Invalid warehouse base_url '{}': {}", base, e)))?;

        Ok(Self {
            http,
            base_url,
            creds: Arc::new(creds),
            logging_mode: LoggingMode::from_settings(settings),
        })
    }

    /// Project that queries run in.
    pub fn project_id(&self) -> &str {
        &self.creds.project_id
    }

    /// Builds a full URL by joining a relative API path with the base URL.
    pub fn build_url(&self, path: &str) -> Result<Url, AppError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|_| AppError::Internal(format!("Invalid path: {}", path)))
    }

    /// Executes an authenticated request with timing and sanitized logging.
    ///
    /// # Security
    ///
    /// - Never logs the Authorization header
    /// - Never logs request or response bodies
    /// - Error messages never contain raw URLs or tokens
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConnectionFailed` for transport failures. HTTP
    /// error statuses are returned as responses for the caller to map.
    pub async fn request_authed(
        &self,
        method: Method,
        url: Url,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response, AppError> {
        let start = Instant::now();
        let sanitized_url = sanitize_url_for_logs(&url, self.logging_mode);

        let mut request = self
            .http
            .request(method.clone(), url.as_str())
            .bearer_auth(self.creds.access_token.expose_secret());

        if let Some(body_bytes) = body {
            request = request
                .header("Content-Type", "application/json")
                .body(body_bytes);
        }

        let result = request.send().await;
        let duration_ms = start.elapsed().as_millis();

        match result {
            Ok(response) => {
                info!(
                    "[BQ] {} {} {} {}ms",
                    method,
                    sanitized_url,
                    response.status().as_u16(),
                    duration_ms
                );
                Ok(response)
            }
            Err(e) => {
                let reason = if e.is_timeout() { "timed out" } else { "failed" };
                info!("[BQ] {} {} FAILED {}ms", method, sanitized_url, duration_ms);
                Err(AppError::ConnectionFailed(format!(
                    "Connection to the warehouse {}",
                    reason
                )))
            }
        }
    }
}

/// Builds the configured HTTP client.
fn build_http_client(timeout: Duration) -> Result<reqwest::Client, AppError> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));

    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()
        .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn creds() -> WarehouseCredentials {
        WarehouseCredentials {
            project_id: "billing-proj".into(),
            access_token: SecretString::from("test_token".to_string()),
        }
    }

    fn settings(base_url: &str) -> WarehouseSettings {
        WarehouseSettings {
            base_url: base_url.to_string(),
            ..WarehouseSettings::default()
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // URL Sanitization Tests
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn sanitize_strips_scheme_and_host() {
        let url = Url::parse("https://bigquery.googleapis.com/bigquery/v2/projects/p/queries").unwrap();

        let result = sanitize_url_for_logs(&url, LoggingMode::PathOnly);

        assert_eq!(result, "/bigquery/v2/projects/p/queries");
        assert!(!result.contains("googleapis"));
    }

    #[test]
    fn path_only_excludes_query_string() {
        let url = Url::parse("https://example.com/q/job_1?pageToken=abc&access_token=secret").unwrap();

        let result = sanitize_url_for_logs(&url, LoggingMode::PathOnly);

        assert_eq!(result, "/q/job_1");
        assert!(!result.contains("secret"));
    }

    #[test]
    fn path_and_query_redacted_redacts_sensitive_keys() {
        let url = Url::parse(
            "https://example.com/q/job_1?location=US&access_token=secret1&KEY=secret2#frag",
        )
        .unwrap();

        let result = sanitize_url_for_logs(&url, LoggingMode::PathAndQueryRedacted);

        assert!(result.contains("location=US"));
        assert!(result.contains("access_token=***"));
        assert!(result.contains("KEY=***"));
        assert!(!result.contains("secret1"));
        assert!(!result.contains("secret2"));
        assert!(!result.contains("frag"));
    }

    #[test]
    fn is_sensitive_param_requires_exact_match() {
        assert!(is_sensitive_param("Access_Token"));
        assert!(!is_sensitive_param("pageToken"));
        assert!(!is_sensitive_param("my_token_id"));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Client Tests
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn build_url_joins_relative_paths_under_base() {
        let client = BigQueryClient::new(creds(), &settings("https://example.com/bigquery/v2")).unwrap();

        let url = client.build_url("projects/p/queries").unwrap();
        assert_eq!(url.as_str(), "https://example.com/bigquery/v2/projects/p/queries");

        let url = client.build_url("/projects/p/queries/job_1").unwrap();
        assert_eq!(url.as_str(), "https://example.com/bigquery/v2/projects/p/queries/job_1");
    }

    #[test]
    fn invalid_base_url_is_config_error() {
        let result = BigQueryClient::new(creds(), &settings("not a url"));
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn logging_mode_follows_settings() {
        let client = BigQueryClient::new(creds(), &settings("https://example.com/")).unwrap();
        assert_eq!(client.logging_mode, LoggingMode::PathOnly);

        let verbose = WarehouseSettings {
            log_query_params: true,
            ..settings("https://example.com/")
        };
        let client = BigQueryClient::new(creds(), &verbose).unwrap();
        assert_eq!(client.logging_mode, LoggingMode::PathAndQueryRedacted);
    }

    #[tokio::test]
    async fn request_authed_sends_bearer_token() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/projects/billing-proj/queries/job_1"))
            .and(header("authorization", "Bearer test_token"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = BigQueryClient::new(creds(), &settings(&mock_server.uri())).unwrap();
        let url = client.build_url("projects/billing-proj/queries/job_1").unwrap();

        let response = client.request_authed(Method::GET, url, None).await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
    }

    #[tokio::test]
    async fn unreachable_host_is_connection_failed() {
        // Port 9 (discard) on localhost is almost never listening
        let client = BigQueryClient::new(creds(), &settings("http://127.0.0.1:9/")).unwrap();
        let url = client.build_url("projects/p/queries").unwrap();

        let result = client.request_authed(Method::GET, url, None).await;
        match result {
            Err(AppError::ConnectionFailed(msg)) => {
                assert!(!msg.contains("127.0.0.1"), "Error leaked URL: {}", msg);
            }
            other => panic!("Expected ConnectionFailed, got {:?}", other.map(|r| r.status())),
        }
    }
}
