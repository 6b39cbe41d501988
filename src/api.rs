//! WooCommerce store API client.
//!
//! Provides authenticated HTTP communication with the store's
//! `wp-json/wc/v3` REST API, used for catalog refresh, order push, customer
//! push and stock reconciliation.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use zeroize::Zeroize;

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used specifically for the lightweight connectivity test.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

/// WooCommerce caps `per_page` at 100.
pub const PAGE_SIZE: u32 = 100;

/// Safety net for runaway pagination.
const MAX_PAGES: u32 = 200;

const REST_PREFIX: &str = "/wp-json/wc/v3";

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the store URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/wp-json...` segment
pub fn normalize_store_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    if let Some(idx) = url.find("/wp-json") {
        url.truncate(idx);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// Decode a pasted connection string: raw JSON, or URL-safe/standard base64
/// of a JSON object.
pub fn decode_connection_string(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded)
        .ok()
        .filter(Value::is_object)
}

/// Reject paths that would escape the REST prefix.
pub fn validate_store_path(path: &str) -> Result<(), String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err("Missing API path".into());
    }
    if trimmed.contains("..") {
        return Err("Invalid API path".into());
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return Err("Absolute URLs are not allowed".into());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach store at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid store URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "Store API key is invalid or revoked".to_string(),
        403 => "Store API key lacks permission for this resource".to_string(),
        404 => "Store endpoint not found".to_string(),
        s if s >= 500 => format!("Store server error (HTTP {s})"),
        s => format!("Unexpected response from store (HTTP {s})"),
    }
}

/// True for errors worth retrying later (network, timeouts, 5xx, 429).
pub fn is_transient_error(error: &str) -> bool {
    let lower = error.to_lowercase();
    lower.contains("cannot reach")
        || lower.contains("timed out")
        || lower.contains("network error")
        || lower.contains("server error")
        || lower.contains("(http 5")
        || lower.contains("http 429")
}

/// Build the error message for a non-2xx response body.
fn error_detail(status: StatusCode, body_text: &str) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(body_text) {
        let message = json
            .get("message")
            .or_else(|| json.get("error"))
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .unwrap_or_else(|| status_error(status));
        return match json.get("code").and_then(Value::as_str) {
            Some(code) => format!("{message} [{code}] (HTTP {})", status.as_u16()),
            None => format!("{message} (HTTP {})", status.as_u16()),
        };
    }
    if body_text.trim().is_empty() {
        format!("{} (HTTP {})", status_error(status), status.as_u16())
    } else {
        format!(
            "{} (HTTP {}): {}",
            status_error(status),
            status.as_u16(),
            body_text.trim()
        )
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Result of a connectivity test.
#[derive(Debug, serde::Serialize)]
pub struct ConnectivityResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Authenticated client for one WooCommerce store.
#[derive(Clone)]
pub struct StoreClient {
    base_url: String,
    consumer_key: String,
    consumer_secret: String,
    http: Client,
}

impl std::fmt::Debug for StoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreClient")
            .field("base_url", &self.base_url)
            .field("consumer_key", &"<redacted>")
            .finish()
    }
}

impl Drop for StoreClient {
    fn drop(&mut self) {
        self.consumer_secret.zeroize();
    }
}

impl StoreClient {
    pub fn new(url: &str, consumer_key: String, consumer_secret: String) -> Result<Self, String> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {e}"))?;
        Ok(Self {
            base_url: normalize_store_url(url),
            consumer_key,
            consumer_secret,
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}{REST_PREFIX}/{}",
            self.base_url,
            path.trim_start_matches('/')
        )
    }

    /// Perform an authenticated request against `wp-json/wc/v3/{path}`.
    ///
    /// Returns the JSON body (or `null` for empty responses) and the
    /// `X-WP-TotalPages` header when present.
    pub async fn request_with_pages(
        &self,
        method: &str,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<(Value, Option<u32>), String> {
        validate_store_path(path)?;
        let http_method: Method = method
            .to_uppercase()
            .parse()
            .map_err(|_| format!("Invalid HTTP method: {method}"))?;
        let url = self.endpoint(path);
        debug!(%method, %path, "store request");

        let mut req = self
            .http
            .request(http_method, &url)
            .basic_auth(&self.consumer_key, Some(&self.consumer_secret))
            .query(query);
        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        let total_pages = resp
            .headers()
            .get("x-wp-totalpages")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u32>().ok());

        let body_text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(error_detail(status, &body_text));
        }
        if body_text.trim().is_empty() {
            return Ok((Value::Null, total_pages));
        }
        let parsed = serde_json::from_str(&body_text)
            .map_err(|e| format!("Invalid JSON from store: {e}"))?;
        Ok((parsed, total_pages))
    }

    pub async fn request(
        &self,
        method: &str,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value, String> {
        self.request_with_pages(method, path, query, body)
            .await
            .map(|(v, _)| v)
    }

    pub async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value, String> {
        self.request("GET", path, query, None).await
    }

    /// Fetch every page of a list endpoint.
    pub async fn get_all_pages(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<Value>, String> {
        let mut out = Vec::new();
        let mut page: u32 = 1;
        loop {
            let mut q: Vec<(&str, String)> = query.to_vec();
            q.push(("per_page", PAGE_SIZE.to_string()));
            q.push(("page", page.to_string()));
            let (body, total_pages) = self.request_with_pages("GET", path, &q, None).await?;
            let items = body.as_array().cloned().unwrap_or_default();
            let fetched = items.len();
            out.extend(items);

            let done = match total_pages {
                Some(total) => page >= total,
                None => fetched < PAGE_SIZE as usize,
            };
            if done || fetched == 0 || page >= MAX_PAGES {
                break;
            }
            page += 1;
        }
        debug!(%path, count = out.len(), "fetched all pages");
        Ok(out)
    }

    /// Lightweight reachability + auth check against the store.
    pub async fn test_connectivity(&self) -> ConnectivityResult {
        let start = Instant::now();
        let url = self.endpoint("system_status");
        let result = self
            .http
            .get(&url)
            .timeout(CONNECTIVITY_TIMEOUT)
            .basic_auth(&self.consumer_key, Some(&self.consumer_secret))
            .send()
            .await;
        let latency = start.elapsed().as_millis() as u64;

        match result {
            Ok(resp) if resp.status().is_success() => {
                info!(latency_ms = latency, "store connectivity test passed");
                ConnectivityResult {
                    success: true,
                    latency_ms: Some(latency),
                    error: None,
                }
            }
            Ok(resp) => ConnectivityResult {
                success: false,
                latency_ms: Some(latency),
                error: Some(status_error(resp.status())),
            },
            Err(e) => ConnectivityResult {
                success: false,
                latency_ms: None,
                error: Some(friendly_error(&self.base_url, &e)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::http::HeaderMap;
    use axum::routing::get;
    use axum::{Json, Router};
    use std::collections::HashMap;

    #[test]
    fn test_normalize_store_url() {
        assert_eq!(normalize_store_url("shop.example/"), "https://shop.example");
        assert_eq!(
            normalize_store_url("https://shop.example/wp-json/wc/v3/"),
            "https://shop.example"
        );
        assert_eq!(
            normalize_store_url("localhost:8080"),
            "http://localhost:8080"
        );
        assert_eq!(
            normalize_store_url("  http://shop.example//  "),
            "http://shop.example"
        );
    }

    #[test]
    fn test_decode_connection_string() {
        let json = r#"{"url":"https://shop.example","ck":"ck_1","cs":"cs_1"}"#;
        let encoded = BASE64_STANDARD.encode(json);
        let decoded = decode_connection_string(&encoded).unwrap();
        assert_eq!(decoded["ck"], "ck_1");
        assert_eq!(decode_connection_string(json).unwrap()["cs"], "cs_1");
        assert!(decode_connection_string("short").is_none());
    }

    #[test]
    fn test_validate_store_path() {
        assert!(validate_store_path("products/12").is_ok());
        assert!(validate_store_path("../admin").is_err());
        assert!(validate_store_path("https://evil.example").is_err());
        assert!(validate_store_path("  ").is_err());
    }

    #[test]
    fn test_error_detail_prefers_store_message() {
        let detail = error_detail(
            StatusCode::BAD_REQUEST,
            r#"{"code":"woocommerce_rest_invalid_id","message":"Invalid ID."}"#,
        );
        assert_eq!(
            detail,
            "Invalid ID. [woocommerce_rest_invalid_id] (HTTP 400)"
        );
        let detail = error_detail(StatusCode::BAD_GATEWAY, "");
        assert!(is_transient_error(&detail));
        assert!(!is_transient_error("Invalid ID. (HTTP 400)"));
    }

    #[tokio::test]
    async fn test_get_all_pages_follows_total_pages_header() {
        async fn products(
            headers: HeaderMap,
            Query(q): Query<HashMap<String, String>>,
        ) -> (HeaderMap, Json<Value>) {
            assert!(headers.get("authorization").is_some());
            let page: u32 = q.get("page").and_then(|p| p.parse().ok()).unwrap_or(1);
            let mut out = HeaderMap::new();
            out.insert("x-wp-totalpages", "2".parse().unwrap());
            let body = if page == 1 {
                serde_json::json!([{ "id": 1 }, { "id": 2 }])
            } else {
                serde_json::json!([{ "id": 3 }])
            };
            (out, Json(body))
        }

        let app = Router::new().route("/wp-json/wc/v3/products", get(products));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client =
            StoreClient::new(&format!("http://{addr}"), "ck".into(), "cs".into()).unwrap();
        let all = client.get_all_pages("products", &[]).await.unwrap();
        let ids: Vec<i64> = all.iter().filter_map(|v| v["id"].as_i64()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
