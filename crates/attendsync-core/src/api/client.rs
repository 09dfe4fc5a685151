//! API client for the KES-SMART reconciliation endpoints.
//!
//! This module provides the `ApiClient` struct for replaying offline
//! attendance and form submissions against the server of record, and for
//! probing connectivity through the version endpoint.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{header, Client};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::cache::{RequestKey, ResponseCache};
use crate::sync::{ConnectivityProbe, Reconciler};

use super::payload::{AttendanceBatch, AttendancePayload, BatchResponse, FormPayload, FormResponse, VersionInfo};
use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

const SYNC_ATTENDANCE_PATH: &str = "api/sync-attendance.php";
const CHECK_VERSION_PATH: &str = "api/check-version.php";

/// HTTP request timeout in seconds.
/// 30s allows for slow school uplinks while failing fast enough for the kiosk.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
/// 3 retries with exponential backoff usually succeeds without excessive delay.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
/// 1 second is polite to the server while not holding up the sync pass too long.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Default upper bound on records per attendance batch.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 50;

/// API client for the server of record.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
    max_batch_size: usize,
    cache: Option<(ResponseCache, String)>,
}

impl ApiClient {
    /// Create a new API client for the server at `base_url`
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            cache: None,
        })
    }

    /// Set the bearer token for authenticated requests
    pub fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    pub fn with_max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = max.max(1);
        self
    }

    /// Serve `check_version` from `bucket` of `cache` when the network is unavailable.
    pub fn with_response_cache(mut self, cache: ResponseCache, bucket: impl Into<String>) -> Self {
        self.cache = Some((cache, bucket.into()));
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn auth_headers(&self) -> Result<header::HeaderMap> {
        let mut headers = header::HeaderMap::new();
        if let Some(ref token) = self.token {
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&format!("Bearer {}", token))?,
            );
        }
        Ok(headers)
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(response: reqwest::Response) -> Result<Option<reqwest::Response>> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            // Rate limited - signal to retry
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body).into())
        }
    }

    async fn post<T: DeserializeOwned, B: Serialize>(&self, url: &str, body: &B) -> Result<T> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = self
                .client
                .post(url)
                .headers(self.auth_headers()?)
                .json(body)
                .send()
                .await
                .map_err(ApiError::from)
                .with_context(|| format!("Failed to send POST request to {}", url))?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => {
                    return response.json().await
                        .with_context(|| format!("Failed to parse JSON response from {}", url));
                }
                None => {
                    // Rate limited
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited.into());
                    }
                    warn!(url = url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2; // Exponential backoff
                }
            }
        }
    }

    // ===== Reconciliation =====

    /// Submit a batch of offline attendance records.
    pub async fn submit_attendance(&self, batch: &[AttendancePayload]) -> Result<BatchResponse> {
        if batch.len() > self.max_batch_size {
            return Err(ApiError::BatchTooLarge {
                size: batch.len(),
                max: self.max_batch_size,
            }
            .into());
        }
        let url = self.url(SYNC_ATTENDANCE_PATH);
        debug!(records = batch.len(), "Submitting attendance batch");
        self.post(&url, &AttendanceBatch { offline_data: batch }).await
    }

    /// Submit one queued form to its type-specific endpoint.
    pub async fn submit_form(&self, form: &FormPayload) -> Result<FormResponse> {
        super::payload::validate_form_type(&form.form_type)?;
        let url = self.url(&form.endpoint());
        debug!(record_id = %form.client_record_id, form_type = %form.form_type, "Submitting form");
        self.post(&url, &form.data).await
    }

    /// Fetch the server version, network first, falling back to the cached copy.
    pub async fn check_version(&self) -> Result<VersionInfo> {
        let url = self.url(CHECK_VERSION_PATH);
        match self.fetch_version(&url).await {
            Ok(info) => Ok(info),
            Err(e) => match self.cached_version(&url) {
                Some(info) => {
                    debug!(error = %e, "Version check failed, using cached response");
                    Ok(info)
                }
                None => Err(e),
            },
        }
    }

    async fn fetch_version(&self, url: &str) -> Result<VersionInfo> {
        let response = self
            .client
            .get(url)
            .header(header::CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(ApiError::from)
            .with_context(|| format!("Failed to send GET request to {}", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, &body).into());
        }

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.context("Failed to read version response")?;
        let info: VersionInfo = serde_json::from_slice(&body)
            .with_context(|| format!("Failed to parse JSON response from {}", url))?;

        if let Some((cache, bucket)) = &self.cache {
            if let Err(e) = cache.put(bucket, &RequestKey::get(url), status, content_type.as_deref(), &body) {
                debug!(error = %e, "Failed to cache version response");
            }
        }
        Ok(info)
    }

    fn cached_version(&self, url: &str) -> Option<VersionInfo> {
        let (cache, bucket) = self.cache.as_ref()?;
        let (_, body) = cache.get(bucket, &RequestKey::get(url)).ok()??;
        let mut info: VersionInfo = serde_json::from_slice(&body).ok()?;
        info.from_cache = true;
        Some(info)
    }
}

impl Reconciler for ApiClient {
    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    async fn submit_attendance(&self, batch: Vec<AttendancePayload>) -> Result<BatchResponse> {
        ApiClient::submit_attendance(self, &batch).await
    }

    async fn submit_form(&self, form: FormPayload) -> Result<FormResponse> {
        ApiClient::submit_form(self, &form).await
    }
}

impl ConnectivityProbe for ApiClient {
    /// Reachable means the version endpoint answered from the network.
    async fn probe(&self) -> bool {
        let url = self.url(CHECK_VERSION_PATH);
        self.fetch_version(&url).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RecordId, ScanType};

    // Nothing listens on the discard port, so connections are refused immediately.
    const UNREACHABLE: &str = "http://127.0.0.1:9/kes-smart/";

    fn payload(id: u64) -> AttendancePayload {
        AttendancePayload {
            client_record_id: RecordId(id),
            scan_type: ScanType::Manual,
            action: "scan_manual",
            student_id: Some(id.to_string()),
            qr_data: None,
            lrn: None,
            subject_id: Some("1".to_string()),
            location: "Main Gate".to_string(),
            notes: String::new(),
            teacher_id: None,
            timestamp: "2026-10-19T07:05:00Z".to_string(),
            offline_timestamp: 0,
            date: "2026-10-19".to_string(),
            dedup_key: format!("{}:1:2026-10-19", id),
            offline_sync: true,
        }
    }

    #[test]
    fn test_url_joining() {
        let client = ApiClient::new(UNREACHABLE).expect("client");
        assert_eq!(client.base_url(), "http://127.0.0.1:9/kes-smart");
        assert_eq!(
            client.url(SYNC_ATTENDANCE_PATH),
            "http://127.0.0.1:9/kes-smart/api/sync-attendance.php"
        );
    }

    #[tokio::test]
    async fn test_oversized_batch_rejected_before_sending() {
        let client = ApiClient::new(UNREACHABLE).expect("client").with_max_batch_size(2);
        let batch: Vec<_> = (1..=3).map(payload).collect();
        let err = client.submit_attendance(&batch).await.expect_err("too large");
        assert!(matches!(
            err.downcast_ref::<ApiError>(),
            Some(ApiError::BatchTooLarge { size: 3, max: 2 })
        ));
    }

    #[tokio::test]
    async fn test_check_version_falls_back_to_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ResponseCache::new(dir.path().to_path_buf()).expect("cache");
        let client = ApiClient::new(UNREACHABLE)
            .expect("client")
            .with_response_cache(cache.clone(), "kes-smart-api-v1");

        assert!(client.check_version().await.is_err());

        let url = client.url(CHECK_VERSION_PATH);
        cache
            .put(
                "kes-smart-api-v1",
                &RequestKey::get(url),
                200,
                Some("application/json"),
                br#"{"version":"1.0.1","timestamp":1792393500}"#,
            )
            .expect("put");

        let info = client.check_version().await.expect("cached");
        assert_eq!(info.version, "1.0.1");
        assert!(info.from_cache);
        assert!(!client.probe().await);
    }
}
