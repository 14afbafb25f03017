//! secmeta scan: client for the external scan service.
//!
//! Endpoints, relative to the configured base URL:
//! - `GET  scanresults` aggregate results for every known pod and image
//! - `POST image` / `POST pod` upsert one record
//! - `DELETE image` / `DELETE pod` with a `{"name": ...}` body
//! - `PUT  allimages` / `PUT allpods` replace the full inventory

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use reqwest::{RequestBuilder, Response, StatusCode};
use secmeta_core::{ImageRef, Labels, ScanResults};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("invalid scan service url {0:?}")]
    Url(String),
    #[error("http error calling {url}: {message}")]
    Http { url: String, message: String },
    #[error("{method} {url} returned {status}")]
    Status { method: &'static str, url: String, status: u16 },
    #[error("undecodable response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl ScanError {
    pub fn is_not_found(&self) -> bool { matches!(self, ScanError::Status { status: 404, .. }) }
}

pub type Result<T> = std::result::Result<T, ScanError>;

/// Canonical image record sent to the scan service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    pub name: String,
    pub digest: String,
    pub pull_spec: String,
}

impl From<&ImageRef> for ImageRecord {
    fn from(r: &ImageRef) -> Self {
        Self { name: r.name.clone(), digest: r.digest.clone(), pull_spec: r.pull_spec() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRecord {
    pub name: String,
    pub image: ImageRecord,
}

/// Canonical pod record sent to the scan service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodRecord {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default)]
    pub labels: Labels,
    pub containers: Vec<ContainerRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeleteNotice<'a> {
    name: &'a str,
}

#[async_trait::async_trait]
pub trait ScanService: Send + Sync {
    async fn scan_results(&self) -> Result<ScanResults>;
    async fn upsert_image(&self, image: &ImageRecord) -> Result<()>;
    /// Unknown names are not an error.
    async fn delete_image(&self, name: &str) -> Result<()>;
    async fn upsert_pod(&self, pod: &PodRecord) -> Result<()>;
    /// Unknown names are not an error.
    async fn delete_pod(&self, name: &str) -> Result<()>;
    async fn replace_images(&self, images: &[ImageRecord]) -> Result<()>;
    async fn replace_pods(&self, pods: &[PodRecord]) -> Result<()>;
}

pub struct HttpScanService {
    client: reqwest::Client,
    base: String,
}

impl HttpScanService {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let parsed = reqwest::Url::parse(base_url).map_err(|_| ScanError::Url(base_url.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ScanError::Url(base_url.to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ScanError::Http { url: base_url.to_string(), message: e.to_string() })?;
        Ok(Self { client, base: base_url.trim_end_matches('/').to_string() })
    }

    pub fn base_url(&self) -> &str { &self.base }

    fn url(&self, path: &str) -> String { format!("{}/{}", self.base, path) }

    async fn send(&self, method: &'static str, url: &str, builder: RequestBuilder, allow_missing: bool) -> Result<Response> {
        let t0 = Instant::now();
        let res = builder.send().await;
        histogram!("secmeta_scan_request_ms", t0.elapsed().as_secs_f64() * 1000.0, "method" => method);
        let res = res.map_err(|e| {
            counter!("secmeta_scan_errors_total", 1u64, "method" => method);
            ScanError::Http { url: url.to_string(), message: e.to_string() }
        })?;
        let status = res.status();
        debug!(method, url, status = status.as_u16(), "scan service replied");
        if status.is_success() || (allow_missing && status == StatusCode::NOT_FOUND) {
            return Ok(res);
        }
        counter!("secmeta_scan_errors_total", 1u64, "method" => method);
        Err(ScanError::Status { method, url: url.to_string(), status: status.as_u16() })
    }

    async fn post_json<T: Serialize + Sync>(&self, path: &str, body: &T) -> Result<()> {
        let url = self.url(path);
        self.send("POST", &url, self.client.post(&url).json(body), false).await.map(|_| ())
    }

    async fn put_json<T: Serialize + Sync>(&self, path: &str, body: &T) -> Result<()> {
        let url = self.url(path);
        self.send("PUT", &url, self.client.put(&url).json(body), false).await.map(|_| ())
    }

    async fn delete_named(&self, path: &str, name: &str) -> Result<()> {
        let url = self.url(path);
        self.send("DELETE", &url, self.client.delete(&url).json(&DeleteNotice { name }), true).await.map(|_| ())
    }
}

#[async_trait::async_trait]
impl ScanService for HttpScanService {
    async fn scan_results(&self) -> Result<ScanResults> {
        let url = self.url("scanresults");
        let res = self.send("GET", &url, self.client.get(&url), false).await?;
        if res.status() != StatusCode::OK {
            return Err(ScanError::Status { method: "GET", url, status: res.status().as_u16() });
        }
        let body = res.bytes().await.map_err(|e| ScanError::Http { url: url.clone(), message: e.to_string() })?;
        decode_results(&body).map_err(|message| ScanError::Decode { url, message })
    }

    async fn upsert_image(&self, image: &ImageRecord) -> Result<()> { self.post_json("image", image).await }

    async fn delete_image(&self, name: &str) -> Result<()> { self.delete_named("image", name).await }

    async fn upsert_pod(&self, pod: &PodRecord) -> Result<()> { self.post_json("pod", pod).await }

    async fn delete_pod(&self, name: &str) -> Result<()> { self.delete_named("pod", name).await }

    async fn replace_images(&self, images: &[ImageRecord]) -> Result<()> {
        self.put_json("allimages", &serde_json::json!({ "images": images })).await
    }

    async fn replace_pods(&self, pods: &[PodRecord]) -> Result<()> {
        self.put_json("allpods", &serde_json::json!({ "pods": pods })).await
    }
}

/// An empty or `null` body is an empty result set.
pub fn decode_results(body: &[u8]) -> std::result::Result<ScanResults, String> {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(ScanResults::default());
    }
    serde_json::from_slice::<Option<ScanResults>>(body).map(Option::unwrap_or_default).map_err(|e| e.to_string())
}
