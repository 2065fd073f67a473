//! Client for the fetcher sidecar that runs next to every runtime and
//! builder container.
//!
//! All three calls retry transient failures: connection errors, 5xx and
//! 429 back off exponentially from 50ms, capped at 2s, for at most 20
//! attempts. Any other 4xx is final.

use std::time::Duration;

use fission_core::{Checksum, ConfigMapReference, ObjectMeta, PackageRef, SecretReference};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{info, warn};

use crate::error::{ClientError, ClientResult};
use crate::http::{HttpClient, HttpResponse};

const MAX_ATTEMPTS: u32 = 20;
const MIN_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(2);
const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(120);

// ── Wire types ─────────────────────────────────────────────────────

/// What the fetcher should download. Encoded as an integer on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchType {
    /// The package's source archive.
    Source,
    /// The package's deployment archive.
    #[default]
    Deployment,
    /// A bare URL.
    Url,
}

impl Serialize for FetchType {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let code: u8 = match self {
            Self::Source => 0,
            Self::Deployment => 1,
            Self::Url => 2,
        };
        s.serialize_u8(code)
    }
}

impl<'de> Deserialize<'de> for FetchType {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        match u8::deserialize(d)? {
            0 => Ok(Self::Source),
            1 => Ok(Self::Deployment),
            2 => Ok(Self::Url),
            other => Err(serde::de::Error::custom(format!("unknown fetch type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FetchRequest {
    pub fetch_type: FetchType,
    pub package: PackageRef,
    pub url: String,
    /// Name of the file or directory to write under the shared volume.
    pub filename: String,
    pub secrets: Vec<SecretReference>,
    pub config_maps: Vec<ConfigMapReference>,
    pub keep_archive: bool,
}

/// Tells the runtime where the fetched function lives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadRequest {
    pub filepath: String,
    #[serde(rename = "functionName")]
    pub function_name: String,
    pub url: String,
    #[serde(rename = "FunctionMetadata")]
    pub function_metadata: Option<ObjectMeta>,
    #[serde(rename = "envVersion")]
    pub env_version: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecializeRequest {
    pub fetch_req: FetchRequest,
    pub load_req: LoadRequest,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArchiveUploadRequest {
    pub filename: String,
    pub storage_svc_url: String,
    /// Zip the directory before upload.
    pub archive_package: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveUploadResponse {
    #[serde(rename = "archiveDownloadURL")]
    pub archive_download_url: String,
    pub checksum: Checksum,
}

// ── Client ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct FetcherClient {
    base_url: String,
    http: HttpClient,
    attempt_timeout: Duration,
}

impl FetcherClient {
    pub fn new(fetcher_url: &str) -> Self {
        Self::with_http(fetcher_url, HttpClient::with_keep_alive(None))
    }

    pub fn with_http(fetcher_url: &str, http: HttpClient) -> Self {
        Self {
            base_url: fetcher_url.trim_end_matches('/').to_string(),
            http,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Fetch the deployment archive and load it into the runtime.
    pub async fn specialize(&self, req: &SpecializeRequest) -> ClientResult<()> {
        self.post_with_retry("specialize", req).await.map(drop)
    }

    pub async fn fetch(&self, req: &FetchRequest) -> ClientResult<()> {
        self.post_with_retry("fetch", req).await.map(drop)
    }

    /// Push a build artifact to the storage service.
    pub async fn upload(&self, req: &ArchiveUploadRequest) -> ClientResult<ArchiveUploadResponse> {
        let url = format!("{}/upload", self.base_url);
        self.post_with_retry("upload", req).await?.json(&url)
    }

    async fn post_with_retry<T: Serialize>(&self, endpoint: &str, body: &T) -> ClientResult<HttpResponse> {
        let url = format!("{}/{endpoint}", self.base_url);
        let mut attempt = 0;
        loop {
            let err = match self.http.post_json(&url, body, self.attempt_timeout).await {
                Ok(resp) if resp.status.as_u16() == 200 => return Ok(resp),
                Ok(resp) => match resp.error_for_status(&url) {
                    Ok(resp) => ClientError::Status {
                        url: url.clone(),
                        status: resp.status.as_u16(),
                        body: resp.text(),
                    },
                    Err(e) => e,
                },
                Err(e) => e,
            };
            if !is_retryable(&err) {
                return Err(err);
            }
            attempt += 1;
            if attempt >= MAX_ATTEMPTS {
                warn!(%url, attempts = attempt, error = %err, "fetcher request failed after max retries");
                return Err(err);
            }
            let delay = backoff(attempt - 1);
            info!(%url, attempt, ?delay, error = %err, "retrying fetcher request");
            tokio::time::sleep(delay).await;
        }
    }
}

fn is_retryable(err: &ClientError) -> bool {
    match err.status() {
        Some(429) => true,
        Some(status) => !(400..500).contains(&status),
        None => !matches!(err, ClientError::Encode(_) | ClientError::InvalidUrl { .. } | ClientError::Request(_)),
    }
}

fn backoff(attempt: u32) -> Duration {
    MIN_BACKOFF
        .checked_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
        .map_or(MAX_BACKOFF, |d| d.min(MAX_BACKOFF))
}
