//! Client for an environment's builder container.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ClientError, ClientResult};
use crate::http::HttpClient;

const BUILD_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const CLEAN_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTHZ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildRequest {
    #[serde(rename = "srcPkgFilename")]
    pub src_pkg_filename: String,
    /// Shell command run by the builder; may reference `$SRC_PKG` and `$DEPLOY_PKG`.
    #[serde(rename = "command", alias = "buildCommand")]
    pub command: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildResponse {
    #[serde(rename = "artifactFilename")]
    pub artifact_filename: String,
    #[serde(rename = "buildLogs")]
    pub build_logs: String,
}

#[derive(Clone)]
pub struct BuilderClient {
    base_url: String,
    http: HttpClient,
}

impl BuilderClient {
    pub fn new(builder_url: &str) -> Self {
        Self {
            base_url: builder_url.trim_end_matches('/').to_string(),
            http: HttpClient::with_keep_alive(None),
        }
    }

    /// Run a build. A failed build answers with a non-2xx status; the
    /// returned [`ClientError::Status`] body then holds the build logs.
    pub async fn build(&self, req: &BuildRequest) -> ClientResult<BuildResponse> {
        let url = format!("{}/build", self.base_url);
        let resp = self.http.post_json(&url, req, BUILD_TIMEOUT).await?;
        if resp.is_success() {
            return resp.json(&url);
        }
        let body = match resp.json::<BuildResponse>(&url) {
            Ok(decoded) if !decoded.build_logs.is_empty() => decoded.build_logs,
            _ => resp.text(),
        };
        Err(ClientError::Status {
            url,
            status: resp.status.as_u16(),
            body,
        })
    }

    /// Remove a build's working directory. Builders that predate the
    /// endpoint answer 405, which counts as success.
    pub async fn clean(&self, name: &str) -> ClientResult<()> {
        let url = format!("{}/clean?name={}", self.base_url, encode_query(name));
        let resp = self.http.delete(&url, CLEAN_TIMEOUT).await?;
        if resp.status.as_u16() == 405 {
            debug!(%url, "builder does not support clean");
            return Ok(());
        }
        resp.error_for_status(&url).map(drop)
    }

    pub async fn healthz(&self) -> ClientResult<()> {
        let url = format!("{}/healthz", self.base_url);
        self.http.get(&url, HEALTHZ_TIMEOUT).await?.error_for_status(&url).map(drop)
    }
}

fn encode_query(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}
