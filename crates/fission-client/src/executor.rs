//! Client for the executor API, used by the router.
//!
//! Address lookups are plain request/response. Taps are fire-and-forget:
//! they go onto a bounded channel and a background task merges them by
//! service URL and posts one `/v2/tapServices` batch per interval.

use std::collections::HashMap;
use std::time::Duration;

use fission_core::{ExecutorType, Function, ObjectMeta};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::ClientResult;
use crate::http::HttpClient;

const TAP_QUEUE_CAPACITY: usize = 100;
const DEFAULT_TAP_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(300);
const TAP_TIMEOUT: Duration = Duration::from_secs(30);

/// Body of `/v2/tapServices` (as an array), `/v2/unTapService` and
/// `/v2/invalidateService`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapServiceRequest {
    #[serde(rename = "fnMetadata")]
    pub fn_metadata: ObjectMeta,
    #[serde(rename = "fnExecutorType")]
    pub fn_executor_type: ExecutorType,
    #[serde(rename = "serviceURL")]
    pub service_url: String,
}

impl TapServiceRequest {
    /// Only the identity fields of `meta` travel on the wire.
    pub fn new(meta: &ObjectMeta, executor: ExecutorType, service_url: &str) -> Self {
        Self {
            fn_metadata: ObjectMeta {
                name: meta.name.clone(),
                namespace: meta.namespace.clone(),
                uid: meta.uid.clone(),
                resource_version: meta.resource_version.clone(),
                generation: meta.generation,
                ..Default::default()
            },
            fn_executor_type: executor,
            service_url: service_url.to_string(),
        }
    }
}

/// Handle to the executor. Clones share the tap queue.
#[derive(Clone)]
pub struct ExecutorClient {
    base_url: String,
    http: HttpClient,
    lookup_timeout: Duration,
    taps: mpsc::Sender<TapServiceRequest>,
}

impl ExecutorClient {
    pub fn new(executor_url: &str) -> Self {
        Self::with_tap_interval(executor_url, DEFAULT_TAP_INTERVAL)
    }

    /// Must be called inside a tokio runtime; spawns the tap batcher.
    pub fn with_tap_interval(executor_url: &str, tap_interval: Duration) -> Self {
        let base_url = executor_url.trim_end_matches('/').to_string();
        let http = HttpClient::new();
        let (tx, rx) = mpsc::channel(TAP_QUEUE_CAPACITY);
        tokio::spawn(tap_batcher(base_url.clone(), http.clone(), rx, tap_interval));
        Self {
            base_url,
            http,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            taps: tx,
        }
    }

    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    /// Ask the executor for an address serving `function`. Blocks through
    /// specialization when the function is cold.
    pub async fn get_service_for_function(&self, function: &Function) -> ClientResult<String> {
        let url = format!("{}/v2/getServiceForFunction", self.base_url);
        let resp = self
            .http
            .post_json(&url, function, self.lookup_timeout)
            .await?
            .error_for_status(&url)?;
        Ok(resp.text())
    }

    /// Queue a tap. Dropped with a warning when the queue is full.
    pub fn tap_service(&self, meta: &ObjectMeta, executor: ExecutorType, service_url: &str) {
        let req = TapServiceRequest::new(meta, executor, service_url);
        if let Err(e) = self.taps.try_send(req) {
            warn!(function = %meta.name, service_url, error = %e, "dropping service tap");
        }
    }

    /// Return a request slot on `service_url` to the executor.
    pub async fn un_tap_service(
        &self,
        meta: &ObjectMeta,
        executor: ExecutorType,
        service_url: &str,
        timeout: Duration,
    ) -> ClientResult<()> {
        self.post_tap("/v2/unTapService", meta, executor, service_url, timeout)
            .await
    }

    /// Report `service_url` as unusable. The executor forgets it, releasing
    /// the slot held on it, and replaces the instance behind it.
    pub async fn invalidate_service(
        &self,
        meta: &ObjectMeta,
        executor: ExecutorType,
        service_url: &str,
        timeout: Duration,
    ) -> ClientResult<()> {
        self.post_tap("/v2/invalidateService", meta, executor, service_url, timeout)
            .await
    }

    async fn post_tap(
        &self,
        path: &str,
        meta: &ObjectMeta,
        executor: ExecutorType,
        service_url: &str,
        timeout: Duration,
    ) -> ClientResult<()> {
        let url = format!("{}{path}", self.base_url);
        let service_url = service_url.trim_start_matches("http://");
        let body = TapServiceRequest::new(meta, executor, service_url);
        self.http.post_json(&url, &body, timeout).await?.error_for_status(&url)?;
        Ok(())
    }
}

async fn tap_batcher(
    base_url: String,
    http: HttpClient,
    mut rx: mpsc::Receiver<TapServiceRequest>,
    interval: Duration,
) {
    let url = format!("{base_url}/v2/tapServices");
    let mut pending: HashMap<String, TapServiceRequest> = HashMap::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            req = rx.recv() => match req {
                Some(req) => {
                    pending.insert(req.service_url.clone(), req);
                }
                None => {
                    flush(&http, &url, &mut pending).await;
                    debug!("tap batcher stopped");
                    return;
                }
            },
            _ = ticker.tick() => flush(&http, &url, &mut pending).await,
        }
    }
}

async fn flush(http: &HttpClient, url: &str, pending: &mut HashMap<String, TapServiceRequest>) {
    if pending.is_empty() {
        return;
    }
    let batch: Vec<TapServiceRequest> = pending.drain().map(|(_, req)| req).collect();
    let count = batch.len();
    match http.post_json(url, &batch, TAP_TIMEOUT).await.and_then(|r| r.error_for_status(url)) {
        Ok(_) => debug!(count, "tapped services"),
        Err(e) => warn!(count, error = %e, "failed to tap services"),
    }
}
