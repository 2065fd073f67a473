//! HTTP/1 client over hyper-util's pooled client.
//!
//! # Architecture
//!
//! Each request runs inside `tokio::time::timeout` and its whole response
//! body is collected. Connections are pooled per `host:port` and dropped
//! once idle for longer than the keep-alive time. A dial timeout belongs to
//! the connector, so there is one pooled client per distinct dial timeout.

use std::collections::HashMap;
use std::error::Error as _;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{ClientError, ClientResult};

type Pooled = Client<HttpConnector, Full<Bytes>>;

/// A fully read HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self, url: &str) -> ClientResult<T> {
        serde_json::from_slice(&self.body).map_err(|source| ClientError::Decode {
            url: url.to_string(),
            source,
        })
    }

    /// Turn a non-2xx answer into [`ClientError::Status`].
    pub fn error_for_status(self, url: &str) -> ClientResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ClientError::Status {
                url: url.to_string(),
                status: self.status.as_u16(),
                body: self.text(),
            })
        }
    }
}

/// HTTP/1 client handle. Cheap to clone; clones share the connection pools.
#[derive(Clone)]
pub struct HttpClient {
    pools: Arc<Mutex<HashMap<Option<Duration>, Pooled>>>,
    keep_alive: Option<Duration>,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// Client reusing connections idle for up to 30 seconds.
    pub fn new() -> Self {
        Self::with_keep_alive(Some(Duration::from_secs(30)))
    }

    /// `None` disables connection reuse.
    pub fn with_keep_alive(keep_alive: Option<Duration>) -> Self {
        Self {
            pools: Arc::new(Mutex::new(HashMap::new())),
            keep_alive,
        }
    }

    fn pool(&self, dial_timeout: Option<Duration>) -> Pooled {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        pools
            .entry(dial_timeout)
            .or_insert_with(|| {
                let mut connector = HttpConnector::new();
                connector.set_connect_timeout(dial_timeout);
                connector.set_nodelay(true);
                Client::builder(TokioExecutor::new())
                    .pool_timer(TokioTimer::new())
                    .pool_idle_timeout(self.keep_alive)
                    .pool_max_idle_per_host(if self.keep_alive.is_some() { usize::MAX } else { 0 })
                    .build(connector)
            })
            .clone()
    }

    pub async fn get(&self, url: &str, timeout: Duration) -> ClientResult<HttpResponse> {
        let req = Request::builder()
            .method(Method::GET)
            .uri(url)
            .body(Full::new(Bytes::new()))?;
        self.send(req, timeout).await
    }

    pub async fn delete(&self, url: &str, timeout: Duration) -> ClientResult<HttpResponse> {
        let req = Request::builder()
            .method(Method::DELETE)
            .uri(url)
            .body(Full::new(Bytes::new()))?;
        self.send(req, timeout).await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        timeout: Duration,
    ) -> ClientResult<HttpResponse> {
        let payload = serde_json::to_vec(body).map_err(ClientError::Encode)?;
        let req = Request::builder()
            .method(Method::POST)
            .uri(url)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(payload)))?;
        self.send(req, timeout).await
    }

    /// Send `req` (absolute URI) and read the full response within `timeout`.
    pub async fn send(&self, req: Request<Full<Bytes>>, timeout: Duration) -> ClientResult<HttpResponse> {
        self.send_with_dial_timeout(req, None, timeout).await
    }

    /// Like [`send`](Self::send), but a dial that takes longer than
    /// `dial_timeout` fails as [`ClientError::Connect`] with `TimedOut`.
    pub async fn send_with_dial_timeout(
        &self,
        req: Request<Full<Bytes>>,
        dial_timeout: Option<Duration>,
        timeout: Duration,
    ) -> ClientResult<HttpResponse> {
        let url = req.uri().to_string();
        let address = dial_address(req.uri())?;
        let client = self.pool(dial_timeout);
        match tokio::time::timeout(timeout, round_trip(&client, &address, &url, req)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout { url, after: timeout }),
        }
    }
}

async fn round_trip(client: &Pooled, address: &str, url: &str, req: Request<Full<Bytes>>) -> ClientResult<HttpResponse> {
    let resp = client.request(req).await.map_err(|source| {
        if source.is_connect() {
            ClientError::Connect {
                address: address.to_string(),
                source: io::Error::new(io_kind(&source), source),
            }
        } else {
            ClientError::Transport {
                url: url.to_string(),
                source,
            }
        }
    })?;
    let (parts, body) = resp.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|source| ClientError::Http {
            url: url.to_string(),
            source,
        })?
        .to_bytes();
    Ok(HttpResponse {
        status: parts.status,
        headers: parts.headers,
        body,
    })
}

/// Kind of the innermost I/O error behind a failed dial.
fn io_kind(err: &hyper_util::client::legacy::Error) -> io::ErrorKind {
    let mut source = err.source();
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<io::Error>() {
            return io.kind();
        }
        source = e.source();
    }
    io::ErrorKind::Other
}

/// The `host:port` an absolute URI dials.
fn dial_address(uri: &Uri) -> ClientResult<String> {
    let invalid = |reason: &str| ClientError::InvalidUrl {
        url: uri.to_string(),
        reason: reason.to_string(),
    };
    if uri.scheme_str() != Some("http") {
        return Err(invalid("only http is supported"));
    }
    let host = uri.host().ok_or_else(|| invalid("missing host"))?;
    Ok(format!("{host}:{}", uri.port_u16().unwrap_or(80)))
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::routing::{get, post};

    use super::*;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn dial_address_defaults_port_80() {
        let uri: Uri = "http://10.0.0.5:8888/fn/path?x=1".parse().unwrap();
        assert_eq!(dial_address(&uri).unwrap(), "10.0.0.5:8888");
        let uri: Uri = "http://executor.fission/v2/getServiceForFunction".parse().unwrap();
        assert_eq!(dial_address(&uri).unwrap(), "executor.fission:80");
        let relative: Uri = "/v2/getServiceForFunction".parse().unwrap();
        assert!(matches!(dial_address(&relative), Err(ClientError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn get_and_post_against_loopback() {
        let base = serve(
            Router::new()
                .route("/ping", get(|| async { "pong" }))
                .route("/echo", post(|body: String| async move { body })),
        )
        .await;
        let client = HttpClient::new();

        let resp = client.get(&format!("{base}/ping"), Duration::from_secs(5)).await.unwrap();
        assert_eq!(resp.text(), "pong");

        // Second call reuses the pooled connection.
        let resp = client
            .post_json(&format!("{base}/echo"), &serde_json::json!({"a": 1}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(resp.text(), r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn unpooled_client_dials_per_request() {
        let base = serve(Router::new().route("/ping", get(|| async { "pong" }))).await;
        let client = HttpClient::with_keep_alive(None);
        for _ in 0..3 {
            let resp = client
                .send_with_dial_timeout(
                    Request::get(format!("{base}/ping")).body(Full::new(Bytes::new())).unwrap(),
                    Some(Duration::from_millis(500)),
                    Duration::from_secs(5),
                )
                .await
                .unwrap();
            assert_eq!(resp.text(), "pong");
        }
        assert_eq!(client.pools.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn refused_connection_is_a_connect_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = HttpClient::new()
            .get(&format!("http://{addr}/"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_connect());
    }

    #[tokio::test]
    async fn slow_peer_times_out() {
        let base = serve(Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        ))
        .await;
        let err = HttpClient::new()
            .get(&format!("{base}/slow"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
