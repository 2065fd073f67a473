//! Per-trigger request handling and the retrying proxy.
//!
//! # Architecture
//!
//! A [`FunctionHandler`] is built for every trigger (and every function's
//! internal URL) when the route table is rebuilt. For each request it
//! picks the target function, obtains an address and forwards the
//! buffered request there.
//!
//! Address lookup depends on the executor type:
//!
//! - **poolmgr**: always asks the executor, which hands back a request slot
//!   on a specialized pod. The slot is returned (un-tapped) in the
//!   background once the request is over, however it ended.
//! - **newdeploy / container**: served from the [`FunctionServiceMap`];
//!   on a miss one lookup per function revision goes to the executor
//!   (the [`Throttler`] collapses the rest) and the answer is cached.
//!
//! Forwarding retries dial failures against the same address with an
//! exponentially growing dial timeout. After `svc_address_max_retries`
//! failures the address is evicted and a fresh one is requested. A 5xx
//! answer from the function is treated the same way when
//! `retry_on_server_error` is set.

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use fission_client::{ExecutorClient, HttpClient, HttpResponse};
use fission_core::labels::url_for_function;
use fission_core::{ErrorCode, ExecutorType, FissionError, FissionResult, Function, HttpTrigger, ObjectMeta, RouterConfig};
use http::request::Parts;
use http_body_util::Full;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::funcmap::FunctionServiceMap;
use crate::resolver::Resolved;
use crate::throttler::Throttler;

pub const FORWARDED: &str = "forwarded";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
const FUNCTION_HEADER_PREFIX: &str = "x-fission-function";

/// Headers that describe one hop and are not forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

// ── Executor seam ──────────────────────────────────────────────────

pub type ExecutorFuture<'a, T> = Pin<Box<dyn Future<Output = FissionResult<T>> + Send + 'a>>;

/// The executor operations the router needs.
pub trait ExecutorApi: Send + Sync {
    fn get_service_for_function<'a>(&'a self, function: &'a Function) -> ExecutorFuture<'a, String>;

    /// Fire-and-forget access-time refresh.
    fn tap_service(&self, meta: &ObjectMeta, executor: ExecutorType, service_url: &str);

    fn un_tap_service<'a>(
        &'a self,
        meta: &'a ObjectMeta,
        executor: ExecutorType,
        service_url: &'a str,
        timeout: Duration,
    ) -> ExecutorFuture<'a, ()>;

    /// Report a pool address the function failed on. Releases the slot
    /// held on it.
    fn invalidate_service<'a>(
        &'a self,
        meta: &'a ObjectMeta,
        executor: ExecutorType,
        service_url: &'a str,
        timeout: Duration,
    ) -> ExecutorFuture<'a, ()>;
}

impl ExecutorApi for ExecutorClient {
    fn get_service_for_function<'a>(&'a self, function: &'a Function) -> ExecutorFuture<'a, String> {
        Box::pin(async move {
            ExecutorClient::get_service_for_function(self, function)
                .await
                .map_err(FissionError::from)
        })
    }

    fn tap_service(&self, meta: &ObjectMeta, executor: ExecutorType, service_url: &str) {
        ExecutorClient::tap_service(self, meta, executor, service_url);
    }

    fn un_tap_service<'a>(
        &'a self,
        meta: &'a ObjectMeta,
        executor: ExecutorType,
        service_url: &'a str,
        timeout: Duration,
    ) -> ExecutorFuture<'a, ()> {
        Box::pin(async move {
            ExecutorClient::un_tap_service(self, meta, executor, service_url, timeout)
                .await
                .map_err(FissionError::from)
        })
    }

    fn invalidate_service<'a>(
        &'a self,
        meta: &'a ObjectMeta,
        executor: ExecutorType,
        service_url: &'a str,
        timeout: Duration,
    ) -> ExecutorFuture<'a, ()> {
        Box::pin(async move {
            ExecutorClient::invalidate_service(self, meta, executor, service_url, timeout)
                .await
                .map_err(FissionError::from)
        })
    }
}

// ── Shared context ─────────────────────────────────────────────────

/// State shared by every handler of one router.
pub struct HandlerContext {
    pub config: RouterConfig,
    pub executor: Arc<dyn ExecutorApi>,
    pub fmap: FunctionServiceMap,
    pub throttler: Throttler,
    pub http: HttpClient,
}

impl HandlerContext {
    /// Must be called inside a tokio runtime.
    pub fn new(config: RouterConfig, executor: Arc<dyn ExecutorApi>) -> Self {
        let keep_alive = (!config.disable_keep_alive).then_some(config.keep_alive_time);
        Self {
            fmap: FunctionServiceMap::new(config.function_service_ttl),
            throttler: Throttler::new(config.svc_address_update_timeout),
            http: HttpClient::with_keep_alive(keep_alive),
            executor,
            config,
        }
    }
}

/// Pool addresses held by one request, released when the request ends.
struct UnTapOnDrop {
    ctx: Arc<HandlerContext>,
    meta: ObjectMeta,
    addresses: Vec<String>,
}

impl Drop for UnTapOnDrop {
    fn drop(&mut self) {
        if self.addresses.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(function = %self.meta.name, "no runtime to release pool slots on");
            return;
        };
        for address in self.addresses.drain(..) {
            let ctx = self.ctx.clone();
            let meta = self.meta.clone();
            runtime.spawn(async move {
                let timeout = ctx.config.untap_service_timeout;
                let url = format!("http://{address}");
                if let Err(e) = ctx
                    .executor
                    .un_tap_service(&meta, ExecutorType::Poolmgr, &url, timeout)
                    .await
                {
                    warn!(function = %meta.name, %address, error = %e, "un-tap failed");
                }
            });
        }
    }
}

// ── Handler ────────────────────────────────────────────────────────

pub struct FunctionHandler {
    ctx: Arc<HandlerContext>,
    trigger: Option<HttpTrigger>,
    target: Resolved,
}

impl FunctionHandler {
    pub fn for_trigger(ctx: Arc<HandlerContext>, trigger: HttpTrigger, target: Resolved) -> Self {
        Self {
            ctx,
            trigger: Some(trigger),
            target,
        }
    }

    /// Handler behind a function's internal URL.
    pub fn for_function(ctx: Arc<HandlerContext>, function: Function) -> Self {
        Self {
            ctx,
            trigger: None,
            target: Resolved::single(function),
        }
    }

    pub fn trigger_name(&self) -> Option<&str> {
        self.trigger.as_ref().map(|t| t.metadata.name.as_str())
    }

    pub async fn handle(&self, req: Request<Body>) -> Response {
        let start = Instant::now();
        let Some(function) = self.target.choose().cloned() else {
            warn!(trigger = ?self.trigger_name(), "no function backend to route to");
            return (StatusCode::INTERNAL_SERVER_ERROR, "no function backend available").into_response();
        };

        let (parts, body) = req.into_parts();
        let body = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(body) => body,
            Err(e) => return (StatusCode::BAD_REQUEST, format!("failed to read request body: {e}")).into_response(),
        };

        let resp = self.proxy(&function, &parts, body).await;
        if self.ctx.config.display_access_log {
            info!(
                method = %parts.method,
                path = %parts.uri.path(),
                status = resp.status().as_u16(),
                function = %function.metadata.name,
                namespace = %function.metadata.namespace,
                elapsed = ?start.elapsed(),
                "access"
            );
        }
        resp
    }

    async fn proxy(&self, function: &Function, parts: &Parts, body: Bytes) -> Response {
        let ctx = &self.ctx;
        let cfg = &ctx.config;
        let meta = &function.metadata;
        let executor_type = function.executor_type();
        let path = self.upstream_path(function, parts);
        let headers = self.forwarded_headers(function, &parts.headers);

        let mut held = UnTapOnDrop {
            ctx: ctx.clone(),
            meta: meta.clone(),
            addresses: Vec::new(),
        };
        let mut dial_timeout = cfg.round_trip_timeout;
        let mut current: Option<(String, bool)> = None;
        let mut failures = 0;
        let mut server_errors = 0;
        let mut last_error = String::from("no attempt made");

        for attempt in 0..cfg.max_retries.max(1) {
            let last = attempt + 1 >= cfg.max_retries;
            let (address, from_cache) = match current.clone() {
                Some(hit) => hit,
                None => match self.service_address(function).await {
                    Ok(found) => {
                        if executor_type == ExecutorType::Poolmgr {
                            held.addresses.push(found.0.clone());
                        }
                        current = Some(found.clone());
                        found
                    }
                    Err(e) => return self.executor_error(function, e),
                },
            };

            let req = match build_request(parts, &headers, &address, &path, body.clone()) {
                Ok(req) => req,
                Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
            };
            let sent = ctx
                .http
                .send_with_dial_timeout(req, Some(dial_timeout), function.function_timeout())
                .await;

            match sent {
                Ok(resp)
                    if resp.status.is_server_error()
                        && cfg.retry_on_server_error
                        && server_errors < cfg.svc_address_max_retries
                        && !last =>
                {
                    server_errors += 1;
                    debug!(function = %meta.name, %address, status = resp.status.as_u16(), "function answered 5xx, re-querying address");
                    self.evict(&mut held, executor_type, &address).await;
                    current = None;
                    failures = 0;
                }
                Ok(resp) => {
                    if from_cache {
                        ctx.executor
                            .tap_service(meta, executor_type, &format!("http://{address}"));
                    }
                    return into_response(resp);
                }
                Err(e) if e.is_connect() => {
                    debug!(function = %meta.name, %address, attempt, error = %e, "dial failed");
                    last_error = e.to_string();
                    failures += 1;
                    if failures >= cfg.svc_address_max_retries {
                        debug!(function = %meta.name, %address, failures, "address keeps failing, evicting");
                        self.evict(&mut held, executor_type, &address).await;
                        current = None;
                        failures = 0;
                    }
                }
                Err(e) if e.is_timeout() => {
                    warn!(function = %meta.name, %address, error = %e, "no response from function before timeout");
                    return (StatusCode::GATEWAY_TIMEOUT, "no response from function before timeout").into_response();
                }
                Err(e) => {
                    warn!(function = %meta.name, %address, error = %e, "error sending request to function");
                    return (StatusCode::BAD_GATEWAY, format!("error sending request to function: {e}")).into_response();
                }
            }

            if last {
                break;
            }
            tokio::time::sleep(dial_timeout).await;
            dial_timeout = dial_timeout.saturating_mul(cfg.timeout_exponent.max(1));
        }

        warn!(function = %meta.name, namespace = %meta.namespace, error = %last_error, "giving up on function");
        (StatusCode::BAD_GATEWAY, format!("unable to reach function: {last_error}")).into_response()
    }

    /// Address for `function` and whether it came from the router's map.
    async fn service_address(&self, function: &Function) -> FissionResult<(String, bool)> {
        let ctx = &self.ctx;
        if function.executor_type() == ExecutorType::Poolmgr {
            let address = ctx.executor.get_service_for_function(function).await?;
            return Ok((address, false));
        }

        let meta = &function.metadata;
        if let Some(address) = ctx.fmap.lookup(meta).await? {
            return Ok((address, true));
        }

        let key = function.cache_key().to_string();
        ctx.throttler
            .run_once(&key, |first| async move {
                if !first {
                    if let Some(address) = ctx.fmap.lookup(meta).await? {
                        return Ok((address, true));
                    }
                }
                let address = ctx.executor.get_service_for_function(function).await?;
                ctx.fmap.assign(meta, &address).await?;
                Ok((address, false))
            })
            .await
    }

    /// Stop using `address`. A pool slot held on it is handed back to the
    /// executor as invalid, so admission has room for a replacement.
    async fn evict(&self, held: &mut UnTapOnDrop, executor_type: ExecutorType, address: &str) {
        let meta = &held.meta;
        if executor_type != ExecutorType::Poolmgr {
            if let Err(e) = self.ctx.fmap.remove(meta).await {
                warn!(function = %meta.name, error = %e, "failed to evict cached address");
            }
            return;
        }

        let Some(idx) = held.addresses.iter().position(|a| a == address) else {
            return;
        };
        let slot = held.addresses.remove(idx);
        let url = format!("http://{slot}");
        let timeout = self.ctx.config.untap_service_timeout;
        if let Err(e) = self
            .ctx
            .executor
            .invalidate_service(meta, ExecutorType::Poolmgr, &url, timeout)
            .await
        {
            warn!(function = %meta.name, %address, error = %e, "failed to invalidate pool address");
            held.addresses.push(slot);
        }
    }

    fn executor_error(&self, function: &Function, err: FissionError) -> Response {
        warn!(function = %function.metadata.name, namespace = %function.metadata.namespace, error = %err, "error from executor");
        let status = StatusCode::from_u16(err.code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if self.ctx.config.debug_env {
            return (status, err.message).into_response();
        }
        match err.code {
            ErrorCode::TooManyRequests | ErrorCode::NotFound | ErrorCode::Timeout => (status, err.message).into_response(),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("error getting service for function {}", function.metadata.name),
            )
                .into_response(),
        }
    }

    /// Path and query sent to the function. The trigger prefix, or else
    /// the internal function URL, is trimmed; anything else goes to `/`.
    fn upstream_path(&self, function: &Function, parts: &Parts) -> String {
        let path = parts.uri.path();
        let function_url = url_for_function(&function.metadata.name, &function.metadata.namespace);
        let prefix = self
            .trigger
            .as_ref()
            .and_then(|t| t.spec.prefix.as_deref())
            .filter(|p| !p.is_empty());

        let trim = match prefix {
            Some(prefix) => Some(prefix),
            None if path.starts_with(&function_url) => Some(function_url.as_str()),
            None => None,
        };
        let mut upstream = match trim {
            Some(trim) => {
                let rest = path.strip_prefix(trim).unwrap_or(path);
                if rest.starts_with('/') { rest.to_string() } else { format!("/{rest}") }
            }
            None => "/".to_string(),
        };
        if let Some(query) = parts.uri.query() {
            upstream.push('?');
            upstream.push_str(query);
        }
        upstream
    }

    fn forwarded_headers(&self, function: &Function, incoming: &HeaderMap) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in incoming {
            if !HOP_BY_HOP.contains(&name.as_str()) && name != http::header::HOST {
                headers.append(name.clone(), value.clone());
            }
        }

        let meta = &function.metadata;
        for (suffix, value) in [
            ("name", &meta.name),
            ("namespace", &meta.namespace),
            ("resourceversion", &meta.resource_version),
            ("uid", &meta.uid),
        ] {
            let name = HeaderName::try_from(format!("{FUNCTION_HEADER_PREFIX}-{suffix}"));
            if let (Ok(name), Ok(value)) = (name, HeaderValue::from_str(value)) {
                headers.insert(name, value);
            }
        }

        let host = incoming.get(http::header::HOST).and_then(|h| h.to_str().ok());
        if let Some(host) = host {
            if !incoming.contains_key(FORWARDED) && !incoming.contains_key(X_FORWARDED_HOST) {
                if let Ok(v) = HeaderValue::from_str(&forwarded_value(host)) {
                    headers.insert(FORWARDED, v);
                }
                if let Ok(v) = HeaderValue::from_str(host) {
                    headers.insert(X_FORWARDED_HOST, v);
                }
            }
        }
        headers
    }
}

/// `Forwarded` value for `host`; IPv6 hosts are quoted.
fn forwarded_value(host: &str) -> String {
    let bare = crate::route::host_without_port(host);
    if bare.parse::<IpAddr>().is_ok_and(|ip| ip.is_ipv6()) {
        format!("host=\"{host}\";proto=http")
    } else {
        format!("host={host};proto=http")
    }
}

fn build_request(
    parts: &Parts,
    headers: &HeaderMap,
    address: &str,
    path: &str,
    body: Bytes,
) -> Result<Request<Full<Bytes>>, http::Error> {
    let address = address.trim_start_matches("http://");
    let mut builder = Request::builder()
        .method(parts.method.clone())
        .uri(format!("http://{address}{path}"))
        .header(http::header::HOST, address);
    if let Some(h) = builder.headers_mut() {
        h.extend(headers.clone());
    }
    builder.body(Full::new(body))
}

fn into_response(resp: HttpResponse) -> Response {
    let mut out = Response::new(Body::from(resp.body));
    *out.status_mut() = resp.status;
    for (name, value) in &resp.headers {
        if !HOP_BY_HOP.contains(&name.as_str()) && name != http::header::CONTENT_LENGTH {
            out.headers_mut().append(name.clone(), value.clone());
        }
    }
    out
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Executor double handing out fixed answers and recording calls.
    #[derive(Default)]
    pub struct FakeExecutor {
        pub answers: Mutex<Vec<FissionResult<String>>>,
        pub lookups: AtomicUsize,
        pub taps: Mutex<Vec<String>>,
        pub untaps: Mutex<Vec<String>>,
        pub invalidated: Mutex<Vec<String>>,
    }

    impl FakeExecutor {
        pub fn answering(answers: Vec<FissionResult<String>>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers),
                ..Default::default()
            })
        }
    }

    impl ExecutorApi for FakeExecutor {
        fn get_service_for_function<'a>(&'a self, _function: &'a Function) -> ExecutorFuture<'a, String> {
            Box::pin(async move {
                self.lookups.fetch_add(1, Ordering::SeqCst);
                let mut answers = self.answers.lock().unwrap();
                if answers.len() > 1 {
                    answers.remove(0)
                } else {
                    answers.first().cloned().unwrap_or_else(|| Err(FissionError::internal("no answer")))
                }
            })
        }

        fn tap_service(&self, _meta: &ObjectMeta, _executor: ExecutorType, service_url: &str) {
            self.taps.lock().unwrap().push(service_url.to_string());
        }

        fn un_tap_service<'a>(
            &'a self,
            _meta: &'a ObjectMeta,
            _executor: ExecutorType,
            service_url: &'a str,
            _timeout: Duration,
        ) -> ExecutorFuture<'a, ()> {
            Box::pin(async move {
                self.untaps.lock().unwrap().push(service_url.to_string());
                Ok(())
            })
        }

        fn invalidate_service<'a>(
            &'a self,
            _meta: &'a ObjectMeta,
            _executor: ExecutorType,
            service_url: &'a str,
            _timeout: Duration,
        ) -> ExecutorFuture<'a, ()> {
            Box::pin(async move {
                self.invalidated.lock().unwrap().push(service_url.to_string());
                Ok(())
            })
        }
    }

    pub fn function(name: &str, executor_type: ExecutorType) -> Function {
        let mut f = Function {
            metadata: ObjectMeta {
                uid: format!("uid-{name}"),
                resource_version: "1".into(),
                ..ObjectMeta::new("default", name)
            },
            ..Default::default()
        };
        f.spec.invoke_strategy.execution_strategy.executor_type = executor_type;
        f
    }

    pub fn config() -> RouterConfig {
        RouterConfig {
            round_trip_timeout: Duration::from_millis(10),
            svc_address_max_retries: 2,
            max_retries: 6,
            ..Default::default()
        }
    }

    /// A local server answering every request with its method, path and
    /// selected headers.
    pub async fn echo_server(status: StatusCode) -> String {
        use axum::Router;
        use axum::extract::Request as AxumRequest;

        let app = Router::new().fallback(move |req: AxumRequest| async move {
            let h = |name: &str| {
                req.headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string()
            };
            let body = format!(
                "{} {} fn={} fwd={} xfh={}",
                req.method(),
                req.uri(),
                h("x-fission-function-name"),
                h(FORWARDED),
                h(X_FORWARDED_HOST)
            );
            (status, body)
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr.to_string()
    }

    /// An address nothing listens on.
    pub async fn dead_address() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use fission_core::{FunctionReference, HttpTriggerSpec};
    use http_body_util::BodyExt;

    use super::testing::*;
    use super::*;

    fn ctx(executor: Arc<FakeExecutor>, config: RouterConfig) -> Arc<HandlerContext> {
        Arc::new(HandlerContext::new(config, executor))
    }

    fn request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("host", "example.com:8080")
            .body(Body::from("payload"))
            .unwrap()
    }

    async fn text(resp: Response) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn prefixed_trigger(prefix: &str) -> HttpTrigger {
        HttpTrigger {
            metadata: ObjectMeta::new("default", "t"),
            spec: HttpTriggerSpec {
                prefix: Some(prefix.into()),
                function_reference: FunctionReference {
                    name: "hello".into(),
                    ..Default::default()
                },
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn poolmgr_request_is_proxied_and_untapped() {
        let backend = echo_server(StatusCode::OK).await;
        let exec = FakeExecutor::answering(vec![Ok(backend.clone())]);
        let f = function("hello", ExecutorType::Poolmgr);
        let handler = FunctionHandler::for_function(ctx(exec.clone(), config()), f);

        let resp = handler.handle(request("POST", "/fission-function/hello/sub?x=1")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = text(resp).await;
        assert!(body.starts_with("POST /sub?x=1 fn=hello"), "{body}");
        assert!(body.contains("fwd=host=example.com:8080;proto=http"), "{body}");
        assert!(body.contains("xfh=example.com:8080"), "{body}");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*exec.untaps.lock().unwrap(), vec![format!("http://{backend}")]);
    }

    #[tokio::test]
    async fn newdeploy_address_is_cached_and_tapped() {
        let backend = echo_server(StatusCode::OK).await;
        let exec = FakeExecutor::answering(vec![Ok(backend.clone())]);
        let f = function("hello", ExecutorType::Newdeploy);
        let trigger = prefixed_trigger("/api");
        let handler = FunctionHandler::for_trigger(ctx(exec.clone(), config()), trigger, Resolved::single(f));

        let first = handler.handle(request("GET", "/api/items")).await;
        assert!(text(first).await.starts_with("GET /items"));
        let second = handler.handle(request("GET", "/api")).await;
        assert!(text(second).await.starts_with("GET / "));

        assert_eq!(exec.lookups.load(Ordering::SeqCst), 1);
        assert_eq!(exec.taps.lock().unwrap().len(), 1);
        assert!(exec.untaps.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dead_address_is_replaced() {
        let dead = dead_address().await;
        let backend = echo_server(StatusCode::OK).await;
        let exec = FakeExecutor::answering(vec![Ok(dead), Ok(backend)]);
        let f = function("hello", ExecutorType::Newdeploy);
        let handler = FunctionHandler::for_function(ctx(exec.clone(), config()), f);

        let resp = handler.handle(request("GET", "/fission-function/hello")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(exec.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unreachable_function_is_bad_gateway() {
        let dead = dead_address().await;
        let exec = FakeExecutor::answering(vec![Ok(dead)]);
        let handler = FunctionHandler::for_function(ctx(exec, config()), function("hello", ExecutorType::Poolmgr));
        let resp = handler.handle(request("GET", "/fission-function/hello")).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn server_errors_requery_when_enabled() {
        let failing = echo_server(StatusCode::INTERNAL_SERVER_ERROR).await;
        let healthy = echo_server(StatusCode::OK).await;
        let exec = FakeExecutor::answering(vec![Ok(failing.clone()), Ok(healthy)]);
        let handler = FunctionHandler::for_function(ctx(exec.clone(), config()), function("a", ExecutorType::Newdeploy));
        assert_eq!(handler.handle(request("GET", "/")).await.status(), StatusCode::OK);

        let exec = FakeExecutor::answering(vec![Ok(failing)]);
        let cfg = RouterConfig {
            retry_on_server_error: false,
            ..config()
        };
        let handler = FunctionHandler::for_function(ctx(exec.clone(), cfg), function("b", ExecutorType::Newdeploy));
        assert_eq!(handler.handle(request("GET", "/")).await.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(exec.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pool_server_error_hands_back_the_broken_slot() {
        let failing = echo_server(StatusCode::INTERNAL_SERVER_ERROR).await;
        let healthy = echo_server(StatusCode::OK).await;
        let exec = FakeExecutor::answering(vec![Ok(failing.clone()), Ok(healthy.clone())]);
        let handler = FunctionHandler::for_function(ctx(exec.clone(), config()), function("hello", ExecutorType::Poolmgr));

        assert_eq!(handler.handle(request("GET", "/")).await.status(), StatusCode::OK);
        assert_eq!(exec.lookups.load(Ordering::SeqCst), 2);
        assert_eq!(*exec.invalidated.lock().unwrap(), vec![format!("http://{failing}")]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*exec.untaps.lock().unwrap(), vec![format!("http://{healthy}")]);
    }

    #[tokio::test]
    async fn pool_dial_failures_hand_back_the_dead_slot() {
        let dead = dead_address().await;
        let backend = echo_server(StatusCode::OK).await;
        let exec = FakeExecutor::answering(vec![Ok(dead.clone()), Ok(backend.clone())]);
        let handler = FunctionHandler::for_function(ctx(exec.clone(), config()), function("hello", ExecutorType::Poolmgr));

        assert_eq!(handler.handle(request("GET", "/")).await.status(), StatusCode::OK);
        assert_eq!(*exec.invalidated.lock().unwrap(), vec![format!("http://{dead}")]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*exec.untaps.lock().unwrap(), vec![format!("http://{backend}")]);
    }

    #[tokio::test]
    async fn executor_errors_map_to_statuses() {
        let cases = [
            (FissionError::new(ErrorCode::TooManyRequests, "busy"), false, StatusCode::TOO_MANY_REQUESTS),
            (FissionError::internal("specialize failed"), false, StatusCode::INTERNAL_SERVER_ERROR),
            (FissionError::new(ErrorCode::InvalidArgument, "bad"), true, StatusCode::BAD_REQUEST),
        ];
        for (err, debug_env, expected) in cases {
            let exec = FakeExecutor::answering(vec![Err(err)]);
            let cfg = RouterConfig { debug_env, ..config() };
            let handler = FunctionHandler::for_function(ctx(exec, cfg), function("hello", ExecutorType::Poolmgr));
            assert_eq!(handler.handle(request("GET", "/")).await.status(), expected);
        }
    }

    #[test]
    fn forwarded_quotes_ipv6() {
        assert_eq!(forwarded_value("[::1]:8080"), "host=\"[::1]:8080\";proto=http");
        assert_eq!(forwarded_value("10.0.0.1:80"), "host=10.0.0.1:80;proto=http");
    }
}
