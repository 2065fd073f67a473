//! End-to-end scenarios.
//!
//! Router, executor API and function pods run on real loopback listeners.
//! The in-process orchestrator hands out pods at `127.0.0.1`, so the
//! executor's runtime port is the port of a local function server and
//! every specialized pod answers through it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use fission_client::{
    ArchiveUploadRequest, ArchiveUploadResponse, BuildRequest, BuildResponse, ExecutorClient, FetchRequest,
    SpecializeRequest,
};
use fission_core::{
    Archive, BuildStatus, Builder, BuilderConfig, Checksum, Environment, EnvironmentReference, EnvironmentSpec,
    ExecutorConfig, ExecutorType, FissionError, Function, FunctionReference, FunctionReferenceType,
    HttpTrigger, HttpTriggerSpec, ObjectMeta, Package, PackageRef, PackageSpec, RouterConfig,
};
use fission_executor::{Executor, SpecializeFuture, Specializer};
use fission_orchestrator::InMemoryOrchestrator;
use fission_router::{ExecutorApi, ExecutorFuture, TriggerSet};
use fission_state::{CatalogEvent, Change, StateStore};
use http_body_util::BodyExt;
use tokio::net::TcpListener;
use tower::ServiceExt;

// ── Fixtures ───────────────────────────────────────────────────────

struct NoopSpecializer;

impl Specializer for NoopSpecializer {
    fn specialize<'a>(&'a self, _url: &'a str, _req: &'a SpecializeRequest) -> SpecializeFuture<'a> {
        Box::pin(async { Ok(()) })
    }
}

async fn listen(app: axum::Router) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

/// A function pod answering `hello from {name}` after `delay`.
async fn function_server(name: &'static str, delay: Duration) -> u16 {
    let app = axum::Router::new().fallback(move || async move {
        tokio::time::sleep(delay).await;
        format!("hello from {name}")
    });
    listen(app).await
}

fn environment(name: &str, poolsize: u32) -> Environment {
    Environment {
        metadata: ObjectMeta::new("default", name),
        spec: EnvironmentSpec {
            poolsize,
            ..Default::default()
        },
    }
}

fn function(name: &str, env: &str, concurrency: u32, requests_per_pod: u32) -> Function {
    let mut f = Function {
        metadata: ObjectMeta::new("default", name),
        ..Default::default()
    };
    f.spec.environment = EnvironmentReference {
        namespace: "default".into(),
        name: env.into(),
    };
    f.spec.package.function_name = "main".into();
    f.spec.concurrency = concurrency;
    f.spec.requests_per_pod = requests_per_pod;
    f
}

fn trigger(name: &str, url: &str, reference: FunctionReference) -> HttpTrigger {
    HttpTrigger {
        metadata: ObjectMeta::new("default", name),
        spec: HttpTriggerSpec {
            relative_url: url.into(),
            method: "POST".into(),
            function_reference: reference,
            ..Default::default()
        },
    }
}

fn by_name(name: &str) -> FunctionReference {
    FunctionReference {
        kind: FunctionReferenceType::Name,
        name: name.into(),
        ..Default::default()
    }
}

fn weighted(weights: &[(&str, u32)]) -> FunctionReference {
    FunctionReference {
        kind: FunctionReferenceType::FunctionWeights,
        function_weights: weights.iter().map(|(n, w)| (n.to_string(), *w)).collect(),
        ..Default::default()
    }
}

async fn post(app: &axum::Router, uri: &str) -> (StatusCode, String) {
    let req = Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&body).into_owned())
}

/// Executor API plus a router talking to it over HTTP.
struct Cluster {
    store: StateStore,
    executor: Arc<Executor>,
    router: axum::Router,
    triggers: Arc<TriggerSet>,
}

impl Cluster {
    async fn start(runtime_port: u16) -> Self {
        let store = StateStore::open_in_memory().unwrap();
        let orchestrator = InMemoryOrchestrator::new().with_pod_ip("127.0.0.1");
        let config = ExecutorConfig {
            instance_id: Some("exec-e2e".into()),
            runtime_port,
            ..Default::default()
        };
        let executor = Arc::new(Executor::with_specializer(
            store.clone(),
            Arc::new(orchestrator),
            config,
            Arc::new(NoopSpecializer),
        ));
        executor.start().await.unwrap();
        let executor_port = listen(fission_executor::build_router(executor.clone())).await;

        let executor_url = format!("http://127.0.0.1:{executor_port}");
        let config = RouterConfig {
            executor_url: executor_url.clone(),
            ..Default::default()
        };
        let client = ExecutorClient::new(&executor_url);
        let (router, triggers) = fission_router::start(store.clone(), config, Arc::new(client)).unwrap();
        Self {
            store,
            executor,
            router,
            triggers,
        }
    }

    /// Store `env`, `f` and a `POST /{name}` trigger, then rebuild routes.
    fn deploy(&self, env: Environment, f: Function) -> Function {
        self.store.create(env).unwrap();
        let f = self.store.create(f).unwrap();
        let name = f.metadata.name.clone();
        self.store
            .create(trigger(&name, &format!("/{name}"), by_name(&name)))
            .unwrap();
        self.triggers.sync().unwrap();
        f
    }

    async fn pods_of(&self, f: &Function) -> usize {
        self.executor
            .context()
            .fscache
            .pool()
            .stats(&f.cache_key())
            .await
            .unwrap()
            .map_or(0, |s| s.pods)
    }

    /// Wait for the router's background un-taps to return every slot.
    async fn wait_released(&self, f: &Function) {
        for _ in 0..100 {
            let stats = self.executor.context().fscache.pool().stats(&f.cache_key()).await.unwrap();
            if stats.is_none_or(|s| s.active == 0) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("request slots of {} never released", f.metadata.name);
    }
}

async fn burst(app: &axum::Router, uri: &'static str, n: usize) -> Vec<(StatusCode, String)> {
    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..n {
        let app = app.clone();
        tasks.spawn(async move { post(&app, uri).await });
    }
    let mut results = Vec::new();
    while let Some(result) = tasks.join_next().await {
        results.push(result.unwrap());
    }
    results
}

// ── S1: cold start ─────────────────────────────────────────────────

#[tokio::test]
async fn cold_start_specializes_and_proxies() {
    let port = function_server("hello", Duration::ZERO).await;
    let cluster = Cluster::start(port).await;
    let f = cluster.deploy(environment("python", 1), function("hello", "python", 1, 1));

    let (status, body) = post(&cluster.router, "/hello").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "hello from hello");
    assert_eq!(cluster.pods_of(&f).await, 1);
    cluster.wait_released(&f).await;

    // The internal function URL reaches the same pod.
    let (status, body) = post(&cluster.router, "/fission-function/hello").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "hello from hello");
    assert_eq!(cluster.pods_of(&f).await, 1);
}

// ── S2: capacity-bounded parallel hits ─────────────────────────────

#[tokio::test]
async fn parallel_hits_share_one_pod_without_rejections() {
    let port = function_server("hello", Duration::from_millis(200)).await;
    let cluster = Cluster::start(port).await;
    let f = cluster.deploy(environment("python", 1), function("hello", "python", 1, 5));

    let results = burst(&cluster.router, "/hello", 10).await;
    for (status, body) in &results {
        assert_eq!(*status, StatusCode::OK, "body: {body}");
        assert_eq!(body, "hello from hello");
    }
    assert_eq!(cluster.pods_of(&f).await, 1);
}

// ── S3: capacity exhausted ─────────────────────────────────────────

#[tokio::test]
async fn exhausted_capacity_answers_too_many_requests() {
    let port = function_server("hello", Duration::from_millis(500)).await;
    let cluster = Cluster::start(port).await;
    let f = cluster.deploy(environment("python", 1), function("hello", "python", 1, 1));

    let results = burst(&cluster.router, "/hello", 10).await;
    let ok = results.iter().filter(|(s, _)| *s == StatusCode::OK).count();
    let rejected = results
        .iter()
        .filter(|(s, _)| *s == StatusCode::TOO_MANY_REQUESTS)
        .count();
    assert_eq!(ok, 1);
    assert_eq!(rejected, 9);
    assert_eq!(cluster.pods_of(&f).await, 1);
}

// ── Failing pool function ──────────────────────────────────────────

#[tokio::test]
async fn server_errors_from_a_pool_function_reach_the_caller() {
    let app = axum::Router::new().fallback(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") });
    let port = listen(app).await;
    let cluster = Cluster::start(port).await;
    let f = cluster.deploy(environment("python", 1), function("hello", "python", 1, 1));

    // Each 5xx replaces the pod; the last answer goes back as it is.
    let (status, body) = post(&cluster.router, "/hello").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, "boom");

    cluster.wait_released(&f).await;
    assert_eq!(cluster.pods_of(&f).await, 1);
}

// ── S4: canary weights ─────────────────────────────────────────────

/// Executor answering a fixed address per function name.
struct StaticExecutor {
    addresses: HashMap<String, String>,
}

impl ExecutorApi for StaticExecutor {
    fn get_service_for_function<'a>(&'a self, function: &'a Function) -> ExecutorFuture<'a, String> {
        Box::pin(async move {
            self.addresses
                .get(&function.metadata.name)
                .cloned()
                .ok_or_else(|| FissionError::not_found(format!("no address for {}", function.metadata.name)))
        })
    }

    fn tap_service(&self, _meta: &ObjectMeta, _executor: ExecutorType, _service_url: &str) {}

    fn un_tap_service<'a>(
        &'a self,
        _meta: &'a ObjectMeta,
        _executor: ExecutorType,
        _service_url: &'a str,
        _timeout: Duration,
    ) -> ExecutorFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn invalidate_service<'a>(
        &'a self,
        _meta: &'a ObjectMeta,
        _executor: ExecutorType,
        _service_url: &'a str,
        _timeout: Duration,
    ) -> ExecutorFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Hits per function over `n` sequential requests.
async fn sample(app: &axum::Router, n: usize) -> BTreeMap<String, usize> {
    let mut hits = BTreeMap::new();
    for _ in 0..n {
        let (status, body) = post(app, "/canary").await;
        assert_eq!(status, StatusCode::OK, "body: {body}");
        *hits.entry(body).or_default() += 1;
    }
    hits
}

/// `hits` lies within three standard deviations of binomial(n, p).
fn within_three_sigma(hits: usize, n: usize, p: f64) -> bool {
    let n = n as f64;
    let mean = n * p;
    let sigma = (n * p * (1.0 - p)).sqrt();
    (hits as f64 - mean).abs() <= 3.0 * sigma
}

#[tokio::test]
async fn weighted_trigger_follows_weights() {
    let a = function_server("a", Duration::ZERO).await;
    let b = function_server("b", Duration::ZERO).await;
    let store = StateStore::open_in_memory().unwrap();
    store.create(function("a", "python", 0, 0)).unwrap();
    store.create(function("b", "python", 0, 0)).unwrap();
    store
        .create(trigger("canary", "/canary", weighted(&[("a", 80), ("b", 20)])))
        .unwrap();

    let executor = StaticExecutor {
        addresses: HashMap::from([
            ("a".to_string(), format!("127.0.0.1:{a}")),
            ("b".to_string(), format!("127.0.0.1:{b}")),
        ]),
    };
    let (router, triggers) = fission_router::start(store.clone(), RouterConfig::default(), Arc::new(executor)).unwrap();

    const N: usize = 10_000;
    let hits = sample(&router, N).await;
    let to_a = hits.get("hello from a").copied().unwrap_or(0);
    assert_eq!(to_a + hits.get("hello from b").copied().unwrap_or(0), N);
    assert!(within_three_sigma(to_a, N, 0.8), "a got {to_a} of {N}");

    let mut canary = store.require::<HttpTrigger>("default", "canary").unwrap();
    canary.spec.function_reference = weighted(&[("a", 20), ("b", 80)]);
    store.update(canary).unwrap();
    triggers.sync().unwrap();

    let hits = sample(&router, N).await;
    let to_a = hits.get("hello from a").copied().unwrap_or(0);
    assert!(within_three_sigma(to_a, N, 0.2), "a got {to_a} of {N}");
}

// ── S5: package build ──────────────────────────────────────────────

/// Fetcher and builder of a builder pod, sharing one port.
async fn builder_pod() -> u16 {
    use axum::Json;
    use axum::routing::{delete, post};

    let app = axum::Router::new()
        .route("/fetch", post(|Json(_): Json<FetchRequest>| async { StatusCode::OK }))
        .route(
            "/build",
            post(|Json(req): Json<BuildRequest>| async move {
                Json(BuildResponse {
                    artifact_filename: format!("{}-built", req.src_pkg_filename),
                    build_logs: "built\n".into(),
                })
            }),
        )
        .route(
            "/upload",
            post(|Json(_): Json<ArchiveUploadRequest>| async {
                Json(ArchiveUploadResponse {
                    archive_download_url: "http://storagesvc.fission/v1/archive?id=7".into(),
                    checksum: Checksum {
                        kind: "sha256".into(),
                        sum: "5f2b".into(),
                    },
                })
            }),
        )
        .route("/clean", delete(|| async { StatusCode::OK }));
    listen(app).await
}

#[tokio::test]
async fn source_package_is_built_and_functions_follow() {
    let port = builder_pod().await;
    let store = StateStore::open_in_memory().unwrap();
    let orchestrator = InMemoryOrchestrator::new().with_service_address("127.0.0.1");
    let config = BuilderConfig {
        builder_port: port,
        fetcher_port: port,
        builder_ready_timeout: Duration::from_secs(5),
        ..Default::default()
    };

    store
        .create(Environment {
            metadata: ObjectMeta::new("default", "py"),
            spec: EnvironmentSpec {
                builder: Builder {
                    image: "fission/python-builder".into(),
                    command: "build".into(),
                },
                ..Default::default()
            },
        })
        .unwrap();
    let mut events = store.watch();
    let pkg = store
        .create(Package {
            metadata: ObjectMeta::new("default", "pkg1"),
            spec: PackageSpec {
                environment: EnvironmentReference {
                    namespace: "default".into(),
                    name: "py".into(),
                },
                source: Archive {
                    literal: b"def main(): return 'hi'".to_vec(),
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
    let mut f = function("hello", "py", 1, 1);
    f.spec.package.package_ref = PackageRef {
        namespace: "default".into(),
        name: "pkg1".into(),
        resource_version: pkg.metadata.resource_version.clone(),
    };
    store.create(f).unwrap();

    fission_buildermgr::start(store.clone(), Arc::new(orchestrator), config).unwrap();

    let mut built = None;
    for _ in 0..250 {
        let pkg = store.require::<Package>("default", "pkg1").unwrap();
        if pkg.status.build_status.is_some_and(BuildStatus::is_terminal) {
            built = Some(pkg);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let pkg = built.expect("package never finished building");
    assert_eq!(pkg.status.build_status, Some(BuildStatus::Succeeded), "log: {}", pkg.status.build_log);
    assert!(!pkg.spec.deployment.url.is_empty());
    assert!(!pkg.spec.deployment.checksum.sum.is_empty());

    let mut function_rv = String::new();
    for _ in 0..100 {
        let f = store.require::<Function>("default", "hello").unwrap();
        function_rv = f.spec.package.package_ref.resource_version;
        if function_rv == pkg.metadata.resource_version {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(function_rv, pkg.metadata.resource_version);

    let mut statuses: Vec<Option<BuildStatus>> = Vec::new();
    while let Ok(event) = events.try_recv() {
        let pkg = match event {
            CatalogEvent::Package(Change::Added(pkg)) => pkg,
            CatalogEvent::Package(Change::Updated { new, .. }) => new,
            _ => continue,
        };
        if statuses.last() != Some(&pkg.status.build_status) {
            statuses.push(pkg.status.build_status);
        }
    }
    assert_eq!(
        statuses,
        vec![
            None,
            Some(BuildStatus::Pending),
            Some(BuildStatus::Running),
            Some(BuildStatus::Succeeded)
        ]
    );
}

// ── S6: idle reaping keeps retainPods ──────────────────────────────

#[tokio::test(start_paused = true)]
async fn idle_reap_keeps_retained_pods() {
    let store = StateStore::open_in_memory().unwrap();
    let orchestrator = InMemoryOrchestrator::new();
    let executor = Executor::with_specializer(
        store.clone(),
        Arc::new(orchestrator.clone()),
        ExecutorConfig {
            instance_id: Some("exec-e2e".into()),
            ..Default::default()
        },
        Arc::new(NoopSpecializer),
    );
    store.create(environment("python", 5)).unwrap();
    let mut f = function("hello", "python", 5, 1);
    f.spec.retain_pods = 2;
    f.spec.idle_timeout = Some(60);
    let f = store.create(f).unwrap();

    // Each lookup holds its pod's only slot, so every one specializes.
    let mut addresses = Vec::new();
    for _ in 0..5 {
        addresses.push(executor.get_service_for_function(&f).await.unwrap());
    }
    addresses.sort();
    addresses.dedup();
    assert_eq!(addresses.len(), 5);

    let poolmgr = &executor.executors().poolmgr;
    for address in &addresses {
        poolmgr.un_tap_service(&f.metadata, address).await.unwrap();
    }

    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(poolmgr.reap_idle().await.unwrap(), 3);
    assert_eq!(poolmgr.reap_idle().await.unwrap(), 0);

    let stats = executor
        .context()
        .fscache
        .pool()
        .stats(&f.cache_key())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.pods, 2);
}
