//! Executor HTTP API.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/v2/getServiceForFunction` | Function JSON in, `host:port` out |
//! | POST | `/v2/tapService` | Deprecated, accepted and ignored |
//! | POST | `/v2/tapServices` | Batch of taps refreshing access times |
//! | POST | `/v2/unTapService` | Release a pool request slot |
//! | POST | `/v2/invalidateService` | Drop a pool service that failed the router |
//! | GET | `/v2/debugInfo` | Pool cache dump |
//! | GET | `/healthz` | Liveness |

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use fission_client::TapServiceRequest;
use fission_core::{ErrorCode, FissionError, Function};
use tracing::{debug, warn};

use crate::executor::Executor;

pub fn build_router(executor: Arc<Executor>) -> Router {
    Router::new()
        .route("/v2/getServiceForFunction", post(get_service_for_function))
        .route("/v2/tapService", post(tap_service))
        .route("/v2/tapServices", post(tap_services))
        .route("/v2/unTapService", post(un_tap_service))
        .route("/v2/invalidateService", post(invalidate_service))
        .route("/v2/debugInfo", get(debug_info))
        .route("/healthz", get(healthz))
        .with_state(executor)
}

fn error_response(err: &FissionError) -> Response {
    // Internal failures are reported as temporary so the router retries.
    let status = match err.code {
        ErrorCode::Internal => StatusCode::SERVICE_UNAVAILABLE,
        code => StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
    };
    (status, err.message.clone()).into_response()
}

fn bad_request(what: &str, e: serde_json::Error) -> Response {
    (StatusCode::BAD_REQUEST, format!("failed to decode {what}: {e}")).into_response()
}

/// POST /v2/getServiceForFunction
pub async fn get_service_for_function(State(executor): State<Arc<Executor>>, body: Bytes) -> Response {
    let function: Function = match serde_json::from_slice(&body) {
        Ok(f) => f,
        Err(e) => return bad_request("function", e),
    };
    match executor.get_service_detached(function.clone()).await {
        Ok(address) => (StatusCode::OK, address).into_response(),
        Err(e) => {
            warn!(function = %function.metadata.name, namespace = %function.metadata.namespace, error = %e, "service lookup failed");
            error_response(&e)
        }
    }
}

/// POST /v2/tapService
pub async fn tap_service() -> StatusCode {
    StatusCode::OK
}

/// POST /v2/tapServices
pub async fn tap_services(State(executor): State<Arc<Executor>>, body: Bytes) -> Response {
    let requests: Vec<TapServiceRequest> = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return bad_request("tap requests", e),
    };
    match executor.tap_services(&requests).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(errors) => {
            debug!(failed = errors.len(), "some taps failed");
            (StatusCode::NOT_FOUND, errors.join("\n")).into_response()
        }
    }
}

/// POST /v2/unTapService
pub async fn un_tap_service(State(executor): State<Arc<Executor>>, body: Bytes) -> Response {
    let request: TapServiceRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return bad_request("un-tap request", e),
    };
    match executor.un_tap_service(&request).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST /v2/invalidateService
pub async fn invalidate_service(State(executor): State<Arc<Executor>>, body: Bytes) -> Response {
    let request: TapServiceRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return bad_request("invalidation request", e),
    };
    match executor.invalidate_service(&request).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /v2/debugInfo
pub async fn debug_info(State(executor): State<Arc<Executor>>) -> Response {
    match executor.debug_info().await {
        Ok(dump) => (StatusCode::OK, dump).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /healthz
pub async fn healthz() -> StatusCode {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use fission_client::SpecializeRequest;
    use fission_core::ExecutorType;
    use fission_orchestrator::InMemoryOrchestrator;
    use fission_state::StateStore;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::specializer::{SpecializeFuture, Specializer};

    struct NoopSpecializer;

    impl Specializer for NoopSpecializer {
        fn specialize<'a>(&'a self, _url: &'a str, _req: &'a SpecializeRequest) -> SpecializeFuture<'a> {
            Box::pin(async { Ok(()) })
        }
    }

    fn executor() -> Arc<Executor> {
        Arc::new(Executor::with_specializer(
            StateStore::open_in_memory().unwrap(),
            Arc::new(InMemoryOrchestrator::new()),
            Default::default(),
            Arc::new(NoopSpecializer),
        ))
    }

    fn post_json(uri: &str, body: String) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    async fn text(resp: Response) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn service_lookup_returns_address() {
        let exec = executor();
        crate::context::testing::environment(exec.context(), "python", 1);
        let f = crate::context::testing::function(exec.context(), "hello", "python");

        let resp = build_router(exec)
            .oneshot(post_json("/v2/getServiceForFunction", serde_json::to_string(&f).unwrap()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(text(resp).await.ends_with(":8888"));
    }

    #[tokio::test]
    async fn malformed_function_is_rejected() {
        let resp = build_router(executor())
            .oneshot(post_json("/v2/getServiceForFunction", "{not json".into()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_environment_is_not_found() {
        let exec = executor();
        let f = crate::context::testing::function(exec.context(), "hello", "missing");
        let resp = build_router(exec)
            .oneshot(post_json("/v2/getServiceForFunction", serde_json::to_string(&f).unwrap()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn failed_taps_answer_not_found() {
        let exec = executor();
        let f = crate::context::testing::function(exec.context(), "hello", "python");
        let taps = vec![TapServiceRequest::new(&f.metadata, ExecutorType::Poolmgr, "http://10.0.0.1:8888")];
        let resp = build_router(exec)
            .oneshot(post_json("/v2/tapServices", serde_json::to_string(&taps).unwrap()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(text(resp).await.contains("10.0.0.1:8888"));
    }

    #[tokio::test]
    async fn un_tap_of_newdeploy_is_bad_request() {
        let exec = executor();
        let f = crate::context::testing::function(exec.context(), "hello", "python");
        let req = TapServiceRequest::new(&f.metadata, ExecutorType::Newdeploy, "svc:80");
        let resp = build_router(exec)
            .oneshot(post_json("/v2/unTapService", serde_json::to_string(&req).unwrap()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_and_debug_endpoints() {
        let app = build_router(executor());
        let resp = app
            .clone()
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = app
            .oneshot(Request::get("/v2/debugInfo").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = build_router(executor())
            .oneshot(post_json("/v2/tapService", "{}".into()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
