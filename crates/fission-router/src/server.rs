//! Router HTTP surface.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | any | trigger URLs | Proxied to the trigger's function |
//! | any | `/fission-function/{ns}/{name}[/...]` | Internal function URL |
//! | GET | `/` | 200 unless a trigger claims it |
//! | any | `/router-healthz` | Liveness |
//! | GET | `/_version` | Build version |
//!
//! Everything goes through one axum fallback that looks the request up in
//! the current route table.

use std::borrow::Cow;
use std::sync::Arc;

use axum::{Json, Router};
use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use fission_core::{FissionResult, RouterConfig};
use fission_state::StateStore;

use crate::handler::{ExecutorApi, HandlerContext};
use crate::route::{Endpoint, Lookup, MutableRouter, host_without_port};
use crate::triggerset::TriggerSet;

#[derive(Clone)]
struct AppState {
    router: Arc<MutableRouter>,
    use_encoded_path: bool,
}

/// Axum app dispatching through `router`.
pub fn build_router(router: Arc<MutableRouter>, use_encoded_path: bool) -> Router {
    Router::new().fallback(dispatch).with_state(AppState {
        router,
        use_encoded_path,
    })
}

/// Wire up the router against `store`, publish the first route table and
/// start following catalog changes. Must be called inside a tokio runtime.
pub fn start(
    store: StateStore,
    config: RouterConfig,
    executor: Arc<dyn ExecutorApi>,
) -> FissionResult<(Router, Arc<TriggerSet>)> {
    let use_encoded_path = config.use_encoded_path;
    let ctx = Arc::new(HandlerContext::new(config, executor));
    let router = Arc::new(MutableRouter::default());
    let trigger_set = Arc::new(TriggerSet::new(store, ctx, router.clone()));
    trigger_set.start()?;
    Ok((build_router(router, use_encoded_path), trigger_set))
}

async fn dispatch(State(state): State<AppState>, req: Request<Body>) -> Response {
    let table = state.router.load();
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())
        .map(host_without_port)
        .unwrap_or("")
        .to_string();
    let raw = req.uri().path();
    let path = if state.use_encoded_path { Cow::Borrowed(raw) } else { percent_decode(raw) };

    let endpoint = match table.lookup(req.method(), &host, &path) {
        Lookup::Found(route) => route.endpoint.clone(),
        Lookup::MethodNotAllowed => return StatusCode::METHOD_NOT_ALLOWED.into_response(),
        Lookup::NotFound => return StatusCode::NOT_FOUND.into_response(),
    };
    match endpoint {
        Endpoint::Ok => StatusCode::OK.into_response(),
        Endpoint::Version => Json(serde_json::json!({ "version": fission_core::VERSION })).into_response(),
        Endpoint::Function(handler) => handler.handle(req).await,
    }
}

/// Decode `%XX` escapes; malformed escapes are kept verbatim.
fn percent_decode(path: &str) -> Cow<'_, str> {
    if !path.contains('%') {
        return Cow::Borrowed(path);
    }
    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let hex = |b: u8| (b as char).to_digit(16);
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    match String::from_utf8(out) {
        Ok(decoded) => Cow::Owned(decoded),
        Err(_) => Cow::Borrowed(path),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fission_core::{ExecutorType, FunctionReference, HttpTrigger, HttpTriggerSpec, ObjectMeta};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::handler::testing::{FakeExecutor, config, echo_server, function};

    async fn text(resp: Response) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).header("host", "router.local").body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn fixed_routes_answer() {
        let store = StateStore::open_in_memory().unwrap();
        let (app, _) = start(store, config(), FakeExecutor::answering(vec![])).unwrap();

        let resp = app.clone().oneshot(get("/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = app.clone().oneshot(get("/router-healthz")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = app.clone().oneshot(get("/_version")).await.unwrap();
        assert!(text(resp).await.contains(fission_core::VERSION));
        let resp = app.oneshot(get("/nothing-here")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn trigger_request_reaches_function() {
        let backend = echo_server(StatusCode::OK).await;
        let store = StateStore::open_in_memory().unwrap();
        store.create(function("hello", ExecutorType::Poolmgr)).unwrap();
        store
            .create(HttpTrigger {
                metadata: ObjectMeta::new("default", "hello"),
                spec: HttpTriggerSpec {
                    relative_url: "/hello".into(),
                    method: "POST".into(),
                    function_reference: FunctionReference {
                        name: "hello".into(),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            })
            .unwrap();
        let exec = FakeExecutor::answering(vec![Ok(backend)]);
        let (app, _) = start(store, config(), exec).unwrap();

        let req = Request::post("/hello").header("host", "router.local").body(Body::from("hi")).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(text(resp).await.starts_with("POST / fn=hello"));

        let resp = app.oneshot(get("/hello")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[test]
    fn decodes_escapes() {
        assert_eq!(percent_decode("/a%20b"), "/a b");
        assert_eq!(percent_decode("/plain"), "/plain");
        assert_eq!(percent_decode("/bad%zz"), "/bad%zz");
        assert_eq!(percent_decode("/tail%2"), "/tail%2");
    }
}
