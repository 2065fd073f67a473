//! The executor service: function in, serving address out.

use std::sync::Arc;

use fission_client::TapServiceRequest;
use fission_core::{ErrorCode, ExecutorType, FissionError, FissionResult, Function};
use fission_fscache::FuncSvc;
use fission_orchestrator::Orchestrator;
use fission_state::StateStore;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::context::ExecutorContext;
use crate::deploy::DeployManager;
use crate::dispatcher::{Dispatcher, Outcome};
use crate::kind::{ExecutorKind, Executors};
use crate::poolmgr::GenericPoolManager;
use crate::specializer::{FetcherSpecializer, Specializer};
use crate::{reaper, watch};

/// Followers re-probe the cache after a creation they did not lead; a
/// request gives up after this many rounds.
const MAX_LOOKUP_ROUNDS: usize = 10;

pub struct Executor {
    ctx: ExecutorContext,
    executors: Executors,
    dispatcher: Dispatcher,
}

impl Executor {
    /// Must be called inside a tokio runtime.
    pub fn new(
        store: StateStore,
        orchestrator: Arc<dyn Orchestrator>,
        config: fission_core::ExecutorConfig,
    ) -> Self {
        Self::with_specializer(store, orchestrator, config, Arc::new(FetcherSpecializer::default()))
    }

    pub fn with_specializer(
        store: StateStore,
        orchestrator: Arc<dyn Orchestrator>,
        config: fission_core::ExecutorConfig,
        specializer: Arc<dyn Specializer>,
    ) -> Self {
        let ctx = ExecutorContext::new(store, orchestrator, config);
        let executors = Executors {
            poolmgr: Arc::new(GenericPoolManager::new(ctx.clone(), specializer)),
            newdeploy: Arc::new(DeployManager::new(ctx.clone(), ExecutorType::Newdeploy)),
            container: Arc::new(DeployManager::new(ctx.clone(), ExecutorType::Container)),
        };
        Self {
            ctx,
            executors,
            dispatcher: Dispatcher::new(),
        }
    }

    pub fn context(&self) -> &ExecutorContext {
        &self.ctx
    }

    pub fn executors(&self) -> &Executors {
        &self.executors
    }

    /// Adopt or clean up what earlier instances left behind, then spawn the
    /// idle reaper and the catalog watcher.
    pub async fn start(self: &Arc<Self>) -> FissionResult<()> {
        for kind in self.executors.all() {
            if self.ctx.config.adopt_existing_resources {
                match kind.adopt_existing_resources().await {
                    Ok(n) => debug!(executor = %kind.executor_type(), adopted = n, "adoption done"),
                    Err(e) => warn!(executor = %kind.executor_type(), error = %e, "adoption failed"),
                }
            }
            if let Err(e) = kind.cleanup_old_executor_objects().await {
                warn!(executor = %kind.executor_type(), error = %e, "cleanup of old objects failed");
            }
        }
        tokio::spawn(reaper::run(self.executors.clone(), self.ctx.config.idle_reap_interval));
        tokio::spawn(watch::run(self.ctx.clone(), self.executors.clone()));
        info!(instance_id = %self.ctx.instance_id, "executor started");
        Ok(())
    }

    /// Address of a service for `function`: a cached one when it is still
    /// valid, otherwise a newly created one. Pool functions return with a
    /// request slot held for the caller.
    pub async fn get_service_for_function(&self, function: &Function) -> FissionResult<String> {
        let kind = self.executors.kind(function.executor_type());
        let budget = function.specialization_timeout() + self.ctx.config.specialization_buffer;
        let deadline = Instant::now() + budget;

        for _ in 0..MAX_LOOKUP_ROUNDS {
            match kind.get_func_svc_from_cache(function).await {
                Ok(fsvc) => {
                    if kind.is_valid(&fsvc).await {
                        debug!(function = %function.metadata.name, address = %fsvc.address, "serving from cache");
                        return Ok(fsvc.address);
                    }
                    self.drop_invalid(&kind, &fsvc).await;
                    continue;
                }
                Err(e) if e.is(ErrorCode::NotFound) => {}
                Err(e) => return Err(e),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let created = tokio::time::timeout(remaining, self.dispatcher.create(kind.clone(), function.clone())).await;
            match created {
                Ok(Ok(Outcome::Served(fsvc))) => return Ok(fsvc.address),
                Ok(Ok(Outcome::Retry)) => continue,
                Ok(Err(e)) => return Err(e),
                Err(_) => break,
            }
        }
        Err(FissionError::timeout(format!(
            "no service for function {}/{} within {budget:?}",
            function.metadata.namespace, function.metadata.name
        )))
    }

    /// Run the lookup on its own task so a creation already under way is
    /// not cut short when the caller goes away. A pool slot taken for a
    /// caller that is no longer waiting is released.
    pub async fn get_service_detached(self: &Arc<Self>, function: Function) -> FissionResult<String> {
        let (tx, rx) = oneshot::channel();
        let executor = self.clone();
        tokio::spawn(async move {
            let result = executor.get_service_for_function(&function).await;
            if let Err(Ok(address)) = tx.send(result) {
                warn!(
                    function = %function.metadata.name,
                    %address,
                    status = ErrorCode::ClientClosed.http_status(),
                    "caller went away during lookup"
                );
                executor.release_abandoned(&function, &address).await;
            }
        });
        rx.await
            .map_err(|_| FissionError::internal("service lookup task ended without an answer"))?
    }

    async fn release_abandoned(&self, function: &Function, address: &str) {
        if function.executor_type() != ExecutorType::Poolmgr {
            return;
        }
        let kind = self.executors.kind(ExecutorType::Poolmgr);
        if let Err(e) = kind.un_tap_service(&function.metadata, address).await {
            warn!(function = %function.metadata.name, %address, error = %e, "failed to release abandoned slot");
        }
    }

    async fn drop_invalid(&self, kind: &ExecutorKind, fsvc: &FuncSvc) {
        info!(function = %fsvc.function.name, address = %fsvc.address, "cached service is gone, dropping it");
        if let Err(e) = kind.delete_func_svc_from_cache(fsvc).await {
            warn!(function = %fsvc.function.name, error = %e, "failed to drop invalid service");
        }
    }

    /// Record use of each listed address. Returns the per-entry errors.
    pub async fn tap_services(&self, requests: &[TapServiceRequest]) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        for req in requests {
            let address = req.service_url.trim_start_matches("http://");
            let kind = self.executors.kind(req.fn_executor_type);
            if let Err(e) = kind.tap_service(&req.fn_metadata, address).await {
                errors.push(format!(
                    "tap {}/{} at {address}: {e}",
                    req.fn_metadata.namespace, req.fn_metadata.name
                ));
            }
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Release the request slot the router held on a pool service.
    pub async fn un_tap_service(&self, req: &TapServiceRequest) -> FissionResult<()> {
        let address = req.service_url.trim_start_matches("http://");
        self.executors
            .kind(req.fn_executor_type)
            .un_tap_service(&req.fn_metadata, address)
            .await
    }

    /// Drop a service the router found broken.
    pub async fn invalidate_service(&self, req: &TapServiceRequest) -> FissionResult<()> {
        let address = req.service_url.trim_start_matches("http://");
        self.executors
            .kind(req.fn_executor_type)
            .invalidate_service(&req.fn_metadata, address)
            .await
    }

    pub async fn debug_info(&self) -> FissionResult<String> {
        self.ctx.fscache.log().await?;
        self.ctx.fscache.pool().log_dump().await
    }
}

#[cfg(test)]
mod tests {
    use fission_client::SpecializeRequest;
    use fission_orchestrator::InMemoryOrchestrator;

    use super::*;
    use crate::specializer::SpecializeFuture;

    struct NoopSpecializer;

    impl Specializer for NoopSpecializer {
        fn specialize<'a>(&'a self, _url: &'a str, _req: &'a SpecializeRequest) -> SpecializeFuture<'a> {
            Box::pin(async { Ok(()) })
        }
    }

    fn executor(orch: &InMemoryOrchestrator) -> Executor {
        let config = fission_core::ExecutorConfig {
            instance_id: Some("exec-a".into()),
            ..Default::default()
        };
        Executor::with_specializer(
            StateStore::open_in_memory().unwrap(),
            Arc::new(orch.clone()),
            config,
            Arc::new(NoopSpecializer),
        )
    }

    fn seed(exec: &Executor) -> Function {
        let ctx = exec.context();
        crate::context::testing::environment(ctx, "python", 1);
        crate::context::testing::function(ctx, "hello", "python")
    }

    #[tokio::test]
    async fn cold_then_warm_lookup() {
        let orch = InMemoryOrchestrator::new();
        let exec = executor(&orch);
        let f = seed(&exec);

        let first = exec.get_service_for_function(&f).await.unwrap();
        assert!(first.ends_with(":8888"));
        let meta = f.metadata.clone();
        exec.un_tap_service(&TapServiceRequest::new(&meta, ExecutorType::Poolmgr, &format!("http://{first}")))
            .await
            .unwrap();

        let second = exec.get_service_for_function(&f).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn vanished_pod_is_replaced() {
        let orch = InMemoryOrchestrator::new();
        let exec = executor(&orch);
        let f = seed(&exec);

        let first = exec.get_service_for_function(&f).await.unwrap();
        exec.un_tap_service(&TapServiceRequest::new(&f.metadata, ExecutorType::Poolmgr, &first))
            .await
            .unwrap();
        let specialized = orch
            .pods()
            .into_iter()
            .find(|p| p.label(fission_core::labels::FUNCTION_UID).is_some())
            .unwrap();
        orch.delete_pod(&specialized.metadata.namespace, &specialized.metadata.name)
            .await
            .unwrap();

        let second = exec.get_service_for_function(&f).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn tap_errors_are_collected() {
        let orch = InMemoryOrchestrator::new();
        let exec = executor(&orch);
        let f = seed(&exec);
        let address = exec.get_service_for_function(&f).await.unwrap();

        let good = TapServiceRequest::new(&f.metadata, ExecutorType::Poolmgr, &format!("http://{address}"));
        let bad = TapServiceRequest::new(&f.metadata, ExecutorType::Poolmgr, "http://10.9.9.9:8888");
        assert!(exec.tap_services(std::slice::from_ref(&good)).await.is_ok());
        let errors = exec.tap_services(&[good, bad]).await.unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("10.9.9.9"));
    }

    struct SlowSpecializer;

    impl Specializer for SlowSpecializer {
        fn specialize<'a>(&'a self, _url: &'a str, _req: &'a SpecializeRequest) -> SpecializeFuture<'a> {
            Box::pin(async {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn abandoned_lookup_releases_its_slot() {
        let orch = InMemoryOrchestrator::new();
        let exec = Arc::new(Executor::with_specializer(
            StateStore::open_in_memory().unwrap(),
            Arc::new(orch.clone()),
            Default::default(),
            Arc::new(SlowSpecializer),
        ));
        let f = seed(&exec);

        let abandoned = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            exec.get_service_detached(f.clone()),
        )
        .await;
        assert!(abandoned.is_err());
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;

        // The specialized pod finished in the background and is free again.
        let stats = exec.context().fscache.pool().stats(&f.cache_key()).await.unwrap().unwrap();
        assert_eq!(stats.pods, 1);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn un_tap_is_pool_only() {
        let orch = InMemoryOrchestrator::new();
        let exec = executor(&orch);
        let f = seed(&exec);
        let req = TapServiceRequest::new(&f.metadata, ExecutorType::Newdeploy, "x:80");
        let err = exec.un_tap_service(&req).await.unwrap_err();
        assert!(err.is(ErrorCode::InvalidArgument));
    }
}
