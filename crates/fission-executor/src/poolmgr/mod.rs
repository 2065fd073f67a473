//! The `poolmgr` executor: functions served from pre-warmed pool pods.
//!
//! # Architecture
//!
//! - **`pool`** — [`GenericPool`], one warm-pod deployment per environment
//!   revision
//! - [`GenericPoolManager`] — owns the pools (keyed by environment uid) and
//!   drives the pool cache: every specialization is bracketed by
//!   `specialization_start` and either `set_svc_value` +
//!   `specialization_end` or `mark_specialization_failure`
//!
//! Pools are created lazily on first use, serialized by the pool map's
//! lock so two requests never create the same pool twice.

pub mod pool;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use fission_core::labels::{
    ANNOTATION_SVC_HOST, ENVIRONMENT_NAME, ENVIRONMENT_NAMESPACE, EXECUTOR_INSTANCEID, EXECUTOR_TYPE,
    FUNCTION_NAME, FUNCTION_NAMESPACE, FUNCTION_RESOURCE_VERSION, FUNCTION_UID, MANAGED,
};
use fission_core::{
    AllowedFunctionsPerContainer, Environment, ExecutorType, FissionError, FissionResult, Function,
    FunctionKey, ObjectMeta,
};
use fission_fscache::{Admission, FuncSvc, ObjectRef};
use fission_orchestrator::{MetaPatch, Pod, Selector};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use pool::GenericPool;

use crate::context::ExecutorContext;
use crate::specializer::Specializer;

pub struct GenericPoolManager {
    ctx: ExecutorContext,
    specializer: Arc<dyn Specializer>,
    pools: Mutex<HashMap<String, Arc<GenericPool>>>,
}

impl GenericPoolManager {
    pub fn new(ctx: ExecutorContext, specializer: Arc<dyn Specializer>) -> Self {
        Self {
            ctx,
            specializer,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// The pool for `env`, created on first use. A pool built for an older
    /// revision of the environment is destroyed and replaced.
    pub async fn pool(&self, env: &Environment) -> FissionResult<Arc<GenericPool>> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(&env.metadata.uid) {
            if pool.environment().metadata.resource_version == env.metadata.resource_version {
                return Ok(pool.clone());
            }
            let stale = pool.clone();
            pools.remove(&env.metadata.uid);
            stale.destroy().await?;
        }
        let pool = Arc::new(GenericPool::create(self.ctx.clone(), self.specializer.clone(), env.clone()).await?);
        pools.insert(env.metadata.uid.clone(), pool.clone());
        Ok(pool)
    }

    /// Tear down the pool of environment `uid`, if there is one.
    pub async fn destroy_pool(&self, uid: &str) -> FissionResult<()> {
        let pool = self.pools.lock().await.remove(uid);
        if let Some(pool) = pool {
            pool.destroy().await?;
        }
        Ok(())
    }

    pub async fn pool_count(&self) -> usize {
        self.pools.lock().await.len()
    }

    // ── Capabilities ───────────────────────────────────────────────

    /// Specialize a new pod for `function` and publish it, reserving one
    /// request slot for the caller.
    pub async fn get_func_svc(&self, function: &Function) -> FissionResult<FuncSvc> {
        let key = function.cache_key();
        let cache = self.ctx.fscache.pool();
        cache.specialization_start(&key, function.concurrency()).await?;

        let budget = function.specialization_timeout() + self.ctx.config.specialization_buffer;
        let deadline = Instant::now() + budget;
        let result = match tokio::time::timeout(budget, self.specialize(function, deadline)).await {
            Ok(result) => result,
            Err(_) => Err(FissionError::timeout(format!(
                "specializing function {}/{} took longer than {budget:?}",
                function.metadata.namespace, function.metadata.name
            ))),
        };

        let fsvc = match result {
            Ok(fsvc) => fsvc,
            Err(e) => {
                cache.mark_specialization_failure(&key, e.clone()).await?;
                return Err(e);
            }
        };

        let retain = function.spec.retain_pods;
        if let Err(e) = cache
            .set_svc_value(&key, fsvc.clone(), fsvc.cpu_limit_millis, function.requests_per_pod(), retain)
            .await
        {
            cache.mark_specialization_failure(&key, e.clone()).await?;
            self.delete_pods_of(&fsvc).await;
            return Err(e);
        }
        cache.specialization_end(&key).await?;
        if let Some(pod) = fsvc.object(ObjectRef::POD) {
            self.ctx.fscache.set_pod(&pod_key(pod), &fsvc).await?;
        }
        Ok(fsvc)
    }

    async fn specialize(&self, function: &Function, deadline: Instant) -> FissionResult<FuncSvc> {
        let env = self.ctx.environment(function).await?;
        let pool = self.pool(&env).await?;
        pool.get_func_svc(function, deadline).await
    }

    /// Admission against the pool cache. A parked request waits for its
    /// slot up to the specialization budget. One-shot functions never
    /// reuse a pod.
    pub async fn get_func_svc_from_cache(&self, function: &Function) -> FissionResult<FuncSvc> {
        if function.spec.onceonly {
            return Err(FissionError::not_found("one-shot functions are not cached"));
        }
        let key = function.cache_key();
        let admission = self
            .ctx
            .fscache
            .pool()
            .admit(&key, function.requests_per_pod(), function.concurrency())
            .await?;
        match admission {
            Admission::Ready(fsvc) => Ok(fsvc),
            Admission::Wait(handle) => {
                let budget = function.specialization_timeout() + self.ctx.config.specialization_buffer;
                match tokio::time::timeout(budget, handle.wait()).await {
                    Ok(result) => result,
                    Err(_) => Err(FissionError::timeout(format!(
                        "timed out waiting for a pod of function '{key}'"
                    ))),
                }
            }
        }
    }

    /// The pod behind `fsvc` still exists, is ready, and owns the address.
    pub async fn is_valid(&self, fsvc: &FuncSvc) -> bool {
        let Some(object) = fsvc.object(ObjectRef::POD) else {
            return false;
        };
        match self.ctx.orchestrator.get_pod(&object.namespace, &object.name).await {
            Ok(Some(pod)) => pod.is_ready() && (self.ctx.config.enable_istio || fsvc.address.contains(&pod.ip)),
            Ok(None) => false,
            Err(e) => {
                warn!(pod = %object.name, error = %e, "failed to validate function pod");
                false
            }
        }
    }

    /// Forget `fsvc` and delete its pod.
    pub async fn delete_func_svc_from_cache(&self, fsvc: &FuncSvc) -> FissionResult<()> {
        self.ctx.fscache.pool().delete_value(&fsvc.key(), &fsvc.address).await?;
        self.delete_pods_of(fsvc).await;
        Ok(())
    }

    pub async fn tap_service(&self, meta: &ObjectMeta, address: &str) -> FissionResult<()> {
        self.ctx
            .fscache
            .pool()
            .touch(&FunctionKey::from_meta(meta), address)
            .await
    }

    /// Give back the request slot a caller held on `address`.
    pub async fn un_tap_service(&self, meta: &ObjectMeta, address: &str) -> FissionResult<()> {
        self.ctx
            .fscache
            .pool()
            .mark_available(&FunctionKey::from_meta(meta), address)
            .await
    }

    /// `address` failed a caller: forget it together with any slots held on
    /// it and delete its pod, so the next lookup specializes a fresh one.
    pub async fn invalidate_service(&self, meta: &ObjectMeta, address: &str) -> FissionResult<()> {
        self.ctx
            .fscache
            .pool()
            .delete_value(&FunctionKey::from_meta(meta), address)
            .await?;
        for (pod, fsvc) in self.ctx.fscache.pods_of(&meta.uid).await? {
            if fsvc.address == address {
                self.ctx.fscache.remove_pod(&pod).await?;
                self.delete_pods_of(&fsvc).await;
            }
        }
        info!(function = %meta.name, %address, "function service invalidated");
        Ok(())
    }

    /// Drop every specialized pod of `function` so the next request loads
    /// fresh config maps and secrets.
    pub async fn refresh_func_pods(&self, function: &Function) -> FissionResult<()> {
        self.recycle_function(&function.metadata).await?;
        info!(function = %function.metadata.name, "function pods refreshed");
        Ok(())
    }

    /// The function is gone: refuse further inserts and recycle its pods.
    pub async fn function_deleted(&self, meta: &ObjectMeta) -> FissionResult<()> {
        self.ctx.fscache.pool().mark_func_deleted(&meta.uid).await?;
        self.recycle_function(meta).await
    }

    async fn recycle_function(&self, meta: &ObjectMeta) -> FissionResult<()> {
        let pool = self.ctx.fscache.pool();
        for (pod, fsvc) in self.ctx.fscache.pods_of(&meta.uid).await? {
            pool.delete_value(&fsvc.key(), &fsvc.address).await?;
            self.ctx.fscache.remove_pod(&pod).await?;
        }
        let selector = Selector::new()
            .with(FUNCTION_UID, &meta.uid)
            .with(EXECUTOR_TYPE, &ExecutorType::Poolmgr.to_string());
        for pod in self.ctx.orchestrator.list_pods(None, &selector).await? {
            self.delete_pod(&pod.metadata.namespace, &pod.metadata.name).await;
        }
        Ok(())
    }

    /// Idle pods beyond each function's retain quota are deleted.
    pub async fn reap_idle(&self) -> FissionResult<usize> {
        let pool = self.ctx.fscache.pool();
        let now = Instant::now();
        let mut reaped = 0;
        for fsvc in pool.list_available_value().await? {
            if fsvc.environment.spec.allowed_functions_per_container == AllowedFunctionsPerContainer::Infinite {
                continue;
            }
            let idle_timeout = match self
                .ctx
                .current_function(&fsvc.function.namespace, &fsvc.function.name)?
            {
                Some(f) if f.metadata.uid == fsvc.function.uid => f.idle_timeout(),
                // Deleted or recreated: nothing left to keep warm for.
                _ => std::time::Duration::ZERO,
            };
            if fsvc.idle_for(now) < idle_timeout {
                continue;
            }
            if pool.delete_if_idle(&fsvc.key(), &fsvc.address, idle_timeout).await? {
                debug!(function = %fsvc.function.name, address = %fsvc.address, "reaping idle pod");
                self.delete_pods_of(&fsvc).await;
                if let Some(pod) = fsvc.object(ObjectRef::POD) {
                    self.ctx.fscache.remove_pod(&pod_key(pod)).await?;
                }
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    // ── Restart handling ───────────────────────────────────────────

    /// Take over pools and specialized pods left behind by a previous
    /// executor instance.
    pub async fn adopt_existing_resources(&self) -> FissionResult<usize> {
        for env in self.ctx.store.list::<Environment>()? {
            if env.spec.poolsize > 0 {
                self.pool(&env).await?;
            }
        }

        let selector = Selector::new().with(EXECUTOR_TYPE, &ExecutorType::Poolmgr.to_string());
        let mut adopted = 0;
        for pod in self.ctx.orchestrator.list_pods(None, &selector).await? {
            if !pod.is_ready() {
                continue;
            }
            let patch = MetaPatch {
                annotations: BTreeMap::from([(EXECUTOR_INSTANCEID.to_string(), self.ctx.instance_id.clone())]),
                ..Default::default()
            };
            let pod = match self
                .ctx
                .orchestrator
                .patch_pod(&pod.metadata.namespace, &pod.metadata.name, &patch)
                .await
            {
                Ok(pod) => pod,
                Err(e) => {
                    warn!(pod = %pod.metadata.name, error = %e, "failed to adopt pod");
                    continue;
                }
            };
            if pod.label(MANAGED) == Some("true") {
                continue;
            }
            match self.rebuild_func_svc(&pod) {
                Some(fsvc) => {
                    let key = fsvc.key();
                    // Republish as idle: the slot set_svc_value reserves is
                    // released straight away.
                    let cache = self.ctx.fscache.pool();
                    cache
                        .set_svc_value(&key, fsvc.clone(), fsvc.cpu_limit_millis, 1, 0)
                        .await?;
                    cache.mark_available(&key, &fsvc.address).await?;
                    self.ctx.fscache.set_pod(&format!("{}/{}", pod.metadata.namespace, pod.metadata.name), &fsvc).await?;
                    adopted += 1;
                }
                None => debug!(pod = %pod.metadata.name, "specialized pod lacks function metadata, not adopted"),
            }
        }
        info!(adopted, "poolmgr resources adopted");
        Ok(adopted)
    }

    fn rebuild_func_svc(&self, pod: &Pod) -> Option<FuncSvc> {
        let name = pod.label(FUNCTION_NAME)?;
        let namespace = pod.label(FUNCTION_NAMESPACE)?;
        let uid = pod.label(FUNCTION_UID)?;
        let env_name = pod.label(ENVIRONMENT_NAME)?;
        let env_namespace = pod.label(ENVIRONMENT_NAMESPACE)?;
        let resource_version = pod.metadata.annotations.get(FUNCTION_RESOURCE_VERSION)?;
        let address = pod.metadata.annotations.get(ANNOTATION_SVC_HOST)?;

        let function = self.ctx.store.get::<Function>(namespace, name).ok()??;
        if function.metadata.uid != uid || &function.metadata.resource_version != resource_version {
            return None;
        }
        let env = self.ctx.store.get::<Environment>(env_namespace, env_name).ok()??;

        let mut object = ObjectRef::new(ObjectRef::POD, &pod.metadata.namespace, &pod.metadata.name);
        object.uid = pod.metadata.uid.clone();
        let mut fsvc = FuncSvc::new(function.metadata, env, address.clone(), ExecutorType::Poolmgr).with_object(object);
        fsvc.name = pod.metadata.name.clone();
        Some(fsvc)
    }

    /// Delete pool deployments and orphaned pods stamped by another
    /// executor instance. Pods still owned by a deployment go with it.
    pub async fn cleanup_old_executor_objects(&self) -> FissionResult<usize> {
        let orch = &self.ctx.orchestrator;
        let selector = Selector::new().with(EXECUTOR_TYPE, &ExecutorType::Poolmgr.to_string());
        let stale = |meta: &ObjectMeta| {
            meta.annotations
                .get(EXECUTOR_INSTANCEID)
                .is_some_and(|id| *id != self.ctx.instance_id)
        };

        let mut deleted = 0;
        for d in orch.list_deployments(None, &selector).await? {
            if stale(&d.metadata) {
                match orch.delete_deployment(&d.metadata.namespace, &d.metadata.name).await {
                    Ok(()) => deleted += 1,
                    Err(e) if e.is_not_found() => {}
                    Err(e) => warn!(deployment = %d.metadata.name, error = %e, "failed to delete old deployment"),
                }
            }
        }
        for pod in orch.list_pods(None, &selector).await? {
            if pod.owner.is_none() && stale(&pod.metadata) {
                self.delete_pod(&pod.metadata.namespace, &pod.metadata.name).await;
                deleted += 1;
            }
        }
        if deleted > 0 {
            info!(deleted, "removed objects of old executor instances");
        }
        Ok(deleted)
    }

    async fn delete_pods_of(&self, fsvc: &FuncSvc) {
        for object in fsvc.kube_objects.iter().filter(|o| o.kind == ObjectRef::POD) {
            self.delete_pod(&object.namespace, &object.name).await;
        }
    }

    async fn delete_pod(&self, namespace: &str, name: &str) {
        match self.ctx.orchestrator.delete_pod(namespace, name).await {
            Ok(()) => debug!(pod = %name, "pod deleted"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(pod = %name, error = %e, "failed to delete pod"),
        }
    }
}

fn pod_key(object: &ObjectRef) -> String {
    format!("{}/{}", object.namespace, object.name)
}
