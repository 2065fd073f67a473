//! The `newdeploy` and `container` executors: one deployment and one
//! service per function.
//!
//! Both flavors share the lifecycle here and differ only in the pod they
//! run. `newdeploy` pods are an environment runtime plus a fetcher that
//! specializes at start-up; `container` pods run the user's image as is.
//! Served functions are tracked in the function-service cache; the
//! deployment's own autoscaling handles load.

use std::collections::BTreeMap;
use std::time::Duration;

use fission_core::labels::{
    self, ANNOTATION_CONFIG_VERSION, EXECUTOR_INSTANCEID, EXECUTOR_TYPE, FUNCTION_NAME, FUNCTION_NAMESPACE,
    FUNCTION_RESOURCE_VERSION, FUNCTION_UID,
};
use fission_core::{Environment, ExecutorType, FissionError, FissionResult, Function, ObjectMeta};
use fission_fscache::{FuncSvc, ObjectRef};
use fission_orchestrator::{Autoscaling, Container, Deployment, PodTemplate, Selector, Service};
use fission_state::Change;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::context::ExecutorContext;
use crate::specializer::{FETCHER_SERVICE_ACCOUNT, fetcher_container, specialize_request};

const SERVICE_PORT: u16 = 80;
const MIN_WAIT_BACKOFF: Duration = Duration::from_millis(50);
const MAX_WAIT_BACKOFF: Duration = Duration::from_secs(1);

pub struct DeployManager {
    ctx: ExecutorContext,
    flavor: ExecutorType,
}

impl DeployManager {
    /// `flavor` is [`ExecutorType::Newdeploy`] or [`ExecutorType::Container`].
    pub fn new(ctx: ExecutorContext, flavor: ExecutorType) -> Self {
        Self { ctx, flavor }
    }

    pub fn flavor(&self) -> ExecutorType {
        self.flavor
    }

    /// Name of the deployment and service of `meta`.
    pub fn object_name(&self, meta: &ObjectMeta) -> String {
        labels::truncate_name(&format!("{}-{}-{}", self.flavor, meta.name, meta.namespace))
    }

    fn selector(&self, meta: &ObjectMeta) -> Selector {
        Selector::new()
            .with(FUNCTION_UID, &meta.uid)
            .with(EXECUTOR_TYPE, &self.flavor.to_string())
    }

    async fn environment_of(&self, function: &Function) -> FissionResult<Option<Environment>> {
        match self.flavor {
            ExecutorType::Container => match self.ctx.environment(function).await {
                Ok(env) => Ok(Some(env)),
                Err(e) if e.is(fission_core::ErrorCode::NotFound) => Ok(None),
                Err(e) => Err(e),
            },
            _ => self.ctx.environment(function).await.map(Some),
        }
    }

    // ── Object specs ───────────────────────────────────────────────

    fn deployment_spec(&self, function: &Function, env: Option<&Environment>) -> FissionResult<Deployment> {
        let config = &self.ctx.config;
        let meta = &function.metadata;
        let mut object_labels = match env {
            Some(env) => labels::function_labels(meta, &env.metadata),
            None => BTreeMap::from([
                (FUNCTION_NAME.to_string(), meta.name.clone()),
                (FUNCTION_NAMESPACE.to_string(), meta.namespace.clone()),
                (FUNCTION_UID.to_string(), meta.uid.clone()),
            ]),
        };
        object_labels.insert(EXECUTOR_TYPE.to_string(), self.flavor.to_string());

        let (containers, service_account) = match self.flavor {
            ExecutorType::Container => {
                let spec = function.spec.container.as_ref().ok_or_else(|| {
                    FissionError::invalid_argument(format!("function {} has no container spec", meta.name))
                })?;
                let container = Container {
                    name: meta.name.clone(),
                    image: spec.image.clone(),
                    command: spec.command.clone(),
                    args: spec.args.clone(),
                    env: spec.env.clone(),
                    ports: vec![self.target_port(function)],
                    resources: function.spec.resources,
                    ..Default::default()
                };
                (vec![container], String::new())
            }
            _ => {
                let env = env.ok_or_else(|| FissionError::not_found("function environment not found"))?;
                let resources = if function.spec.resources == Default::default() {
                    env.spec.resources
                } else {
                    function.spec.resources
                };
                let runtime = Container {
                    name: meta.name.clone(),
                    image: env.spec.runtime.image.clone(),
                    ports: vec![config.runtime_port],
                    resources,
                    ..Default::default()
                };
                let req = specialize_request(function, env);
                let fetcher = fetcher_container(config.fetcher_port, Some(&req))?;
                (vec![runtime, fetcher], FETCHER_SERVICE_ACCOUNT.to_string())
            }
        };

        let strategy = &function.spec.invoke_strategy.execution_strategy;
        let min = strategy.min_scale.max(1);
        let mut metadata = ObjectMeta::new(&self.ctx.namespace_for(&meta.namespace), &self.object_name(meta));
        metadata.labels = object_labels.clone();
        metadata.annotations = BTreeMap::from([
            (EXECUTOR_INSTANCEID.to_string(), self.ctx.instance_id.clone()),
            (FUNCTION_RESOURCE_VERSION.to_string(), meta.resource_version.clone()),
        ]);
        Ok(Deployment {
            metadata,
            replicas: min,
            selector: self.selector(meta),
            template: PodTemplate {
                labels: object_labels,
                containers,
                service_account,
                image_pull_secret: env.map(|e| e.spec.image_pull_secret.clone()).unwrap_or_default(),
                termination_grace_period: env.map(|e| e.spec.termination_grace_period).unwrap_or_default(),
                ..Default::default()
            },
            autoscaling: Some(Autoscaling {
                min_replicas: min,
                max_replicas: strategy.max_scale.max(min),
                target_cpu_percent: strategy.target_cpu_percent,
            }),
            ..Default::default()
        })
    }

    fn target_port(&self, function: &Function) -> u16 {
        match &function.spec.container {
            Some(c) if self.flavor == ExecutorType::Container && c.port != 0 => c.port,
            _ => self.ctx.config.runtime_port,
        }
    }

    fn service_spec(&self, function: &Function, deployment: &Deployment) -> Service {
        let mut metadata = ObjectMeta::new(&deployment.metadata.namespace, &deployment.metadata.name);
        metadata.labels = deployment.metadata.labels.clone();
        metadata.annotations = BTreeMap::from([(EXECUTOR_INSTANCEID.to_string(), self.ctx.instance_id.clone())]);
        Service {
            metadata,
            selector: deployment.selector.clone(),
            port: SERVICE_PORT,
            target_port: self.target_port(function),
            ..Default::default()
        }
    }

    // ── Object lifecycle ───────────────────────────────────────────

    /// Create the deployment, or bring an existing one to `desired`.
    async fn apply_deployment(&self, desired: Deployment) -> FissionResult<Deployment> {
        let orch = &self.ctx.orchestrator;
        match orch.create_deployment(desired.clone()).await {
            Ok(d) => {
                info!(deployment = %d.metadata.name, namespace = %d.metadata.namespace, "function deployment created");
                Ok(d)
            }
            Err(e) if e.is_already_exists() => {
                let Some(mut existing) = orch
                    .get_deployment(&desired.metadata.namespace, &desired.metadata.name)
                    .await?
                else {
                    return Err(e.into());
                };
                let config_version = existing.template.annotations.get(ANNOTATION_CONFIG_VERSION).cloned();
                existing.metadata.labels = desired.metadata.labels;
                existing.metadata.annotations = desired.metadata.annotations;
                existing.replicas = existing.replicas.max(desired.replicas);
                existing.selector = desired.selector;
                existing.template = desired.template;
                if let Some(version) = config_version {
                    existing.template.annotations.insert(ANNOTATION_CONFIG_VERSION.to_string(), version);
                }
                existing.autoscaling = desired.autoscaling;
                Ok(orch.update_deployment(existing).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_service(&self, desired: Service) -> FissionResult<Service> {
        let orch = &self.ctx.orchestrator;
        match orch.create_service(desired.clone()).await {
            Ok(svc) => Ok(svc),
            Err(e) if e.is_already_exists() => orch
                .get_service(&desired.metadata.namespace, &desired.metadata.name)
                .await?
                .ok_or_else(|| e.into()),
            Err(e) => Err(e.into()),
        }
    }

    async fn wait_available(&self, namespace: &str, name: &str, timeout: Duration) -> FissionResult<()> {
        let give_up = Instant::now() + timeout;
        let mut backoff = MIN_WAIT_BACKOFF;
        loop {
            if let Some(d) = self.ctx.orchestrator.get_deployment(namespace, name).await? {
                if d.available_replicas > 0 {
                    return Ok(());
                }
            }
            if Instant::now() + backoff > give_up {
                return Err(FissionError::timeout(format!(
                    "deployment {namespace}/{name} has no available replicas after {timeout:?}"
                )));
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_WAIT_BACKOFF);
        }
    }

    async fn remove_objects(&self, meta: &ObjectMeta) -> FissionResult<()> {
        let namespace = self.ctx.namespace_for(&meta.namespace);
        let name = self.object_name(meta);
        let orch = &self.ctx.orchestrator;
        if let Err(e) = orch.delete_deployment(&namespace, &name).await {
            if !e.is_not_found() {
                return Err(e.into());
            }
        }
        if let Err(e) = orch.delete_service(&namespace, &name).await {
            if !e.is_not_found() {
                return Err(e.into());
            }
        }
        info!(%name, %namespace, "function objects removed");
        Ok(())
    }

    async fn evict(&self, meta: &ObjectMeta) -> FissionResult<()> {
        if let Ok(fsvc) = self.ctx.fscache.get_by_function_uid(&meta.uid).await {
            self.ctx.fscache.delete_entry(&fsvc).await?;
        }
        Ok(())
    }

    // ── Capabilities ───────────────────────────────────────────────

    /// Bring up the function's deployment and service and wait for a
    /// replica. A concurrent creation for the same revision wins.
    pub async fn get_func_svc(&self, function: &Function) -> FissionResult<FuncSvc> {
        let env = self.environment_of(function).await?;
        let deployment = self.apply_deployment(self.deployment_spec(function, env.as_ref())?).await?;
        let service = self.apply_service(self.service_spec(function, &deployment)).await?;
        let (namespace, name) = (&deployment.metadata.namespace, &deployment.metadata.name);
        self.wait_available(namespace, name, function.specialization_timeout())
            .await?;

        let mut deployment_ref = ObjectRef::new(ObjectRef::DEPLOYMENT, namespace, name);
        deployment_ref.uid = deployment.metadata.uid.clone();
        let mut service_ref = ObjectRef::new(ObjectRef::SERVICE, namespace, &service.metadata.name);
        service_ref.uid = service.metadata.uid.clone();
        let mut fsvc = FuncSvc::new(
            function.metadata.clone(),
            env.unwrap_or_default(),
            service.address.clone(),
            self.flavor,
        )
        .with_object(deployment_ref)
        .with_object(service_ref);
        fsvc.name = name.clone();

        match self.ctx.fscache.add(fsvc.clone()).await? {
            Some(existing) => Ok(existing),
            None => {
                debug!(function = %function.metadata.name, address = %fsvc.address, "function service cached");
                Ok(fsvc)
            }
        }
    }

    pub async fn get_func_svc_from_cache(&self, function: &Function) -> FissionResult<FuncSvc> {
        self.ctx.fscache.get_by_function(&function.metadata).await
    }

    /// The service still exists and its deployment has a ready replica.
    pub async fn is_valid(&self, fsvc: &FuncSvc) -> bool {
        let orch = &self.ctx.orchestrator;
        let (Some(svc), Some(dep)) = (fsvc.object(ObjectRef::SERVICE), fsvc.object(ObjectRef::DEPLOYMENT)) else {
            return false;
        };
        let service = orch.get_service(&svc.namespace, &svc.name).await;
        let deployment = orch.get_deployment(&dep.namespace, &dep.name).await;
        matches!(service, Ok(Some(_))) && matches!(deployment, Ok(Some(d)) if d.available_replicas > 0)
    }

    pub async fn delete_func_svc_from_cache(&self, fsvc: &FuncSvc) -> FissionResult<()> {
        self.ctx.fscache.delete_entry(fsvc).await
    }

    pub async fn tap_service(&self, address: &str) -> FissionResult<()> {
        self.ctx.fscache.touch_by_address(address).await
    }

    /// Roll the function's pods so they reload config maps and secrets.
    pub async fn refresh_func_pods(&self, function: &Function) -> FissionResult<()> {
        let namespace = self.ctx.namespace_for(&function.metadata.namespace);
        let name = self.object_name(&function.metadata);
        let Some(mut deployment) = self.ctx.orchestrator.get_deployment(&namespace, &name).await? else {
            return Ok(());
        };
        let next = deployment
            .template
            .annotations
            .get(ANNOTATION_CONFIG_VERSION)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        deployment
            .template
            .annotations
            .insert(ANNOTATION_CONFIG_VERSION.to_string(), next.to_string());
        self.ctx.orchestrator.update_deployment(deployment).await?;
        info!(%name, config_version = next, "function deployment rolled");
        Ok(())
    }

    /// Scale deployments idle past their function's timeout back to
    /// `minScale` and forget their cache entries.
    pub async fn reap_idle(&self) -> FissionResult<usize> {
        let now = Instant::now();
        let mut reaped = 0;
        for fsvc in self.ctx.fscache.list_old(Duration::ZERO).await? {
            if fsvc.executor != self.flavor {
                continue;
            }
            let current = self
                .ctx
                .current_function(&fsvc.function.namespace, &fsvc.function.name)?
                .filter(|f| f.metadata.uid == fsvc.function.uid);
            let idle_timeout = current.as_ref().map_or(Duration::ZERO, Function::idle_timeout);
            if fsvc.idle_for(now) < idle_timeout || !self.ctx.fscache.delete_old(&fsvc, idle_timeout).await? {
                continue;
            }
            reaped += 1;
            let Some(function) = current else {
                self.remove_objects(&fsvc.function).await?;
                continue;
            };
            let Some(dep) = fsvc.object(ObjectRef::DEPLOYMENT) else {
                continue;
            };
            let min_scale = function.spec.invoke_strategy.execution_strategy.min_scale;
            if let Some(mut deployment) = self.ctx.orchestrator.get_deployment(&dep.namespace, &dep.name).await? {
                if deployment.replicas != min_scale {
                    deployment.replicas = min_scale;
                    self.ctx.orchestrator.update_deployment(deployment).await?;
                    debug!(deployment = %dep.name, replicas = min_scale, "idle deployment scaled down");
                }
            }
        }
        Ok(reaped)
    }

    // ── Restart handling ───────────────────────────────────────────

    /// Restamp deployments and services of this flavor with our instance
    /// id and cache the ones that are serving.
    pub async fn adopt_existing_resources(&self) -> FissionResult<usize> {
        let selector = Selector::new().with(EXECUTOR_TYPE, &self.flavor.to_string());
        let orch = &self.ctx.orchestrator;
        let mut adopted = 0;
        for mut deployment in orch.list_deployments(None, &selector).await? {
            deployment
                .metadata
                .annotations
                .insert(EXECUTOR_INSTANCEID.to_string(), self.ctx.instance_id.clone());
            let deployment = orch.update_deployment(deployment).await?;
            let Some(fsvc) = self.rebuild_func_svc(&deployment).await? else {
                continue;
            };
            if deployment.available_replicas > 0 {
                self.ctx.fscache.add(fsvc).await?;
                adopted += 1;
            }
        }
        info!(executor = %self.flavor, adopted, "deployment resources adopted");
        Ok(adopted)
    }

    async fn rebuild_func_svc(&self, deployment: &Deployment) -> FissionResult<Option<FuncSvc>> {
        let labels = &deployment.metadata.labels;
        let (Some(name), Some(namespace), Some(uid)) = (
            labels.get(FUNCTION_NAME),
            labels.get(FUNCTION_NAMESPACE),
            labels.get(FUNCTION_UID),
        ) else {
            return Ok(None);
        };
        let Some(function) = self.ctx.current_function(namespace, name)? else {
            return Ok(None);
        };
        let revision = deployment.metadata.annotations.get(FUNCTION_RESOURCE_VERSION);
        if &function.metadata.uid != uid || revision != Some(&function.metadata.resource_version) {
            return Ok(None);
        }
        let meta = &deployment.metadata;
        let Some(service) = self.ctx.orchestrator.get_service(&meta.namespace, &meta.name).await? else {
            return Ok(None);
        };
        let env = self.environment_of(&function).await.ok().flatten().unwrap_or_default();
        let mut fsvc = FuncSvc::new(function.metadata, env, service.address, self.flavor)
            .with_object(ObjectRef::new(ObjectRef::DEPLOYMENT, &meta.namespace, &meta.name))
            .with_object(ObjectRef::new(ObjectRef::SERVICE, &meta.namespace, &meta.name));
        fsvc.name = meta.name.clone();
        Ok(Some(fsvc))
    }

    /// Delete deployments stamped by another executor instance, and
    /// services left without a current deployment.
    pub async fn cleanup_old_executor_objects(&self) -> FissionResult<usize> {
        let orch = &self.ctx.orchestrator;
        let selector = Selector::new().with(EXECUTOR_TYPE, &self.flavor.to_string());
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
        for svc in orch.list_services(None, &selector).await? {
            let meta = &svc.metadata;
            if !stale(meta) || orch.get_deployment(&meta.namespace, &meta.name).await?.is_some() {
                continue;
            }
            match orch.delete_service(&meta.namespace, &meta.name).await {
                Ok(()) => deleted += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(service = %meta.name, error = %e, "failed to delete old service"),
            }
        }
        if deleted > 0 {
            info!(executor = %self.flavor, deleted, "removed objects of old executor instances");
        }
        Ok(deleted)
    }

    // ── Catalog events ─────────────────────────────────────────────

    /// React to a function change. Functions of other executor types are
    /// ignored, except when they switch to or away from this one.
    pub async fn on_function_change(&self, change: &Change<Function>) -> FissionResult<()> {
        let ours = |f: &Function| f.executor_type() == self.flavor;
        match change {
            Change::Added(f) if ours(f) && self.wants_eager_start(f) => {
                self.get_func_svc(f).await?;
            }
            Change::Added(_) => {}
            Change::Updated { old, new } => match (ours(old), ours(new)) {
                (true, false) => {
                    self.remove_objects(&old.metadata).await?;
                    self.evict(&old.metadata).await?;
                }
                (false, true) if self.wants_eager_start(new) => {
                    self.get_func_svc(new).await?;
                }
                (true, true) if old.spec != new.spec => {
                    self.evict(&old.metadata).await?;
                    let namespace = self.ctx.namespace_for(&new.metadata.namespace);
                    let exists = self
                        .ctx
                        .orchestrator
                        .get_deployment(&namespace, &self.object_name(&new.metadata))
                        .await?
                        .is_some();
                    if exists || self.wants_eager_start(new) {
                        let env = self.environment_of(new).await?;
                        let deployment = self.apply_deployment(self.deployment_spec(new, env.as_ref())?).await?;
                        self.apply_service(self.service_spec(new, &deployment)).await?;
                        info!(function = %new.metadata.name, "function deployment updated");
                    }
                }
                _ => {}
            },
            Change::Deleted(f) if ours(f) => {
                self.remove_objects(&f.metadata).await?;
                self.evict(&f.metadata).await?;
            }
            Change::Deleted(_) => {}
        }
        Ok(())
    }

    fn wants_eager_start(&self, function: &Function) -> bool {
        function.spec.invoke_strategy.execution_strategy.min_scale > 0
    }
}

#[cfg(test)]
mod tests {
    use fission_core::ContainerSpec;
    use fission_orchestrator::InMemoryOrchestrator;

    use super::*;
    use crate::context::testing::*;

    fn newdeploy_function(ctx: &ExecutorContext) -> Function {
        let mut f = function(ctx, "hello", "python");
        f.spec.invoke_strategy.execution_strategy.executor_type = ExecutorType::Newdeploy;
        f.spec.invoke_strategy.execution_strategy.min_scale = 0;
        f.spec.invoke_strategy.execution_strategy.max_scale = 4;
        ctx.store.update(f).unwrap()
    }

    #[tokio::test]
    async fn newdeploy_creates_deployment_and_service() {
        let orch = InMemoryOrchestrator::new();
        let ctx = context(orch.clone());
        let mgr = DeployManager::new(ctx.clone(), ExecutorType::Newdeploy);
        environment(&ctx, "python", 0);
        let f = newdeploy_function(&ctx);

        let fsvc = mgr.get_func_svc(&f).await.unwrap();
        assert_eq!(fsvc.address, "newdeploy-hello-default.fission-function");
        assert!(mgr.is_valid(&fsvc).await);

        let d = &orch.deployments()[0];
        assert_eq!(d.metadata.name, "newdeploy-hello-default");
        assert_eq!(d.replicas, 1);
        assert_eq!(d.autoscaling.unwrap().max_replicas, 4);
        let fetcher = &d.template.containers[1];
        assert!(fetcher.args.iter().any(|a| a == "-specialize-on-startup"));
        assert_eq!(orch.services()[0].target_port, 8888);

        let cached = mgr.get_func_svc_from_cache(&f).await.unwrap();
        assert_eq!(cached.address, fsvc.address);
    }

    #[tokio::test]
    async fn container_functions_run_the_user_image() {
        let orch = InMemoryOrchestrator::new();
        let ctx = context(orch.clone());
        let mgr = DeployManager::new(ctx.clone(), ExecutorType::Container);
        let mut f = function(&ctx, "web", "none");
        f.spec.invoke_strategy.execution_strategy.executor_type = ExecutorType::Container;
        f.spec.container = Some(ContainerSpec {
            image: "example/web:1".into(),
            port: 8080,
            ..Default::default()
        });
        let f = ctx.store.update(f).unwrap();

        mgr.get_func_svc(&f).await.unwrap();
        let d = &orch.deployments()[0];
        assert_eq!(d.metadata.name, "container-web-default");
        assert_eq!(d.template.containers.len(), 1);
        assert_eq!(d.template.containers[0].image, "example/web:1");
        assert_eq!(orch.services()[0].target_port, 8080);
    }

    #[tokio::test]
    async fn container_without_image_is_rejected() {
        let ctx = context(InMemoryOrchestrator::new());
        let mgr = DeployManager::new(ctx.clone(), ExecutorType::Container);
        let f = function(&ctx, "web", "none");
        let err = mgr.get_func_svc(&f).await.unwrap_err();
        assert!(err.is(fission_core::ErrorCode::InvalidArgument));
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_deployment_times_out() {
        let orch = InMemoryOrchestrator::new().with_auto_ready(false);
        let ctx = context(orch);
        let mgr = DeployManager::new(ctx.clone(), ExecutorType::Newdeploy);
        environment(&ctx, "python", 0);
        let f = newdeploy_function(&ctx);
        let err = mgr.get_func_svc(&f).await.unwrap_err();
        assert!(err.is(fission_core::ErrorCode::Timeout));
    }

    #[tokio::test]
    async fn refresh_bumps_config_version() {
        let orch = InMemoryOrchestrator::new();
        let ctx = context(orch.clone());
        let mgr = DeployManager::new(ctx.clone(), ExecutorType::Newdeploy);
        environment(&ctx, "python", 0);
        let f = newdeploy_function(&ctx);
        mgr.get_func_svc(&f).await.unwrap();

        mgr.refresh_func_pods(&f).await.unwrap();
        mgr.refresh_func_pods(&f).await.unwrap();
        assert_eq!(orch.deployments()[0].template.annotations[ANNOTATION_CONFIG_VERSION], "2");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_deployment_scales_to_min_scale() {
        let orch = InMemoryOrchestrator::new();
        let ctx = context(orch.clone());
        let mgr = DeployManager::new(ctx.clone(), ExecutorType::Newdeploy);
        environment(&ctx, "python", 0);
        let mut f = newdeploy_function(&ctx);
        f.spec.idle_timeout = Some(30);
        let f = ctx.store.update(f).unwrap();
        mgr.get_func_svc(&f).await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(mgr.reap_idle().await.unwrap(), 0);
        tokio::time::advance(Duration::from_secs(25)).await;
        assert_eq!(mgr.reap_idle().await.unwrap(), 1);
        assert_eq!(orch.deployments()[0].replicas, 0);
        assert!(mgr.get_func_svc_from_cache(&f).await.is_err());
    }

    #[tokio::test]
    async fn switching_executor_type_removes_objects() {
        let orch = InMemoryOrchestrator::new();
        let ctx = context(orch.clone());
        let mgr = DeployManager::new(ctx.clone(), ExecutorType::Newdeploy);
        environment(&ctx, "python", 0);
        let old = newdeploy_function(&ctx);
        mgr.get_func_svc(&old).await.unwrap();

        let mut new = old.clone();
        new.spec.invoke_strategy.execution_strategy.executor_type = ExecutorType::Poolmgr;
        mgr.on_function_change(&Change::Updated { old: old.clone(), new })
            .await
            .unwrap();
        assert!(orch.deployments().is_empty());
        assert!(orch.services().is_empty());
        assert!(mgr.get_func_svc_from_cache(&old).await.is_err());
    }

    #[tokio::test]
    async fn min_scale_functions_start_eagerly() {
        let orch = InMemoryOrchestrator::new();
        let ctx = context(orch.clone());
        let mgr = DeployManager::new(ctx.clone(), ExecutorType::Newdeploy);
        environment(&ctx, "python", 0);
        let mut f = newdeploy_function(&ctx);
        f.spec.invoke_strategy.execution_strategy.min_scale = 2;
        let f = ctx.store.update(f).unwrap();

        mgr.on_function_change(&Change::Added(f)).await.unwrap();
        assert_eq!(orch.deployments()[0].replicas, 2);
    }

    #[tokio::test]
    async fn restart_adopts_serving_deployments() {
        let orch = InMemoryOrchestrator::new();
        let ctx = context(orch.clone());
        environment(&ctx, "python", 0);
        let f = newdeploy_function(&ctx);
        DeployManager::new(ctx.clone(), ExecutorType::Newdeploy)
            .get_func_svc(&f)
            .await
            .unwrap();

        let config = fission_core::ExecutorConfig {
            instance_id: Some("exec-b".into()),
            ..Default::default()
        };
        let ctx_b = ExecutorContext::new(ctx.store.clone(), std::sync::Arc::new(orch.clone()), config);
        let mgr_b = DeployManager::new(ctx_b, ExecutorType::Newdeploy);
        assert_eq!(mgr_b.adopt_existing_resources().await.unwrap(), 1);
        assert_eq!(mgr_b.cleanup_old_executor_objects().await.unwrap(), 0);
        assert_eq!(orch.services().len(), 1);
        assert!(mgr_b.get_func_svc_from_cache(&f).await.is_ok());
    }
}
