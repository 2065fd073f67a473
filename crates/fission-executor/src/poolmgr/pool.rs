//! A warm pool of generic runtime pods for one environment revision.
//!
//! # Architecture
//!
//! The pool is a deployment whose selector includes `managed=true`. Taking
//! a pod for a function relabels it (`managed=false` plus the function
//! labels), which releases it from the deployment; the deployment then
//! stamps out a replacement, keeping the pool at `poolsize` warm pods.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fission_core::labels::{self, ANNOTATION_SVC_HOST, EXECUTOR_INSTANCEID, EXECUTOR_TYPE, MANAGED};
use fission_core::{
    AllowedFunctionsPerContainer, ConfigMap, Environment, ExecutorType, FissionError, FissionResult, Function,
    Secret,
};
use fission_fscache::{FuncSvc, ObjectRef};
use fission_orchestrator::{
    Container, Deployment, MetaPatch, OrchestratorError, Pod, PodTemplate, Selector,
};
use rand::seq::SliceRandom;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::context::ExecutorContext;
use crate::specializer::{
    FETCHER_SERVICE_ACCOUNT, Specializer, fetcher_container, fetcher_url, specialize_request, url_host,
};

const MIN_POD_BACKOFF: Duration = Duration::from_millis(100);
const MAX_POD_BACKOFF: Duration = Duration::from_secs(3);

/// Share of a pod's CPU limit admission lets requests use.
const CPU_LIMIT_FRACTION: f64 = 0.85;

pub struct GenericPool {
    ctx: ExecutorContext,
    specializer: Arc<dyn Specializer>,
    env: Environment,
    namespace: String,
    deployment_name: String,
    /// Matches the pool's unspecialized pods.
    selector: Selector,
}

impl GenericPool {
    /// Create the pool deployment, or take over an existing one of the same
    /// environment revision.
    pub async fn create(
        ctx: ExecutorContext,
        specializer: Arc<dyn Specializer>,
        env: Environment,
    ) -> FissionResult<Self> {
        let namespace = ctx.namespace_for(&env.metadata.namespace);
        let deployment_name = labels::truncate_name(&format!(
            "poolmgr-{}-{}-{}",
            env.metadata.name, env.metadata.namespace, env.metadata.resource_version
        ));
        let mut pool_labels = labels::environment_labels(&env.metadata);
        pool_labels.insert(EXECUTOR_TYPE.to_string(), ExecutorType::Poolmgr.to_string());
        pool_labels.insert(MANAGED.to_string(), "true".to_string());

        let pool = Self {
            ctx,
            specializer,
            env,
            namespace,
            deployment_name,
            selector: Selector::from(pool_labels),
        };
        pool.ensure_deployment().await?;
        Ok(pool)
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn deployment_name(&self) -> &str {
        &self.deployment_name
    }

    async fn ensure_deployment(&self) -> FissionResult<()> {
        let orch = &self.ctx.orchestrator;
        match orch.create_deployment(self.deployment_spec()?).await {
            Ok(d) => {
                info!(deployment = %d.metadata.name, namespace = %self.namespace, replicas = d.replicas, "pool created");
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                let Some(mut existing) = orch.get_deployment(&self.namespace, &self.deployment_name).await? else {
                    return Err(e.into());
                };
                existing
                    .metadata
                    .annotations
                    .insert(EXECUTOR_INSTANCEID.to_string(), self.ctx.instance_id.clone());
                existing.replicas = self.env.spec.poolsize;
                orch.update_deployment(existing).await?;
                info!(deployment = %self.deployment_name, namespace = %self.namespace, "pool adopted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn deployment_spec(&self) -> FissionResult<Deployment> {
        let env = &self.env;
        let config = &self.ctx.config;
        let annotations = BTreeMap::from([(EXECUTOR_INSTANCEID.to_string(), self.ctx.instance_id.clone())]);

        let runtime = Container {
            name: env.metadata.name.clone(),
            image: env.spec.runtime.image.clone(),
            ports: vec![config.runtime_port],
            resources: env.spec.resources,
            ..Default::default()
        };
        let fetcher = fetcher_container(config.fetcher_port, None)?;

        let mut metadata = fission_core::ObjectMeta::new(&self.namespace, &self.deployment_name);
        metadata.labels = self.selector.0.clone();
        metadata.annotations = annotations.clone();
        Ok(Deployment {
            metadata,
            replicas: env.spec.poolsize,
            selector: self.selector.clone(),
            template: PodTemplate {
                labels: self.selector.0.clone(),
                annotations,
                containers: vec![runtime, fetcher],
                service_account: FETCHER_SERVICE_ACCOUNT.to_string(),
                image_pull_secret: env.spec.image_pull_secret.clone(),
                termination_grace_period: env.spec.termination_grace_period,
            },
            ..Default::default()
        })
    }

    /// Delete the pool deployment together with its unspecialized pods.
    pub async fn destroy(&self) -> FissionResult<()> {
        match self
            .ctx
            .orchestrator
            .delete_deployment(&self.namespace, &self.deployment_name)
            .await
        {
            Ok(()) => {
                info!(deployment = %self.deployment_name, "pool destroyed");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // ── Specialization ─────────────────────────────────────────────

    /// Take a warm pod, load `function` into it and describe the result.
    /// Nothing is published to the pool cache here.
    pub async fn get_func_svc(&self, function: &Function, deadline: Instant) -> FissionResult<FuncSvc> {
        let pod = self.choose_pod(function, deadline).await?;
        debug!(function = %function.metadata.name, pod = %pod.metadata.name, "pod chosen");

        if let Err(e) = self.specialize_pod(&pod, function).await {
            self.schedule_delete(&pod);
            return Err(e.context(format!("specializing pod {}", pod.metadata.name)));
        }

        let address = format!("{}:{}", url_host(&pod.ip), self.ctx.config.runtime_port);
        let patch = MetaPatch {
            annotations: BTreeMap::from([
                (ANNOTATION_SVC_HOST.to_string(), address.clone()),
                (
                    labels::FUNCTION_RESOURCE_VERSION.to_string(),
                    function.metadata.resource_version.clone(),
                ),
            ]),
            ..Default::default()
        };
        if let Err(e) = self
            .ctx
            .orchestrator
            .patch_pod(&pod.metadata.namespace, &pod.metadata.name, &patch)
            .await
        {
            warn!(pod = %pod.metadata.name, error = %e, "failed to annotate specialized pod");
        }

        let mut object = ObjectRef::new(ObjectRef::POD, &pod.metadata.namespace, &pod.metadata.name);
        object.uid = pod.metadata.uid.clone();
        let mut fsvc = FuncSvc::new(function.metadata.clone(), self.env.clone(), address, ExecutorType::Poolmgr)
            .with_object(object);
        fsvc.name = pod.metadata.name.clone();
        fsvc.cpu_limit_millis = admission_cpu_limit(&pod);
        info!(function = %function.metadata.name, pod = %pod.metadata.name, address = %fsvc.address, "pod specialized");
        Ok(fsvc)
    }

    /// Pick a ready pool pod and claim it for `function`, backing off until
    /// the pod-ready timeout or `deadline`, whichever comes first.
    async fn choose_pod(&self, function: &Function, deadline: Instant) -> FissionResult<Pod> {
        let orch = &self.ctx.orchestrator;
        let give_up = (Instant::now() + self.ctx.config.pod_ready_timeout)
            .min(deadline.checked_sub(Duration::from_secs(1)).unwrap_or(deadline));
        let shared = self.env.spec.allowed_functions_per_container == AllowedFunctionsPerContainer::Infinite;
        let mut delay = MIN_POD_BACKOFF;

        loop {
            let ready: Vec<Pod> = orch
                .list_pods(Some(&self.namespace), &self.selector)
                .await?
                .into_iter()
                .filter(Pod::is_ready)
                .collect();

            let candidate = ready.choose(&mut rand::thread_rng()).cloned();
            if let Some(pod) = candidate {
                if shared {
                    return Ok(pod);
                }
                match self.claim(&pod, function).await {
                    Ok(pod) => return Ok(pod),
                    // Somebody else got it first.
                    Err(OrchestratorError::Conflict { .. }) | Err(OrchestratorError::NotFound { .. }) => {
                        debug!(pod = %pod.metadata.name, "pod claimed concurrently, retrying");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            if Instant::now() + delay > give_up {
                return Err(FissionError::timeout(format!(
                    "timeout waiting for a ready pod in pool {}",
                    self.deployment_name
                )));
            }
            debug!(pool = %self.deployment_name, ?delay, "no ready pool pod, waiting");
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_POD_BACKOFF);
        }
    }

    async fn claim(&self, pod: &Pod, function: &Function) -> Result<Pod, OrchestratorError> {
        let mut claim_labels = labels::function_labels(&function.metadata, &self.env.metadata);
        claim_labels.insert(MANAGED.to_string(), "false".to_string());
        claim_labels.insert(EXECUTOR_TYPE.to_string(), ExecutorType::Poolmgr.to_string());
        let patch = MetaPatch {
            labels: claim_labels,
            annotations: BTreeMap::from([(EXECUTOR_INSTANCEID.to_string(), self.ctx.instance_id.clone())]),
            remove_labels: Vec::new(),
            expected_resource_version: Some(pod.metadata.resource_version.clone()),
        };
        self.ctx
            .orchestrator
            .patch_pod(&pod.metadata.namespace, &pod.metadata.name, &patch)
            .await
    }

    async fn specialize_pod(&self, pod: &Pod, function: &Function) -> FissionResult<()> {
        let store = &self.ctx.store;
        for cm in &function.spec.config_maps {
            if store.get::<ConfigMap>(&cm.namespace, &cm.name)?.is_none() {
                return Err(FissionError::not_found(format!(
                    "config map {}/{} not found",
                    cm.namespace, cm.name
                )));
            }
        }
        for secret in &function.spec.secrets {
            if store.get::<Secret>(&secret.namespace, &secret.name)?.is_none() {
                return Err(FissionError::not_found(format!(
                    "secret {}/{} not found",
                    secret.namespace, secret.name
                )));
            }
        }

        let url = fetcher_url(&pod.ip, self.ctx.config.fetcher_port);
        let req = specialize_request(function, &self.env);
        self.specializer.specialize(&url, &req).await
    }

    fn schedule_delete(&self, pod: &Pod) {
        let orch = self.ctx.orchestrator.clone();
        let namespace = pod.metadata.namespace.clone();
        let name = pod.metadata.name.clone();
        tokio::spawn(async move {
            if let Err(e) = orch.delete_pod(&namespace, &name).await {
                if !e.is_not_found() {
                    warn!(pod = %name, error = %e, "failed to delete pod after specialization failure");
                }
            }
        });
    }
}

/// `ceil(0.85 × limit)`; zero stays unlimited.
fn admission_cpu_limit(pod: &Pod) -> u64 {
    (pod.cpu_limit_millis() as f64 * CPU_LIMIT_FRACTION).ceil() as u64
}
