//! Builder service and deployment per environment revision.
//!
//! # Architecture
//!
//! One task owns the watcher. It re-syncs every `env_reconcile_interval`
//! and whenever an environment changes:
//!
//! 1. every v2+ environment with a builder image gets a service and a
//!    deployment named `{env}-{resourceVersion}`, labelled with
//!    [`labels::builder_labels`]
//! 2. builder objects owned by the builder manager whose
//!    `(envName, envNamespace, envResourceVersion)` no longer matches a
//!    builder environment are deleted
//!
//! Builders are found again by label, so a restarted manager adopts the
//! objects a previous one created.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use fission_core::labels::{
    self, BUILDER_ENV_NAME, BUILDER_ENV_NAMESPACE, BUILDER_ENV_RESOURCE_VERSION, BUILDER_SERVICE_ACCOUNT, OWNER,
    OWNER_BUILDERMGR,
};
use fission_core::{BuilderConfig, DEFAULT_NAMESPACE, Environment, ObjectMeta};
use fission_orchestrator::{Container, Deployment, Orchestrator, PodTemplate, Selector, Service};
use fission_state::{CatalogEvent, StateStore};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{BuildError, BuildResult};

pub const FETCHER_IMAGE: &str = "fission/fetcher";
/// Where the fetcher drops sources and the builder writes artifacts.
pub const SHARED_MOUNT_PATH: &str = "/packages";

/// Namespace holding an environment's builder. Environments outside
/// `default` keep their builder next to them.
pub fn builder_namespace(config: &BuilderConfig, env_namespace: &str) -> String {
    if env_namespace.is_empty() || env_namespace == DEFAULT_NAMESPACE {
        config.builder_namespace.clone()
    } else {
        env_namespace.to_string()
    }
}

/// Name shared by the builder service and deployment of `env`'s revision.
pub fn builder_name(env: &Environment) -> String {
    labels::truncate_name(&format!("{}-{}", env.metadata.name, env.metadata.resource_version))
}

fn revision_key(name: &str, namespace: &str, resource_version: &str) -> String {
    format!("{name}-{namespace}-{resource_version}")
}

fn env_key(env: &Environment) -> String {
    revision_key(&env.metadata.name, &env.metadata.namespace, &env.metadata.resource_version)
}

/// Key recorded in a builder object's labels.
fn object_key(meta: &ObjectMeta) -> String {
    let label = |k: &str| meta.labels.get(k).map(String::as_str).unwrap_or_default();
    revision_key(
        label(BUILDER_ENV_NAME),
        label(BUILDER_ENV_NAMESPACE),
        label(BUILDER_ENV_RESOURCE_VERSION),
    )
}

#[derive(Debug, Clone)]
pub struct BuilderInfo {
    pub service: Service,
    pub deployment: Deployment,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BuilderSyncStats {
    pub builders: usize,
    pub services_removed: usize,
    pub deployments_removed: usize,
}

pub struct EnvironmentWatcher {
    store: StateStore,
    orchestrator: Arc<dyn Orchestrator>,
    config: BuilderConfig,
    builders: HashMap<String, BuilderInfo>,
}

impl EnvironmentWatcher {
    pub fn new(store: StateStore, orchestrator: Arc<dyn Orchestrator>, config: BuilderConfig) -> Self {
        Self {
            store,
            orchestrator,
            config,
            builders: HashMap::new(),
        }
    }

    /// Follow environment changes until the store goes away.
    pub async fn run(mut self) {
        let mut events = self.store.watch();
        let mut tick = tokio::time::interval(self.config.env_reconcile_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                event = events.recv() => match event {
                    Ok(CatalogEvent::Environment(_)) => {}
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "environment watcher lagged"),
                    Err(RecvError::Closed) => {
                        debug!("catalog watch closed");
                        return;
                    }
                },
            }
            if let Err(e) = self.sync().await {
                warn!(error = %e, "failed to sync environment builders");
            }
        }
    }

    pub async fn sync(&mut self) -> BuildResult<BuilderSyncStats> {
        let envs: Vec<Environment> = self
            .store
            .list::<Environment>()?
            .into_iter()
            .filter(Environment::has_builder)
            .collect();

        let mut stats = BuilderSyncStats::default();
        for env in &envs {
            match self.ensure_builder(env).await {
                Ok(_) => stats.builders += 1,
                Err(e) => warn!(environment = %env.metadata.name, error = %e, "error creating builder"),
            }
        }

        let live: HashSet<String> = envs.iter().map(env_key).collect();
        let (services, deployments) = self.cleanup(&live).await?;
        stats.services_removed = services;
        stats.deployments_removed = deployments;
        Ok(stats)
    }

    pub fn builder(&self, env: &Environment) -> Option<&BuilderInfo> {
        self.builders.get(&env_key(env))
    }

    /// Find or create the builder pair of `env`'s current revision.
    pub async fn ensure_builder(&mut self, env: &Environment) -> BuildResult<&BuilderInfo> {
        let key = env_key(env);
        if self.builders.contains_key(&key) {
            return Ok(&self.builders[&key]);
        }
        let info = self.create_builder(env).await?;
        Ok(self.builders.entry(key).or_insert(info))
    }

    async fn create_builder(&self, env: &Environment) -> BuildResult<BuilderInfo> {
        let ns = builder_namespace(&self.config, &env.metadata.namespace);
        let selector = Selector::from(labels::builder_labels(env));

        let mut services = self.orchestrator.list_services(Some(&ns), &selector).await?;
        let service = match services.len() {
            0 => self.create_service(env, &ns).await?,
            1 => services.remove(0),
            _ => {
                return Err(BuildError::DuplicateBuilder {
                    kind: "service",
                    env: env.metadata.name.clone(),
                });
            }
        };

        let mut deployments = self.orchestrator.list_deployments(Some(&ns), &selector).await?;
        let deployment = match deployments.len() {
            0 => self.create_deployment(env, &ns).await?,
            1 => deployments.remove(0),
            _ => {
                return Err(BuildError::DuplicateBuilder {
                    kind: "deployment",
                    env: env.metadata.name.clone(),
                });
            }
        };

        Ok(BuilderInfo { service, deployment })
    }

    async fn create_service(&self, env: &Environment, ns: &str) -> BuildResult<Service> {
        let builder_labels = labels::builder_labels(env);
        let service = Service {
            metadata: ObjectMeta {
                labels: builder_labels.clone(),
                ..ObjectMeta::new(ns, &builder_name(env))
            },
            selector: Selector::from(builder_labels),
            port: self.config.builder_port,
            target_port: self.config.builder_port,
            address: String::new(),
        };
        info!(service = %service.metadata.name, namespace = %ns, "creating builder service");
        Ok(self.orchestrator.create_service(service).await?)
    }

    async fn create_deployment(&self, env: &Environment, ns: &str) -> BuildResult<Deployment> {
        let builder_labels = labels::builder_labels(env);
        let builder = Container {
            name: "builder".to_string(),
            image: env.spec.builder.image.clone(),
            command: vec!["/builder".to_string(), SHARED_MOUNT_PATH.to_string()],
            ports: vec![self.config.builder_port],
            resources: env.spec.resources,
            image_pull_policy: self.config.image_pull_policy.clone(),
            ..Default::default()
        };
        let fetcher = Container {
            name: "fetcher".to_string(),
            image: FETCHER_IMAGE.to_string(),
            args: vec![
                "-port".to_string(),
                self.config.fetcher_port.to_string(),
                SHARED_MOUNT_PATH.to_string(),
            ],
            ports: vec![self.config.fetcher_port],
            ..Default::default()
        };
        let deployment = Deployment {
            metadata: ObjectMeta {
                labels: builder_labels.clone(),
                ..ObjectMeta::new(ns, &builder_name(env))
            },
            replicas: 1,
            selector: Selector::from(builder_labels.clone()),
            template: PodTemplate {
                labels: builder_labels,
                annotations: env.metadata.annotations.clone(),
                containers: vec![builder, fetcher],
                service_account: BUILDER_SERVICE_ACCOUNT.to_string(),
                image_pull_secret: env.spec.image_pull_secret.clone(),
                termination_grace_period: env.spec.termination_grace_period,
            },
            ..Default::default()
        };
        info!(deployment = %deployment.metadata.name, namespace = %ns, "creating builder deployment");
        Ok(self.orchestrator.create_deployment(deployment).await?)
    }

    /// Delete builder objects of revisions not in `live`. Returns how many
    /// services and deployments went away.
    async fn cleanup(&mut self, live: &HashSet<String>) -> BuildResult<(usize, usize)> {
        let owned = Selector::new().with(OWNER, OWNER_BUILDERMGR);

        let mut services_removed = 0;
        for svc in self.orchestrator.list_services(None, &owned).await? {
            let key = object_key(&svc.metadata);
            if live.contains(&key) {
                continue;
            }
            self.builders.remove(&key);
            let (ns, name) = (&svc.metadata.namespace, &svc.metadata.name);
            match self.orchestrator.delete_service(ns, name).await {
                Ok(()) => {
                    info!(service = %name, namespace = %ns, "removed stale builder service");
                    services_removed += 1;
                }
                Err(e) => warn!(service = %name, namespace = %ns, error = %e, "error removing builder service"),
            }
        }

        let mut deployments_removed = 0;
        for deploy in self.orchestrator.list_deployments(None, &owned).await? {
            let key = object_key(&deploy.metadata);
            if live.contains(&key) {
                continue;
            }
            self.builders.remove(&key);
            let (ns, name) = (&deploy.metadata.namespace, &deploy.metadata.name);
            match self.orchestrator.delete_deployment(ns, name).await {
                Ok(()) => {
                    info!(deployment = %name, namespace = %ns, "removed stale builder deployment");
                    deployments_removed += 1;
                }
                Err(e) => {
                    warn!(deployment = %name, namespace = %ns, error = %e, "error removing builder deployment")
                }
            }
        }

        Ok((services_removed, deployments_removed))
    }
}
