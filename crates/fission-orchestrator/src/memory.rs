//! Self-contained orchestrator backed by in-process maps.
//!
//! # Architecture
//!
//! Every mutation runs a reconcile pass over all deployments, emulating a
//! ReplicaSet controller:
//!
//! - a pod whose labels no longer match its deployment's selector is
//!   orphaned (owner cleared) and keeps running
//! - a deployment owning fewer pods than `replicas` gets fresh pods stamped
//!   from its template; surplus pods are deleted
//! - `available_replicas` is recomputed from owned, ready pods
//!
//! Pods become ready immediately unless auto-readiness is switched off, in
//! which case tests flip them with [`InMemoryOrchestrator::set_pod_ready`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fission_core::ObjectMeta;
use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::debug;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::types::{Deployment, MetaPatch, Pod, PodPhase, RoleBinding, Selector, Service};
use crate::{Orchestrator, OrchestratorFuture};

#[derive(Default)]
struct World {
    pods: BTreeMap<String, Pod>,
    deployments: BTreeMap<String, Deployment>,
    services: BTreeMap<String, Service>,
    role_bindings: BTreeMap<String, RoleBinding>,
    next_version: u64,
    next_ip: u32,
}

impl World {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn allocate_ip(&mut self, fixed: Option<&str>) -> String {
        if let Some(ip) = fixed {
            return ip.to_string();
        }
        self.next_ip += 1;
        let n = self.next_ip;
        format!("10.{}.{}.{}", (n >> 16) & 0xff, (n >> 8) & 0xff, n & 0xff)
    }
}

#[derive(Debug, Clone)]
struct Settings {
    pod_ip: Option<String>,
    service_address: Option<String>,
    auto_ready: bool,
}

/// In-process [`Orchestrator`]. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct InMemoryOrchestrator {
    world: Arc<Mutex<World>>,
    settings: Arc<Mutex<Settings>>,
}

impl Default for InMemoryOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryOrchestrator {
    pub fn new() -> Self {
        Self {
            world: Arc::new(Mutex::new(World::default())),
            settings: Arc::new(Mutex::new(Settings {
                pod_ip: None,
                service_address: None,
                auto_ready: true,
            })),
        }
    }

    /// Give every new pod the same IP (e.g. `127.0.0.1` for loopback tests).
    pub fn with_pod_ip(self, ip: &str) -> Self {
        self.settings().pod_ip = Some(ip.to_string());
        self
    }

    /// Resolve every service to this address instead of `{name}.{namespace}`.
    pub fn with_service_address(self, address: &str) -> Self {
        self.settings().service_address = Some(address.to_string());
        self
    }

    pub fn with_auto_ready(self, auto_ready: bool) -> Self {
        self.settings().auto_ready = auto_ready;
        self
    }

    /// Flip a pod's readiness. Returns false when the pod does not exist.
    pub fn set_pod_ready(&self, namespace: &str, name: &str, ready: bool) -> bool {
        let mut world = self.world();
        let Some(pod) = world.pods.get_mut(&key(namespace, name)) else {
            return false;
        };
        pod.ready = ready;
        pod.phase = PodPhase::Running;
        reconcile(&mut world, &self.settings_snapshot());
        true
    }

    /// Mark every pod ready.
    pub fn make_all_ready(&self) {
        let mut world = self.world();
        for pod in world.pods.values_mut() {
            pod.ready = true;
            pod.phase = PodPhase::Running;
        }
        reconcile(&mut world, &self.settings_snapshot());
    }

    /// Snapshot of every pod, for assertions.
    pub fn pods(&self) -> Vec<Pod> {
        self.world().pods.values().cloned().collect()
    }

    pub fn deployments(&self) -> Vec<Deployment> {
        self.world().deployments.values().cloned().collect()
    }

    pub fn services(&self) -> Vec<Service> {
        self.world().services.values().cloned().collect()
    }

    fn world(&self) -> MutexGuard<'_, World> {
        self.world.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settings(&self) -> MutexGuard<'_, Settings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settings_snapshot(&self) -> Settings {
        self.settings().clone()
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut World, &Settings) -> OrchestratorResult<T>) -> OrchestratorResult<T> {
        let settings = self.settings_snapshot();
        let mut world = self.world();
        let out = f(&mut world, &settings)?;
        reconcile(&mut world, &settings);
        Ok(out)
    }
}

fn key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

fn in_namespace(meta: &ObjectMeta, namespace: Option<&str>) -> bool {
    namespace.is_none_or(|ns| meta.namespace == ns)
}

// ── Reconciliation ─────────────────────────────────────────────────

fn reconcile(world: &mut World, settings: &Settings) {
    let deployments: Vec<(String, Deployment)> = world
        .deployments
        .iter()
        .map(|(k, d)| (k.clone(), d.clone()))
        .collect();

    for (pod_key, pod) in world.pods.iter_mut() {
        let Some(owner) = pod.owner.clone() else {
            continue;
        };
        let owner_key = key(&pod.metadata.namespace, &owner);
        let still_owned = world
            .deployments
            .get(&owner_key)
            .is_some_and(|d| d.selector.matches(&pod.metadata.labels));
        if !still_owned {
            debug!(pod = %pod_key, deployment = %owner, "pod released from deployment");
            pod.owner = None;
        }
    }

    for (deploy_key, deployment) in deployments {
        let ns = deployment.metadata.namespace.clone();
        let name = deployment.metadata.name.clone();
        let mut owned: Vec<String> = world
            .pods
            .iter()
            .filter(|(_, p)| {
                p.metadata.namespace == ns && p.owner.as_deref() == Some(name.as_str()) && !p.terminating
            })
            .map(|(k, _)| k.clone())
            .collect();

        let desired = deployment.replicas as usize;
        while owned.len() > desired {
            // Prefer dropping pods that never became ready.
            let idx = owned
                .iter()
                .position(|k| world.pods.get(k).is_some_and(|p| !p.ready))
                .unwrap_or(owned.len() - 1);
            let victim = owned.remove(idx);
            world.pods.remove(&victim);
        }
        while owned.len() < desired {
            let pod_name = format!("{}-{}", name, random_suffix(5));
            let mut meta = ObjectMeta::new(&ns, &pod_name);
            meta.uid = random_suffix(16);
            meta.resource_version = world.bump();
            meta.labels = deployment.template.labels.clone();
            meta.annotations = deployment.template.annotations.clone();
            let ip = world.allocate_ip(settings.pod_ip.as_deref());
            let pod = Pod {
                metadata: meta,
                containers: deployment.template.containers.clone(),
                service_account: deployment.template.service_account.clone(),
                ip,
                phase: if settings.auto_ready {
                    PodPhase::Running
                } else {
                    PodPhase::Pending
                },
                ready: settings.auto_ready,
                owner: Some(name.clone()),
                terminating: false,
            };
            debug!(pod = %pod_name, deployment = %name, "pod created");
            let k = key(&ns, &pod_name);
            world.pods.insert(k.clone(), pod);
            owned.push(k);
        }

        let available = owned
            .iter()
            .filter(|k| world.pods.get(*k).is_some_and(Pod::is_ready))
            .count() as u32;
        if let Some(d) = world.deployments.get_mut(&deploy_key) {
            d.available_replicas = available;
        }
    }
}

// ── Orchestrator impl ──────────────────────────────────────────────

impl Orchestrator for InMemoryOrchestrator {
    fn list_pods<'a>(
        &'a self,
        namespace: Option<&'a str>,
        selector: &'a Selector,
    ) -> OrchestratorFuture<'a, Vec<Pod>> {
        Box::pin(async move {
            Ok(self
                .world()
                .pods
                .values()
                .filter(|p| in_namespace(&p.metadata, namespace) && selector.matches(&p.metadata.labels))
                .cloned()
                .collect())
        })
    }

    fn get_pod<'a>(&'a self, namespace: &'a str, name: &'a str) -> OrchestratorFuture<'a, Option<Pod>> {
        Box::pin(async move { Ok(self.world().pods.get(&key(namespace, name)).cloned()) })
    }

    fn patch_pod<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
        patch: &'a MetaPatch,
    ) -> OrchestratorFuture<'a, Pod> {
        Box::pin(async move {
            self.mutate(|world, _| {
                let k = key(namespace, name);
                let version = world.bump();
                let pod = world.pods.get_mut(&k).ok_or_else(|| OrchestratorError::NotFound {
                    kind: "pod",
                    key: k.clone(),
                })?;
                if let Some(expected) = &patch.expected_resource_version {
                    if *expected != pod.metadata.resource_version {
                        return Err(OrchestratorError::Conflict {
                            kind: "pod",
                            key: k,
                            reason: format!(
                                "resource version {} does not match {}",
                                pod.metadata.resource_version, expected
                            ),
                        });
                    }
                }
                patch.apply(&mut pod.metadata);
                pod.metadata.resource_version = version;
                Ok(pod.clone())
            })
        })
    }

    fn delete_pod<'a>(&'a self, namespace: &'a str, name: &'a str) -> OrchestratorFuture<'a, ()> {
        Box::pin(async move {
            self.mutate(|world, _| {
                let k = key(namespace, name);
                match world.pods.remove(&k) {
                    Some(_) => {
                        debug!(pod = %k, "pod deleted");
                        Ok(())
                    }
                    None => Err(OrchestratorError::NotFound { kind: "pod", key: k }),
                }
            })
        })
    }

    fn create_deployment<'a>(&'a self, mut deployment: Deployment) -> OrchestratorFuture<'a, Deployment> {
        Box::pin(async move {
            let namespace = deployment.metadata.namespace.clone();
            let name = deployment.metadata.name.clone();
            self.mutate(|world, _| {
                let k = deployment.metadata.table_key();
                if world.deployments.contains_key(&k) {
                    return Err(OrchestratorError::AlreadyExists {
                        kind: "deployment",
                        key: k,
                    });
                }
                deployment.metadata.uid = random_suffix(16);
                deployment.metadata.resource_version = world.bump();
                deployment.available_replicas = 0;
                world.deployments.insert(k.clone(), deployment);
                debug!(deployment = %k, "deployment created");
                Ok(())
            })?;
            self.get_deployment(&namespace, &name)
                .await?
                .ok_or_else(|| OrchestratorError::Api(format!("deployment {namespace}/{name} vanished")))
        })
    }

    fn get_deployment<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> OrchestratorFuture<'a, Option<Deployment>> {
        Box::pin(async move { Ok(self.world().deployments.get(&key(namespace, name)).cloned()) })
    }

    fn list_deployments<'a>(
        &'a self,
        namespace: Option<&'a str>,
        selector: &'a Selector,
    ) -> OrchestratorFuture<'a, Vec<Deployment>> {
        Box::pin(async move {
            Ok(self
                .world()
                .deployments
                .values()
                .filter(|d| in_namespace(&d.metadata, namespace) && selector.matches(&d.metadata.labels))
                .cloned()
                .collect())
        })
    }

    fn update_deployment<'a>(&'a self, deployment: Deployment) -> OrchestratorFuture<'a, Deployment> {
        Box::pin(async move {
            let k = deployment.metadata.table_key();
            self.mutate(|world, _| {
                let version = world.bump();
                let current = world
                    .deployments
                    .get_mut(&k)
                    .ok_or_else(|| OrchestratorError::NotFound {
                        kind: "deployment",
                        key: k.clone(),
                    })?;
                let template_changed = current.template != deployment.template;
                current.metadata.labels = deployment.metadata.labels.clone();
                current.metadata.annotations = deployment.metadata.annotations.clone();
                current.metadata.resource_version = version;
                current.replicas = deployment.replicas;
                current.selector = deployment.selector.clone();
                current.template = deployment.template.clone();
                current.autoscaling = deployment.autoscaling;
                let name = current.metadata.name.clone();
                let ns = current.metadata.namespace.clone();
                if template_changed {
                    // Rolling update: replace every owned pod.
                    world
                        .pods
                        .retain(|_, p| !(p.metadata.namespace == ns && p.owner.as_deref() == Some(name.as_str())));
                }
                debug!(deployment = %k, replicas = deployment.replicas, template_changed, "deployment updated");
                Ok(())
            })?;
            self.world()
                .deployments
                .get(&k)
                .cloned()
                .ok_or_else(|| OrchestratorError::Api(format!("deployment {k} vanished")))
        })
    }

    fn delete_deployment<'a>(&'a self, namespace: &'a str, name: &'a str) -> OrchestratorFuture<'a, ()> {
        Box::pin(async move {
            self.mutate(|world, _| {
                let k = key(namespace, name);
                world
                    .deployments
                    .remove(&k)
                    .ok_or_else(|| OrchestratorError::NotFound {
                        kind: "deployment",
                        key: k.clone(),
                    })?;
                world
                    .pods
                    .retain(|_, p| !(p.metadata.namespace == namespace && p.owner.as_deref() == Some(name)));
                debug!(deployment = %k, "deployment deleted");
                Ok(())
            })
        })
    }

    fn create_service<'a>(&'a self, mut service: Service) -> OrchestratorFuture<'a, Service> {
        Box::pin(async move {
            self.mutate(|world, settings| {
                let k = service.metadata.table_key();
                if world.services.contains_key(&k) {
                    return Err(OrchestratorError::AlreadyExists { kind: "service", key: k });
                }
                service.metadata.uid = random_suffix(16);
                service.metadata.resource_version = world.bump();
                service.address = match &settings.service_address {
                    Some(address) => address.clone(),
                    None => format!("{}.{}", service.metadata.name, service.metadata.namespace),
                };
                world.services.insert(k, service.clone());
                Ok(service)
            })
        })
    }

    fn get_service<'a>(&'a self, namespace: &'a str, name: &'a str) -> OrchestratorFuture<'a, Option<Service>> {
        Box::pin(async move { Ok(self.world().services.get(&key(namespace, name)).cloned()) })
    }

    fn list_services<'a>(
        &'a self,
        namespace: Option<&'a str>,
        selector: &'a Selector,
    ) -> OrchestratorFuture<'a, Vec<Service>> {
        Box::pin(async move {
            Ok(self
                .world()
                .services
                .values()
                .filter(|s| in_namespace(&s.metadata, namespace) && selector.matches(&s.metadata.labels))
                .cloned()
                .collect())
        })
    }

    fn delete_service<'a>(&'a self, namespace: &'a str, name: &'a str) -> OrchestratorFuture<'a, ()> {
        Box::pin(async move {
            let k = key(namespace, name);
            self.world()
                .services
                .remove(&k)
                .map(|_| ())
                .ok_or(OrchestratorError::NotFound { kind: "service", key: k })
        })
    }

    fn get_role_binding<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> OrchestratorFuture<'a, Option<RoleBinding>> {
        Box::pin(async move { Ok(self.world().role_bindings.get(&key(namespace, name)).cloned()) })
    }

    fn apply_role_binding<'a>(&'a self, mut binding: RoleBinding) -> OrchestratorFuture<'a, RoleBinding> {
        Box::pin(async move {
            let mut world = self.world();
            binding.metadata.resource_version = world.bump();
            world
                .role_bindings
                .insert(binding.metadata.table_key(), binding.clone());
            Ok(binding)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Container, PodTemplate};

    fn pool_deployment(replicas: u32) -> Deployment {
        let labels = BTreeMap::from([
            ("environmentName".to_string(), "python".to_string()),
            ("managed".to_string(), "true".to_string()),
        ]);
        Deployment {
            metadata: ObjectMeta::new("fission-function", "poolmgr-python"),
            replicas,
            selector: Selector::from(labels.clone()),
            template: PodTemplate {
                labels,
                containers: vec![Container {
                    name: "python".into(),
                    image: "fission/python-env".into(),
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn deployment_creates_ready_pods() {
        let orch = InMemoryOrchestrator::new();
        let d = orch.create_deployment(pool_deployment(3)).await.unwrap();
        assert_eq!(d.available_replicas, 3);
        let pods = orch
            .list_pods(Some("fission-function"), &Selector::new().with("managed", "true"))
            .await
            .unwrap();
        assert_eq!(pods.len(), 3);
        assert!(pods.iter().all(Pod::is_ready));
        assert!(pods.iter().all(|p| p.metadata.name.starts_with("poolmgr-python-")));
    }

    #[tokio::test]
    async fn duplicate_deployment_rejected() {
        let orch = InMemoryOrchestrator::new();
        orch.create_deployment(pool_deployment(1)).await.unwrap();
        let err = orch.create_deployment(pool_deployment(1)).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn relabelled_pod_is_released_and_replaced() {
        let orch = InMemoryOrchestrator::new();
        orch.create_deployment(pool_deployment(2)).await.unwrap();
        let pod = orch.pods().remove(0);

        let patch = MetaPatch {
            labels: BTreeMap::from([("managed".to_string(), "false".to_string())]),
            expected_resource_version: Some(pod.metadata.resource_version.clone()),
            ..Default::default()
        };
        let patched = orch
            .patch_pod("fission-function", &pod.metadata.name, &patch)
            .await
            .unwrap();
        assert_eq!(patched.label("managed"), Some("false"));

        let all = orch.pods();
        assert_eq!(all.len(), 3, "replacement pod created");
        let released = all.iter().find(|p| p.metadata.name == pod.metadata.name).unwrap();
        assert_eq!(released.owner, None);
        let managed = all.iter().filter(|p| p.label("managed") == Some("true")).count();
        assert_eq!(managed, 2);
    }

    #[tokio::test]
    async fn stale_patch_conflicts() {
        let orch = InMemoryOrchestrator::new();
        orch.create_deployment(pool_deployment(1)).await.unwrap();
        let pod = orch.pods().remove(0);
        let patch = MetaPatch {
            annotations: BTreeMap::from([("a".to_string(), "b".to_string())]),
            expected_resource_version: Some(pod.metadata.resource_version.clone()),
            ..Default::default()
        };
        orch.patch_pod("fission-function", &pod.metadata.name, &patch)
            .await
            .unwrap();
        let err = orch
            .patch_pod("fission-function", &pod.metadata.name, &patch)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Conflict { .. }));
    }

    #[tokio::test]
    async fn deleted_pod_is_replaced() {
        let orch = InMemoryOrchestrator::new();
        orch.create_deployment(pool_deployment(1)).await.unwrap();
        let first = orch.pods().remove(0);
        orch.delete_pod("fission-function", &first.metadata.name).await.unwrap();
        let now = orch.pods();
        assert_eq!(now.len(), 1);
        assert_ne!(now[0].metadata.name, first.metadata.name);
    }

    #[tokio::test]
    async fn scaling_down_removes_owned_pods_only() {
        let orch = InMemoryOrchestrator::new();
        let mut d = orch.create_deployment(pool_deployment(2)).await.unwrap();
        let pod = orch.pods().remove(0);
        let release = MetaPatch {
            labels: BTreeMap::from([("managed".to_string(), "false".to_string())]),
            ..Default::default()
        };
        orch.patch_pod("fission-function", &pod.metadata.name, &release)
            .await
            .unwrap();

        d.replicas = 0;
        orch.update_deployment(d).await.unwrap();
        let left = orch.pods();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].metadata.name, pod.metadata.name);
    }

    #[tokio::test]
    async fn readiness_drives_available_replicas() {
        let orch = InMemoryOrchestrator::new().with_auto_ready(false);
        let d = orch.create_deployment(pool_deployment(2)).await.unwrap();
        assert_eq!(d.available_replicas, 0);
        let pod = orch.pods().remove(0);
        assert!(orch.set_pod_ready("fission-function", &pod.metadata.name, true));
        let d = orch
            .get_deployment("fission-function", "poolmgr-python")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(d.available_replicas, 1);
    }

    #[tokio::test]
    async fn delete_deployment_takes_owned_pods() {
        let orch = InMemoryOrchestrator::new();
        orch.create_deployment(pool_deployment(2)).await.unwrap();
        orch.delete_deployment("fission-function", "poolmgr-python")
            .await
            .unwrap();
        assert!(orch.pods().is_empty());
        let err = orch
            .delete_deployment("fission-function", "poolmgr-python")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn services_get_addresses() {
        let orch = InMemoryOrchestrator::new();
        let svc = orch
            .create_service(Service {
                metadata: ObjectMeta::new("fission-function", "hello-svc"),
                port: 80,
                target_port: 8888,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(svc.address, "hello-svc.fission-function");

        let orch = InMemoryOrchestrator::new().with_service_address("127.0.0.1:9000");
        let svc = orch
            .create_service(Service {
                metadata: ObjectMeta::new("ns", "s"),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(svc.address, "127.0.0.1:9000");
    }
}
