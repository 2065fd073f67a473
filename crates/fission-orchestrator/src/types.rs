//! Orchestrator objects.
//!
//! Deliberately small: only the fields the executor and builder manager
//! read or write are modelled. Metadata reuses the catalog's
//! [`ObjectMeta`] so labels and annotations behave identically.

use std::collections::BTreeMap;

use fission_core::{ObjectMeta, ResourceRequirements};
use serde::{Deserialize, Serialize};

// ── Selector ───────────────────────────────────────────────────────

/// Equality-based label selector. An empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector(pub BTreeMap<String, String>);

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }
}

impl From<BTreeMap<String, String>> for Selector {
    fn from(labels: BTreeMap<String, String>) -> Self {
        Self(labels)
    }
}

// ── Pods ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Container {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<u16>,
    pub resources: ResourceRequirements,
    /// `Always`, `IfNotPresent` or `Never`; empty leaves the cluster default.
    pub image_pull_policy: String,
}

/// Desired shape of a pod, stamped out by a deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodTemplate {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub containers: Vec<Container>,
    pub service_account: String,
    pub image_pull_secret: String,
    pub termination_grace_period: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Pod {
    pub metadata: ObjectMeta,
    pub containers: Vec<Container>,
    pub service_account: String,
    pub ip: String,
    pub phase: PodPhase,
    /// Every container passed its readiness check.
    pub ready: bool,
    /// Name of the deployment currently owning the pod. Cleared when the
    /// pod's labels stop matching the deployment selector.
    pub owner: Option<String>,
    pub terminating: bool,
}

impl Pod {
    /// Running, ready, and not on its way out.
    pub fn is_ready(&self) -> bool {
        self.phase == PodPhase::Running && self.ready && !self.terminating && !self.ip.is_empty()
    }

    /// Sum of container CPU limits in millicores.
    pub fn cpu_limit_millis(&self) -> u64 {
        self.containers
            .iter()
            .map(|c| c.resources.limits.cpu_millis)
            .sum()
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata.labels.get(key).map(String::as_str)
    }
}

// ── Deployments ────────────────────────────────────────────────────

/// Horizontal autoscaling bounds attached to a deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Autoscaling {
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub target_cpu_percent: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Deployment {
    pub metadata: ObjectMeta,
    pub replicas: u32,
    /// Observed: owned pods that are ready.
    pub available_replicas: u32,
    pub selector: Selector,
    pub template: PodTemplate,
    pub autoscaling: Option<Autoscaling>,
}

// ── Services ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Service {
    pub metadata: ObjectMeta,
    pub selector: Selector,
    pub port: u16,
    pub target_port: u16,
    /// Resolvable `host[:port]` assigned by the orchestrator on creation.
    pub address: String,
}

// ── RBAC ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Subject {
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

impl Subject {
    pub fn service_account(namespace: &str, name: &str) -> Self {
        Self {
            kind: "ServiceAccount".to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoleBinding {
    pub metadata: ObjectMeta,
    pub role: String,
    pub subjects: Vec<Subject>,
}

// ── Patches ────────────────────────────────────────────────────────

/// Metadata merge applied to a pod.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaPatch {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub remove_labels: Vec<String>,
    /// Optimistic concurrency guard.
    pub expected_resource_version: Option<String>,
}

impl MetaPatch {
    pub fn apply(&self, meta: &mut ObjectMeta) {
        for key in &self.remove_labels {
            meta.labels.remove(key);
        }
        meta.labels
            .extend(self.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        meta.annotations
            .extend(self.annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}
