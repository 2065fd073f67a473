//! fission-orchestrator — the slice of a container orchestrator Fission uses.
//!
//! The executor and the builder manager never talk to a concrete cluster
//! API. They go through the [`Orchestrator`] trait, which covers pods,
//! deployments, services and role bindings addressed by namespace, name and
//! label selector.
//!
//! # Components
//!
//! - **`types`** — pod, deployment, service and role-binding records
//! - **`memory`** — [`InMemoryOrchestrator`], a self-contained implementation
//!   with ReplicaSet-like reconciliation, used by tests and standalone mode

pub mod error;
pub mod memory;
pub mod types;

use std::future::Future;
use std::pin::Pin;

pub use error::{OrchestratorError, OrchestratorResult};
pub use memory::InMemoryOrchestrator;
pub use types::*;

/// Boxed future returned by [`Orchestrator`] methods.
pub type OrchestratorFuture<'a, T> =
    Pin<Box<dyn Future<Output = OrchestratorResult<T>> + Send + 'a>>;

/// Orchestrator operations consumed by the core — injected for testability.
///
/// A `namespace` of `None` in list calls means all namespaces.
pub trait Orchestrator: Send + Sync {
    // ── Pods ───────────────────────────────────────────────────────

    fn list_pods<'a>(
        &'a self,
        namespace: Option<&'a str>,
        selector: &'a Selector,
    ) -> OrchestratorFuture<'a, Vec<Pod>>;

    fn get_pod<'a>(&'a self, namespace: &'a str, name: &'a str)
    -> OrchestratorFuture<'a, Option<Pod>>;

    /// Merge labels and annotations into a pod. Fails with `Conflict` when
    /// `patch.expected_resource_version` no longer matches.
    fn patch_pod<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
        patch: &'a MetaPatch,
    ) -> OrchestratorFuture<'a, Pod>;

    fn delete_pod<'a>(&'a self, namespace: &'a str, name: &'a str) -> OrchestratorFuture<'a, ()>;

    // ── Deployments ────────────────────────────────────────────────

    fn create_deployment<'a>(&'a self, deployment: Deployment)
    -> OrchestratorFuture<'a, Deployment>;

    fn get_deployment<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> OrchestratorFuture<'a, Option<Deployment>>;

    fn list_deployments<'a>(
        &'a self,
        namespace: Option<&'a str>,
        selector: &'a Selector,
    ) -> OrchestratorFuture<'a, Vec<Deployment>>;

    /// Replace the desired state (replicas, template, metadata) of a deployment.
    fn update_deployment<'a>(&'a self, deployment: Deployment)
    -> OrchestratorFuture<'a, Deployment>;

    /// Delete a deployment and every pod it still owns.
    fn delete_deployment<'a>(&'a self, namespace: &'a str, name: &'a str)
    -> OrchestratorFuture<'a, ()>;

    // ── Services ───────────────────────────────────────────────────

    fn create_service<'a>(&'a self, service: Service) -> OrchestratorFuture<'a, Service>;

    fn get_service<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> OrchestratorFuture<'a, Option<Service>>;

    fn list_services<'a>(
        &'a self,
        namespace: Option<&'a str>,
        selector: &'a Selector,
    ) -> OrchestratorFuture<'a, Vec<Service>>;

    fn delete_service<'a>(&'a self, namespace: &'a str, name: &'a str) -> OrchestratorFuture<'a, ()>;

    // ── RBAC ───────────────────────────────────────────────────────

    fn get_role_binding<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> OrchestratorFuture<'a, Option<RoleBinding>>;

    /// Create or replace a role binding.
    fn apply_role_binding<'a>(&'a self, binding: RoleBinding)
    -> OrchestratorFuture<'a, RoleBinding>;
}
