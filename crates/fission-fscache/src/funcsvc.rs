//! Function service records.

use fission_core::{Environment, ExecutorType, FunctionKey, ObjectMeta};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Reference to an orchestrator object backing a function service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl ObjectRef {
    pub const POD: &'static str = "pod";
    pub const DEPLOYMENT: &'static str = "deployment";
    pub const SERVICE: &'static str = "service";

    pub fn new(kind: &str, namespace: &str, name: &str) -> Self {
        Self {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            uid: String::new(),
        }
    }
}

/// A specialized instance of one function revision, reachable at `address`.
#[derive(Debug, Clone, PartialEq)]
pub struct FuncSvc {
    pub name: String,
    pub function: ObjectMeta,
    pub environment: Environment,
    /// `host:port` the router proxies to.
    pub address: String,
    pub kube_objects: Vec<ObjectRef>,
    pub executor: ExecutorType,
    /// CPU budget for admission, in millicores. Zero means unlimited.
    pub cpu_limit_millis: u64,
    pub ctime: Instant,
    pub atime: Instant,
}

impl FuncSvc {
    pub fn new(
        function: ObjectMeta,
        environment: Environment,
        address: String,
        executor: ExecutorType,
    ) -> Self {
        let now = Instant::now();
        Self {
            name: function.name.clone(),
            function,
            environment,
            address,
            kube_objects: Vec::new(),
            executor,
            cpu_limit_millis: 0,
            ctime: now,
            atime: now,
        }
    }

    pub fn with_object(mut self, object: ObjectRef) -> Self {
        self.kube_objects.push(object);
        self
    }

    pub fn key(&self) -> FunctionKey {
        FunctionKey::from_meta(&self.function)
    }

    /// The first backing object of `kind`.
    pub fn object(&self, kind: &str) -> Option<&ObjectRef> {
        self.kube_objects.iter().find(|o| o.kind == kind)
    }

    /// Time since last use, measured against `now`.
    pub fn idle_for(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.atime)
    }
}
