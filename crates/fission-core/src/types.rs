//! Resource model for the Fission catalog.
//!
//! Functions, environments, packages and triggers reference each other by
//! `(namespace, name)` only. Nothing holds a pointer into another resource;
//! lookups go through the catalog store, so the Function ↔ Package ↔
//! Environment cycle never has to be walked in memory.
//!
//! All types serialize as camelCase JSON, which is also the body format of
//! the executor's `/v2/getServiceForFunction` endpoint.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Namespace used when a resource does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Function timeout (seconds) applied when a function leaves it unset.
pub const DEFAULT_FUNCTION_TIMEOUT: u64 = 60;

/// Specialization timeout (seconds) applied when a function leaves it unset.
pub const DEFAULT_SPECIALIZATION_TIMEOUT: u64 = 120;

/// Idle timeout (seconds) applied when a function leaves it unset.
pub const DEFAULT_IDLE_TIMEOUT: u64 = 120;

/// Default cap on pods per function version.
pub const DEFAULT_CONCURRENCY: u32 = 500;

/// Default number of concurrent requests one specialized pod accepts.
pub const DEFAULT_REQUESTS_PER_POD: u32 = 1;

// ── Metadata ───────────────────────────────────────────────────────

/// Identity and bookkeeping shared by every catalog resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub resource_version: String,
    pub generation: i64,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        }
    }

    /// Catalog key: `{namespace}/{name}`.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Kinds stored in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Function,
    Environment,
    Package,
    HttpTrigger,
    ConfigMap,
    Secret,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Function => "function",
            Self::Environment => "environment",
            Self::Package => "package",
            Self::HttpTrigger => "httptrigger",
            Self::ConfigMap => "configmap",
            Self::Secret => "secret",
        };
        f.write_str(s)
    }
}

/// A resource that can live in the catalog.
pub trait Resource: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: ResourceKind;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Whether `other` carries the same desired state. A spec change bumps
    /// the generation; a status-only write does not.
    fn same_spec(&self, other: &Self) -> bool;
}

// ── Function ───────────────────────────────────────────────────────

/// Strategy used to turn a function into a serving address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorType {
    #[default]
    Poolmgr,
    Newdeploy,
    Container,
}

impl fmt::Display for ExecutorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Poolmgr => "poolmgr",
            Self::Newdeploy => "newdeploy",
            Self::Container => "container",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ExecutorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "poolmgr" => Ok(Self::Poolmgr),
            "newdeploy" => Ok(Self::Newdeploy),
            "container" => Ok(Self::Container),
            other => Err(format!("unknown executor type: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionStrategy {
    pub executor_type: ExecutorType,
    pub min_scale: u32,
    pub max_scale: u32,
    pub target_cpu_percent: Option<u32>,
    /// Seconds allowed for loading the function into a pod.
    pub specialization_timeout: u64,
}

impl Default for ExecutionStrategy {
    fn default() -> Self {
        Self {
            executor_type: ExecutorType::Poolmgr,
            min_scale: 0,
            max_scale: 1,
            target_cpu_percent: None,
            specialization_timeout: DEFAULT_SPECIALIZATION_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InvokeStrategy {
    pub execution_strategy: ExecutionStrategy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvironmentReference {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PackageRef {
    pub namespace: String,
    pub name: String,
    pub resource_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FunctionPackageRef {
    pub package_ref: PackageRef,
    /// Entrypoint inside the deployment archive.
    pub function_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecretReference {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigMapReference {
    pub namespace: String,
    pub name: String,
}

/// CPU in millicores, memory in bytes. Zero means unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceList {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceRequirements {
    pub requests: ResourceList,
    pub limits: ResourceList,
}

/// User image settings for the `container` executor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerSpec {
    pub image: String,
    pub port: u16,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FunctionSpec {
    pub environment: EnvironmentReference,
    pub package: FunctionPackageRef,
    pub secrets: Vec<SecretReference>,
    pub config_maps: Vec<ConfigMapReference>,
    pub resources: ResourceRequirements,
    pub invoke_strategy: InvokeStrategy,
    /// Per-request execution budget in seconds.
    pub function_timeout: u64,
    /// Seconds a specialized pod may sit idle before it is reaped.
    pub idle_timeout: Option<u64>,
    /// Max pods per function version.
    pub concurrency: u32,
    /// Soft cap on concurrent requests per pod.
    pub requests_per_pod: u32,
    /// Warm pods kept past idle expiry.
    pub retain_pods: u32,
    /// Each pod serves a single request and is then discarded.
    pub onceonly: bool,
    pub container: Option<ContainerSpec>,
}

impl Default for FunctionSpec {
    fn default() -> Self {
        Self {
            environment: EnvironmentReference::default(),
            package: FunctionPackageRef::default(),
            secrets: Vec::new(),
            config_maps: Vec::new(),
            resources: ResourceRequirements::default(),
            invoke_strategy: InvokeStrategy::default(),
            function_timeout: DEFAULT_FUNCTION_TIMEOUT,
            idle_timeout: None,
            concurrency: DEFAULT_CONCURRENCY,
            requests_per_pod: DEFAULT_REQUESTS_PER_POD,
            retain_pods: 0,
            onceonly: false,
            container: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Function {
    pub metadata: ObjectMeta,
    pub spec: FunctionSpec,
}

impl Function {
    pub fn executor_type(&self) -> ExecutorType {
        self.spec.invoke_strategy.execution_strategy.executor_type
    }

    /// Pool-cache key for this exact function revision.
    pub fn cache_key(&self) -> FunctionKey {
        FunctionKey::from_meta(&self.metadata)
    }

    pub fn concurrency(&self) -> u32 {
        if self.spec.concurrency == 0 {
            DEFAULT_CONCURRENCY
        } else {
            self.spec.concurrency
        }
    }

    pub fn requests_per_pod(&self) -> u32 {
        self.spec.requests_per_pod.max(1)
    }

    pub fn specialization_timeout(&self) -> std::time::Duration {
        let secs = self
            .spec
            .invoke_strategy
            .execution_strategy
            .specialization_timeout
            .max(DEFAULT_SPECIALIZATION_TIMEOUT);
        std::time::Duration::from_secs(secs)
    }

    pub fn function_timeout(&self) -> std::time::Duration {
        let secs = if self.spec.function_timeout == 0 {
            DEFAULT_FUNCTION_TIMEOUT
        } else {
            self.spec.function_timeout
        };
        std::time::Duration::from_secs(secs)
    }

    pub fn idle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.spec.idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT))
    }
}

impl Resource for Function {
    const KIND: ResourceKind = ResourceKind::Function;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn same_spec(&self, other: &Self) -> bool {
        self.spec == other.spec
    }
}

/// Identity of one function revision inside the pool cache.
///
/// Two different revisions of a function never share a key because the
/// resource version is part of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionKey {
    pub uid: String,
    pub resource_version: String,
    pub generation: i64,
}

impl FunctionKey {
    pub fn from_meta(meta: &ObjectMeta) -> Self {
        Self {
            uid: meta.uid.clone(),
            resource_version: meta.resource_version.clone(),
            generation: meta.generation,
        }
    }
}

impl fmt::Display for FunctionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.uid, self.resource_version, self.generation)
    }
}

// ── Environment ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Runtime {
    pub image: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Builder {
    pub image: String,
    pub command: String,
}

/// How many functions may be loaded into one runtime container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllowedFunctionsPerContainer {
    #[default]
    Single,
    Infinite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvironmentSpec {
    pub version: u32,
    pub runtime: Runtime,
    pub builder: Builder,
    pub poolsize: u32,
    pub resources: ResourceRequirements,
    pub termination_grace_period: u64,
    pub keeparchive: bool,
    pub allow_access_to_external_network: bool,
    pub image_pull_secret: String,
    pub allowed_functions_per_container: AllowedFunctionsPerContainer,
}

impl Default for EnvironmentSpec {
    fn default() -> Self {
        Self {
            version: 2,
            runtime: Runtime::default(),
            builder: Builder::default(),
            poolsize: 3,
            resources: ResourceRequirements::default(),
            termination_grace_period: 360,
            keeparchive: false,
            allow_access_to_external_network: false,
            image_pull_secret: String::new(),
            allowed_functions_per_container: AllowedFunctionsPerContainer::Single,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Environment {
    pub metadata: ObjectMeta,
    pub spec: EnvironmentSpec,
}

impl Environment {
    /// Whether this environment ships a builder image.
    pub fn has_builder(&self) -> bool {
        self.spec.version > 1 && !self.spec.builder.image.is_empty()
    }
}

impl Resource for Environment {
    const KIND: ResourceKind = ResourceKind::Environment;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn same_spec(&self, other: &Self) -> bool {
        self.spec == other.spec
    }
}

// ── Package ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveType {
    #[default]
    Literal,
    Url,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Checksum {
    #[serde(rename = "type")]
    pub kind: String,
    pub sum: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Archive {
    #[serde(rename = "type")]
    pub kind: ArchiveType,
    /// Inline archive contents (literal archives only).
    pub literal: Vec<u8>,
    pub url: String,
    pub checksum: Checksum,
}

impl Archive {
    pub fn is_empty(&self) -> bool {
        self.literal.is_empty() && self.url.is_empty()
    }
}

/// Build lifecycle: `none | pending → running → (succeeded | failed)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    None,
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl BuildStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::None | Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PackageSpec {
    pub environment: EnvironmentReference,
    pub source: Archive,
    pub deployment: Archive,
    pub build_command: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PackageStatus {
    /// `None` until the package watcher initializes it.
    pub build_status: Option<BuildStatus>,
    pub build_log: String,
    /// Unix seconds of the last status write.
    pub last_update_timestamp: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Package {
    pub metadata: ObjectMeta,
    pub spec: PackageSpec,
    pub status: PackageStatus,
}

impl Resource for Package {
    const KIND: ResourceKind = ResourceKind::Package;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn same_spec(&self, other: &Self) -> bool {
        self.spec == other.spec
    }
}

// ── HTTPTrigger ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunctionReferenceType {
    #[default]
    #[serde(rename = "name")]
    Name,
    #[serde(rename = "function-weights")]
    FunctionWeights,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FunctionReference {
    #[serde(rename = "type")]
    pub kind: FunctionReferenceType,
    pub name: String,
    /// Function name → weight; weights sum to 100.
    pub function_weights: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IngressConfig {
    pub annotations: BTreeMap<String, String>,
    pub path: String,
    pub host: String,
    pub tls: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpTriggerSpec {
    pub host: String,
    #[serde(rename = "relativeurl")]
    pub relative_url: String,
    pub prefix: Option<String>,
    /// Single method; merged with `methods`.
    pub method: String,
    pub methods: Vec<String>,
    pub function_reference: FunctionReference,
    pub create_ingress: bool,
    pub ingress_config: IngressConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpTrigger {
    pub metadata: ObjectMeta,
    pub spec: HttpTriggerSpec,
}

impl HttpTrigger {
    /// Methods accepted by this trigger, deduplicated, defaulting to POST.
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = Vec::new();
        for m in self
            .spec
            .methods
            .iter()
            .chain(std::iter::once(&self.spec.method))
        {
            let m = m.trim().to_ascii_uppercase();
            if !m.is_empty() && !methods.contains(&m) {
                methods.push(m);
            }
        }
        if methods.is_empty() {
            methods.push("POST".to_string());
        }
        methods
    }
}

impl Resource for HttpTrigger {
    const KIND: ResourceKind = ResourceKind::HttpTrigger;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn same_spec(&self, other: &Self) -> bool {
        self.spec == other.spec
    }
}

// ── ConfigMap / Secret ─────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigMap {
    pub metadata: ObjectMeta,
    pub data: BTreeMap<String, String>,
}

impl Resource for ConfigMap {
    const KIND: ResourceKind = ResourceKind::ConfigMap;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn same_spec(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Secret {
    pub metadata: ObjectMeta,
    pub data: BTreeMap<String, String>,
}

impl Resource for Secret {
    const KIND: ResourceKind = ResourceKind::Secret;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn same_spec(&self, other: &Self) -> bool {
        self.data == other.data
    }
}
