//! `fission.toml` configuration with environment-variable overrides.
//!
//! Every field has a default, so an empty file (or no file) yields a working
//! configuration. After the file is read, the environment variables listed
//! on each struct override the file values.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FissionConfig {
    pub executor: ExecutorConfig,
    pub router: RouterConfig,
    pub builder: BuilderConfig,
}

impl FissionConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FissionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load the file when given, then apply process environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env(|k| std::env::var(k).ok());
        Ok(config)
    }

    /// Override fields from an environment lookup.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        self.executor.apply_env(&lookup);
        self.router.apply_env(&lookup);
        self.builder.apply_env(&lookup);
    }
}

// ── Executor ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Stamped on every object this executor creates. `EXECUTOR_INSTANCE_ID`.
    pub instance_id: Option<String>,
    /// Namespace for pools and functions in `default`. `FISSION_FUNCTION_NAMESPACE`.
    pub function_namespace: String,
    /// `ADOPT_EXISTING_RESOURCES`.
    pub adopt_existing_resources: bool,
    /// `ENABLE_ISTIO`.
    pub enable_istio: bool,
    /// How long to wait for a ready pool pod. `POD_READY_TIMEOUT`.
    #[serde(with = "duration_str")]
    pub pod_ready_timeout: Duration,
    /// Port the runtime container serves the function on. `RUNTIME_PORT`.
    pub runtime_port: u16,
    /// Port of the fetcher sidecar. `FETCHER_PORT`.
    pub fetcher_port: u16,
    #[serde(with = "duration_str")]
    pub idle_reap_interval: Duration,
    /// Added to the specialization timeout for the owner's budget.
    #[serde(with = "duration_str")]
    pub specialization_buffer: Duration,
    #[serde(with = "duration_str")]
    pub env_cache_ttl: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            function_namespace: "fission-function".to_string(),
            adopt_existing_resources: false,
            enable_istio: false,
            pod_ready_timeout: Duration::from_secs(300),
            runtime_port: 8888,
            fetcher_port: 8000,
            idle_reap_interval: Duration::from_secs(5),
            specialization_buffer: Duration::from_secs(10),
            env_cache_ttl: Duration::from_secs(10),
        }
    }
}

impl ExecutorConfig {
    fn apply_env(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("EXECUTOR_INSTANCE_ID").filter(|v| !v.is_empty()) {
            self.instance_id = Some(v);
        }
        override_string(lookup, "FISSION_FUNCTION_NAMESPACE", &mut self.function_namespace);
        override_bool(lookup, "ADOPT_EXISTING_RESOURCES", &mut self.adopt_existing_resources);
        override_bool(lookup, "ENABLE_ISTIO", &mut self.enable_istio);
        override_duration(lookup, "POD_READY_TIMEOUT", &mut self.pod_ready_timeout);
        override_parse(lookup, "RUNTIME_PORT", &mut self.runtime_port);
        override_parse(lookup, "FETCHER_PORT", &mut self.fetcher_port);
    }
}

// ── Router ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RouterConfig {
    /// Base URL of the executor API.
    pub executor_url: String,
    /// First per-try timeout. `ROUTER_ROUND_TRIP_TIMEOUT`.
    #[serde(with = "duration_str")]
    pub round_trip_timeout: Duration,
    /// Per-try timeout multiplier. `ROUTER_ROUNDTRIP_TIMEOUT_EXPONENT`.
    pub timeout_exponent: u32,
    /// `ROUTER_ROUND_TRIP_KEEP_ALIVE_TIME`.
    #[serde(with = "duration_str")]
    pub keep_alive_time: Duration,
    /// `ROUTER_ROUND_TRIP_DISABLE_KEEP_ALIVE`.
    pub disable_keep_alive: bool,
    /// `ROUTER_ROUND_TRIP_MAX_RETRIES`.
    pub max_retries: u32,
    /// Failed attempts on one address before it is evicted. `ROUTER_SVC_ADDRESS_MAX_RETRIES`.
    pub svc_address_max_retries: u32,
    /// Budget for an executor address lookup. `ROUTER_SVC_ADDRESS_UPDATE_TIMEOUT`.
    #[serde(with = "duration_str")]
    pub svc_address_update_timeout: Duration,
    /// `ROUTER_UNTAP_SERVICE_TIMEOUT`.
    #[serde(with = "duration_str")]
    pub untap_service_timeout: Duration,
    /// `USE_ENCODED_PATH`.
    pub use_encoded_path: bool,
    /// `DISPLAY_ACCESS_LOG`.
    pub display_access_log: bool,
    /// Surface executor errors verbatim. `DEBUG_ENV`.
    pub debug_env: bool,
    /// Evict and re-query on a backend 5xx. `ROUTER_RETRY_ON_SERVER_ERROR`.
    pub retry_on_server_error: bool,
    /// TTL of cached function addresses.
    #[serde(with = "duration_str")]
    pub function_service_ttl: Duration,
    /// Interval between tap batches sent to the executor.
    #[serde(with = "duration_str")]
    pub tap_interval: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            executor_url: "http://executor.fission".to_string(),
            round_trip_timeout: Duration::from_millis(50),
            timeout_exponent: 2,
            keep_alive_time: Duration::from_secs(30),
            disable_keep_alive: false,
            max_retries: 10,
            svc_address_max_retries: 5,
            svc_address_update_timeout: Duration::from_secs(30),
            untap_service_timeout: Duration::from_secs(3600),
            use_encoded_path: false,
            display_access_log: false,
            debug_env: false,
            retry_on_server_error: true,
            function_service_ttl: Duration::from_secs(60),
            tap_interval: Duration::from_secs(5),
        }
    }
}

impl RouterConfig {
    fn apply_env(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        override_string(lookup, "EXECUTOR_URL", &mut self.executor_url);
        override_duration(lookup, "ROUTER_ROUND_TRIP_TIMEOUT", &mut self.round_trip_timeout);
        override_parse(lookup, "ROUTER_ROUNDTRIP_TIMEOUT_EXPONENT", &mut self.timeout_exponent);
        override_duration(lookup, "ROUTER_ROUND_TRIP_KEEP_ALIVE_TIME", &mut self.keep_alive_time);
        override_bool(lookup, "ROUTER_ROUND_TRIP_DISABLE_KEEP_ALIVE", &mut self.disable_keep_alive);
        override_parse(lookup, "ROUTER_ROUND_TRIP_MAX_RETRIES", &mut self.max_retries);
        override_parse(lookup, "ROUTER_SVC_ADDRESS_MAX_RETRIES", &mut self.svc_address_max_retries);
        override_duration(
            lookup,
            "ROUTER_SVC_ADDRESS_UPDATE_TIMEOUT",
            &mut self.svc_address_update_timeout,
        );
        override_duration(lookup, "ROUTER_UNTAP_SERVICE_TIMEOUT", &mut self.untap_service_timeout);
        override_bool(lookup, "USE_ENCODED_PATH", &mut self.use_encoded_path);
        override_bool(lookup, "DISPLAY_ACCESS_LOG", &mut self.display_access_log);
        override_bool(lookup, "DEBUG_ENV", &mut self.debug_env);
        override_bool(lookup, "ROUTER_RETRY_ON_SERVER_ERROR", &mut self.retry_on_server_error);
    }
}

// ── Builder manager ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BuilderConfig {
    /// Namespace for builder services and deployments. `FISSION_BUILDER_NAMESPACE`.
    pub builder_namespace: String,
    /// Storage service handed to the fetcher on upload. `STORAGE_SERVICE_URL`.
    pub storage_service_url: String,
    /// `BUILDER_IMAGE_PULL_POLICY`.
    pub image_pull_policy: String,
    /// Package build workers. `BUILDER_WORKERS`.
    pub workers: usize,
    /// Requeues per package key before it is dropped.
    pub max_retries: u32,
    /// `BUILDER_PORT`.
    pub builder_port: u16,
    /// `FETCHER_PORT`.
    pub fetcher_port: u16,
    /// How long to wait for a ready builder pod.
    #[serde(with = "duration_str")]
    pub builder_ready_timeout: Duration,
    #[serde(with = "duration_str")]
    pub env_reconcile_interval: Duration,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            builder_namespace: "fission-builder".to_string(),
            storage_service_url: "http://storagesvc.fission".to_string(),
            image_pull_policy: "IfNotPresent".to_string(),
            workers: 4,
            max_retries: 3,
            builder_port: 8001,
            fetcher_port: 8000,
            builder_ready_timeout: Duration::from_secs(300),
            env_reconcile_interval: Duration::from_secs(5),
        }
    }
}

impl BuilderConfig {
    fn apply_env(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        override_string(lookup, "FISSION_BUILDER_NAMESPACE", &mut self.builder_namespace);
        override_string(lookup, "STORAGE_SERVICE_URL", &mut self.storage_service_url);
        override_string(lookup, "BUILDER_IMAGE_PULL_POLICY", &mut self.image_pull_policy);
        override_parse(lookup, "BUILDER_WORKERS", &mut self.workers);
        override_parse(lookup, "BUILDER_PORT", &mut self.builder_port);
        override_parse(lookup, "FETCHER_PORT", &mut self.fetcher_port);
    }
}

// ── Overrides ──────────────────────────────────────────────────────

fn override_string(lookup: &impl Fn(&str) -> Option<String>, key: &str, field: &mut String) {
    if let Some(v) = lookup(key).filter(|v| !v.is_empty()) {
        *field = v;
    }
}

fn override_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, field: &mut bool) {
    if let Some(v) = lookup(key) {
        match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => *field = true,
            "0" | "false" | "no" => *field = false,
            _ => tracing::warn!(%key, value = %v, "ignoring unparsable boolean"),
        }
    }
}

fn override_parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    field: &mut T,
) {
    if let Some(v) = lookup(key) {
        match v.trim().parse() {
            Ok(parsed) => *field = parsed,
            Err(_) => tracing::warn!(%key, value = %v, "ignoring unparsable number"),
        }
    }
}

fn override_duration(lookup: &impl Fn(&str) -> Option<String>, key: &str, field: &mut Duration) {
    if let Some(v) = lookup(key) {
        match parse_duration(&v) {
            Some(d) => *field = d,
            None => tracing::warn!(%key, value = %v, "ignoring unparsable duration"),
        }
    }
}

/// Parse a duration such as `"50ms"`, `"30s"`, `"1m"`, `"1h"`, `"1m30s"` or
/// bare seconds (`"3600"`).
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit())?;
        if digits == 0 {
            return None;
        }
        let value: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];
        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];
        total += match unit {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            _ => return None,
        };
    }
    Some(total)
}

fn format_duration(d: &Duration) -> String {
    if d.subsec_millis() != 0 || d.as_secs() == 0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{}s", d.as_secs())
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid duration: {raw}")))
    }
}
