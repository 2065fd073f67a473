//! fission-core — shared model and primitives for the Fission function engine.
//!
//! Every other crate in the workspace builds on the types defined here:
//!
//! - **`types`** — the resource catalog (Function, Environment, Package,
//!   HTTPTrigger, ConfigMap, Secret) and the keys derived from them
//! - **`error`** — `FissionError` with its stable `ErrorCode` and HTTP mapping
//! - **`config`** — `fission.toml` parsing with environment overrides
//! - **`labels`** — label and annotation names stamped on orchestrator objects
//! - **`cache`** — a keyed serializer cache with optional TTL expiry

pub mod cache;
pub mod config;
pub mod error;
pub mod labels;
pub mod types;

pub use cache::Cache;
pub use config::{BuilderConfig, ExecutorConfig, FissionConfig, RouterConfig, parse_duration};
pub use error::{ErrorCode, FissionError, FissionResult};
pub use types::*;

/// Version string reported by `/_version` and the daemon.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
