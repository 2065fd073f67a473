//! Start-up resource file.
//!
//! ```json
//! {
//!   "environments": [{ "metadata": { "name": "python" }, "spec": { "poolsize": 3 } }],
//!   "functions": [...],
//!   "packages": [...],
//!   "httpTriggers": [...],
//!   "configMaps": [...],
//!   "secrets": [...]
//! }
//! ```
//!
//! Every list is optional. Resources are applied (created or replaced)
//! dependencies first, so functions see their environment and triggers see
//! their functions.

use std::path::Path;

use anyhow::Context;
use fission_core::{ConfigMap, Environment, Function, HttpTrigger, Package, Secret};
use fission_state::{StateResult, StateStore};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Resources {
    pub config_maps: Vec<ConfigMap>,
    pub secrets: Vec<Secret>,
    pub environments: Vec<Environment>,
    pub packages: Vec<Package>,
    pub functions: Vec<Function>,
    pub http_triggers: Vec<HttpTrigger>,
}

impl Resources {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading resources from {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing resources in {}", path.display()))
    }

    /// Apply everything to `store`. Returns the number of resources written.
    pub fn apply(self, store: &StateStore) -> StateResult<usize> {
        let mut applied = 0;
        for cm in self.config_maps {
            store.apply(cm)?;
            applied += 1;
        }
        for secret in self.secrets {
            store.apply(secret)?;
            applied += 1;
        }
        for env in self.environments {
            store.apply(env)?;
            applied += 1;
        }
        for pkg in self.packages {
            store.apply(pkg)?;
            applied += 1;
        }
        for function in self.functions {
            store.apply(function)?;
            applied += 1;
        }
        for trigger in self.http_triggers {
            store.apply(trigger)?;
            applied += 1;
        }
        info!(applied, "resources applied");
        Ok(applied)
    }
}
