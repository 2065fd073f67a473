//! Dependencies shared by every executor kind.

use std::sync::Arc;

use fission_core::{
    Cache, DEFAULT_NAMESPACE, Environment, ExecutorConfig, FissionError, FissionResult, Function,
};
use fission_fscache::FunctionServiceCache;
use fission_orchestrator::Orchestrator;
use fission_state::StateStore;
use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::debug;

/// Catalog, orchestrator, configuration and caches, cloned into every
/// manager and background task.
#[derive(Clone)]
pub struct ExecutorContext {
    pub store: StateStore,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub config: ExecutorConfig,
    /// Stamped on every object this executor creates.
    pub instance_id: String,
    pub fscache: FunctionServiceCache,
    environments: Cache<(String, String), Environment>,
}

impl ExecutorContext {
    /// Must be called inside a tokio runtime; spawns the cache workers.
    pub fn new(store: StateStore, orchestrator: Arc<dyn Orchestrator>, config: ExecutorConfig) -> Self {
        let instance_id = config
            .instance_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(random_instance_id);
        let environments = Cache::new(Some(config.env_cache_ttl));
        Self {
            store,
            orchestrator,
            config,
            instance_id,
            fscache: FunctionServiceCache::new(),
            environments,
        }
    }

    /// Namespace where objects for resources of `namespace` live: the
    /// function namespace for `default`, the resource's own otherwise.
    pub fn namespace_for(&self, namespace: &str) -> String {
        if namespace.is_empty() || namespace == DEFAULT_NAMESPACE {
            self.config.function_namespace.clone()
        } else {
            namespace.to_string()
        }
    }

    /// The function's environment, served from a short-lived cache.
    pub async fn environment(&self, function: &Function) -> FissionResult<Environment> {
        let env_ref = &function.spec.environment;
        let namespace = if env_ref.namespace.is_empty() {
            function.metadata.namespace.clone()
        } else {
            env_ref.namespace.clone()
        };
        let key = (namespace, env_ref.name.clone());
        if let Ok(env) = self.environments.get(&key).await {
            return Ok(env);
        }
        let env = self
            .store
            .get::<Environment>(&key.0, &key.1)?
            .ok_or_else(|| FissionError::not_found(format!("environment {}/{} not found", key.0, key.1)))?;
        debug!(namespace = %key.0, name = %key.1, "environment cached");
        self.environments.upsert(key, env.clone()).await?;
        Ok(env)
    }

    /// The latest catalog copy of the function `fsvc` serves, if any.
    pub fn current_function(&self, namespace: &str, name: &str) -> FissionResult<Option<Function>> {
        Ok(self.store.get::<Function>(namespace, name)?)
    }
}

fn random_instance_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use fission_core::{EnvironmentReference, ObjectMeta};
    use fission_orchestrator::InMemoryOrchestrator;

    use super::*;

    pub fn context(orchestrator: InMemoryOrchestrator) -> ExecutorContext {
        let config = ExecutorConfig {
            instance_id: Some("exec-a".into()),
            ..Default::default()
        };
        ExecutorContext::new(StateStore::open_in_memory().unwrap(), Arc::new(orchestrator), config)
    }

    pub fn environment(ctx: &ExecutorContext, name: &str, poolsize: u32) -> Environment {
        let mut env = Environment {
            metadata: ObjectMeta::new("default", name),
            ..Default::default()
        };
        env.spec.runtime.image = format!("fission/{name}-env");
        env.spec.poolsize = poolsize;
        ctx.store.create(env).unwrap()
    }

    pub fn function(ctx: &ExecutorContext, name: &str, env: &str) -> Function {
        let mut f = Function {
            metadata: ObjectMeta::new("default", name),
            ..Default::default()
        };
        f.spec.environment = EnvironmentReference {
            namespace: "default".into(),
            name: env.into(),
        };
        f.spec.package.function_name = "main".into();
        ctx.store.create(f).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use fission_orchestrator::InMemoryOrchestrator;

    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn default_namespace_maps_to_function_namespace() {
        let ctx = context(InMemoryOrchestrator::new());
        assert_eq!(ctx.namespace_for("default"), "fission-function");
        assert_eq!(ctx.namespace_for(""), "fission-function");
        assert_eq!(ctx.namespace_for("team-a"), "team-a");
        assert_eq!(ctx.instance_id, "exec-a");
    }

    #[tokio::test]
    async fn environment_lookup_is_cached() {
        let ctx = context(InMemoryOrchestrator::new());
        let env = environment(&ctx, "python", 3);
        let f = function(&ctx, "hello", "python");

        assert_eq!(ctx.environment(&f).await.unwrap().metadata.uid, env.metadata.uid);
        ctx.store.delete::<Environment>("default", "python").unwrap();
        // Still served from the cache until the TTL runs out.
        assert_eq!(ctx.environment(&f).await.unwrap().metadata.uid, env.metadata.uid);
    }

    #[tokio::test]
    async fn missing_environment_is_not_found() {
        let ctx = context(InMemoryOrchestrator::new());
        let f = function(&ctx, "hello", "nope");
        let err = ctx.environment(&f).await.unwrap_err();
        assert!(err.is(fission_core::ErrorCode::NotFound));
    }

    #[tokio::test]
    async fn generated_instance_id() {
        let ctx = ExecutorContext::new(
            StateStore::open_in_memory().unwrap(),
            Arc::new(InMemoryOrchestrator::new()),
            ExecutorConfig::default(),
        );
        assert_eq!(ctx.instance_id.len(), 8);
    }
}
