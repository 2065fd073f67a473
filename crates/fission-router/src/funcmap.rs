//! Router-side cache of function addresses for the non-pool executors.

use std::time::Duration;

use fission_core::{Cache, ErrorCode, FissionResult, ObjectMeta};
use tracing::debug;

#[derive(Clone)]
pub struct FunctionServiceMap {
    cache: Cache<String, String>,
}

fn key(meta: &ObjectMeta) -> String {
    format!("{}/{}/{}", meta.name, meta.namespace, meta.resource_version)
}

impl FunctionServiceMap {
    /// Must be called inside a tokio runtime.
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Cache::new(Some(ttl)),
        }
    }

    /// `Ok(None)` when nothing is cached for this function revision.
    pub async fn lookup(&self, meta: &ObjectMeta) -> FissionResult<Option<String>> {
        match self.cache.get(&key(meta)).await {
            Ok(address) => Ok(Some(address)),
            Err(e) if e.is(ErrorCode::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn assign(&self, meta: &ObjectMeta, address: &str) -> FissionResult<()> {
        debug!(function = %meta.name, namespace = %meta.namespace, address, "caching function address");
        self.cache.upsert(key(meta), address.to_string()).await
    }

    pub async fn remove(&self, meta: &ObjectMeta) -> FissionResult<()> {
        self.cache.delete(&key(meta)).await.map(|_| ())
    }
}
