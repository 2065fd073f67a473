//! fission-buildermgr — turns source packages into deployment archives.
//!
//! # Components
//!
//! - **`pkgwatcher`** — [`PackageWatcher`], queues package changes and runs
//!   the reconcile workers
//! - **`build`** — [`PackageBuilder`], one build through an environment's
//!   builder pod
//! - **`envwatcher`** — [`EnvironmentWatcher`], keeps a builder service and
//!   deployment per environment revision
//! - **`queue`** — [`WorkQueue`], deduplicating, rate-limited key queue
//! - **`error`** — [`BuildError`]

pub mod build;
pub mod envwatcher;
pub mod error;
pub mod pkgwatcher;
pub mod queue;

use std::sync::Arc;

use fission_core::BuilderConfig;
use fission_orchestrator::Orchestrator;
use fission_state::StateStore;

pub use build::PackageBuilder;
pub use envwatcher::{BuilderInfo, BuilderSyncStats, EnvironmentWatcher};
pub use error::{BuildError, BuildResult};
pub use pkgwatcher::PackageWatcher;
pub use queue::WorkQueue;

/// Start the environment watcher and the package watcher. Must be called
/// inside a tokio runtime.
pub fn start(
    store: StateStore,
    orchestrator: Arc<dyn Orchestrator>,
    config: BuilderConfig,
) -> BuildResult<Arc<PackageWatcher>> {
    let envw = EnvironmentWatcher::new(store.clone(), orchestrator.clone(), config.clone());
    tokio::spawn(envw.run());

    let builder = Arc::new(PackageBuilder::new(store.clone(), orchestrator, config.clone()));
    let pkgw = Arc::new(PackageWatcher::new(store, builder, &config));
    pkgw.start()?;
    Ok(pkgw)
}
