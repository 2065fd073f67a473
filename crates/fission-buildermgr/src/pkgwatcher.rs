//! Package watcher: the work queue feeding [`PackageBuilder`].
//!
//! # Architecture
//!
//! ```text
//! catalog events ──► observe ──► WorkQueue ──► worker × N ──► reconcile
//!                                   ▲                            │
//!                                   └──── add_rate_limited ◄─────┘ (on error)
//! ```
//!
//! Reconcile reads the package fresh from the catalog:
//!
//! - no status yet: `none` when it already has a deployment archive,
//!   `pending` when it has a source archive, `failed` otherwise
//! - `pending`: build it
//! - `running` with no build in flight: the build that marked it could not
//!   record its outcome, so build it again
//! - `succeeded`: move functions still on an older revision
//! - anything else: nothing to do
//!
//! A package still failing after `max_retries` requeues is marked `failed`.

use std::sync::Arc;

use fission_core::{BuildStatus, BuilderConfig, Package};
use fission_state::{CatalogEvent, Change, StateStore};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use crate::build::PackageBuilder;
use crate::error::BuildResult;
use crate::queue::WorkQueue;

pub const EMPTY_PACKAGE_LOG: &str = "Both deploy and source archive are empty";

/// Status a package without one starts in, with its build log.
pub fn initial_status(pkg: &Package) -> (BuildStatus, String) {
    if !pkg.spec.deployment.is_empty() {
        (BuildStatus::None, String::new())
    } else if !pkg.spec.source.is_empty() {
        (BuildStatus::Pending, String::new())
    } else {
        (BuildStatus::Failed, EMPTY_PACKAGE_LOG.to_string())
    }
}

/// Queue key for a package change, or `None` when it needs no work.
pub fn observe(change: &Change<Package>) -> Option<String> {
    match change {
        Change::Added(pkg) => Some(pkg.metadata.table_key()),
        Change::Updated { old, new } => {
            let unchanged = old.metadata.resource_version == new.metadata.resource_version;
            if unchanged && new.status.build_status != Some(BuildStatus::Pending) {
                return None;
            }
            Some(new.metadata.table_key())
        }
        Change::Deleted(_) => None,
    }
}

pub struct PackageWatcher {
    store: StateStore,
    builder: Arc<PackageBuilder>,
    queue: Arc<WorkQueue>,
    workers: usize,
    max_retries: u32,
}

impl PackageWatcher {
    pub fn new(store: StateStore, builder: Arc<PackageBuilder>, config: &BuilderConfig) -> Self {
        Self {
            store,
            builder,
            queue: Arc::new(WorkQueue::default()),
            workers: config.workers.max(1),
            max_retries: config.max_retries,
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Queue every known package, then start the workers and follow package
    /// changes. Must be called inside a tokio runtime.
    pub fn start(self: &Arc<Self>) -> BuildResult<()> {
        let events = self.store.watch();
        for pkg in self.store.list::<Package>()? {
            self.queue.add(&pkg.metadata.table_key());
        }
        for id in 0..self.workers {
            tokio::spawn(Arc::clone(self).work(id));
        }
        tokio::spawn(Arc::clone(self).watch(events));
        info!(workers = self.workers, "package watcher started");
        Ok(())
    }

    async fn watch(self: Arc<Self>, mut events: broadcast::Receiver<CatalogEvent>) {
        loop {
            match events.recv().await {
                Ok(CatalogEvent::Package(change)) => {
                    if let Some(key) = observe(&change) {
                        self.queue.add(&key);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "package watcher lagged, requeueing all packages");
                    match self.store.list::<Package>() {
                        Ok(pkgs) => pkgs.iter().for_each(|p| self.queue.add(&p.metadata.table_key())),
                        Err(e) => warn!(error = %e, "failed to list packages"),
                    }
                }
                Err(RecvError::Closed) => {
                    debug!("catalog watch closed");
                    self.queue.shut_down();
                    return;
                }
            }
        }
    }

    async fn work(self: Arc<Self>, id: usize) {
        while let Some(key) = self.queue.get().await {
            match self.reconcile(&key).await {
                Ok(()) => self.queue.forget(&key),
                Err(e) if self.queue.num_requeues(&key) < self.max_retries => {
                    warn!(worker = id, %key, error = %e, "error reconciling package, requeueing");
                    self.queue.add_rate_limited(&key);
                }
                Err(e) => {
                    error!(worker = id, %key, error = %e, "dropping package after max retries");
                    let (namespace, name) = split_key(&key);
                    if let Err(e) = self.builder.give_up(namespace, name, &e.to_string()) {
                        warn!(worker = id, %key, error = %e, "failed to mark package failed");
                    }
                    self.queue.forget(&key);
                }
            }
            self.queue.done(&key);
        }
        debug!(worker = id, "package worker stopped");
    }

    pub async fn reconcile(&self, key: &str) -> BuildResult<()> {
        let (namespace, name) = split_key(key);
        let Some(pkg) = self.store.get::<Package>(namespace, name)? else {
            debug!(%key, "package gone");
            return Ok(());
        };
        match pkg.status.build_status {
            None => {
                let (status, log) = initial_status(&pkg);
                debug!(%key, %status, "initializing package status");
                self.builder.set_status(pkg, status, log, None)?;
                Ok(())
            }
            Some(BuildStatus::Pending) => self.builder.build(pkg).await.map(drop),
            Some(BuildStatus::Running) => {
                if self.builder.is_building(&pkg).await? {
                    return Ok(());
                }
                info!(%key, "package left running, building it again");
                self.builder.build(pkg).await.map(drop)
            }
            Some(BuildStatus::Succeeded) => self.builder.update_functions(&pkg).map(drop),
            Some(_) => Ok(()),
        }
    }
}

fn split_key(key: &str) -> (&str, &str) {
    key.split_once('/').unwrap_or(("", key))
}
