//! Trigger set: keeps the route table in step with the catalog.
//!
//! # Architecture
//!
//! ```text
//! catalog watch ──▶ watcher ──(signal, cap 10)──▶ updater ──▶ MutableRouter::store
//!                     │
//!                     └─▶ resolver invalidation
//! ```
//!
//! The watcher turns every trigger or function event into a rebuild
//! signal; a full channel means a rebuild is already pending. The updater
//! waits a short debounce after the first signal, drains the rest and
//! rebuilds the whole table from the catalog.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use fission_core::labels::url_for_function;
use fission_core::{FissionResult, Function, HttpTrigger};
use fission_state::{CatalogEvent, Change, StateStore};
use http::Method;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::handler::{FunctionHandler, HandlerContext};
use crate::resolver::{FunctionResolver, TriggerRef};
use crate::route::{Endpoint, MutableRouter, PathMatch, Route, RouteTable};

const SIGNAL_CAPACITY: usize = 10;
const DEBOUNCE: Duration = Duration::from_millis(20);

pub const HEALTHZ_PATH: &str = "/router-healthz";
pub const VERSION_PATH: &str = "/_version";

/// Counts from one rebuild.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    pub triggers: usize,
    pub skipped: usize,
    pub functions: usize,
    pub routes: usize,
}

pub struct TriggerSet {
    store: StateStore,
    resolver: FunctionResolver,
    ctx: Arc<HandlerContext>,
    router: Arc<MutableRouter>,
    /// Triggers whose function reference did not resolve, with the reason.
    misses: Mutex<HashMap<TriggerRef, String>>,
}

impl TriggerSet {
    pub fn new(store: StateStore, ctx: Arc<HandlerContext>, router: Arc<MutableRouter>) -> Self {
        Self {
            resolver: FunctionResolver::new(store.clone()),
            store,
            ctx,
            router,
            misses: Mutex::new(HashMap::new()),
        }
    }

    pub fn resolver(&self) -> &FunctionResolver {
        &self.resolver
    }

    pub fn misses(&self) -> HashMap<TriggerRef, String> {
        self.misses.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Build a new table from the catalog and publish it.
    pub fn sync(&self) -> FissionResult<SyncStats> {
        let (table, stats) = self.build_table()?;
        self.router.store(table);
        debug!(?stats, "route table published");
        Ok(stats)
    }

    pub fn build_table(&self) -> FissionResult<(RouteTable, SyncStats)> {
        let mut table = RouteTable::new();
        let mut stats = SyncStats::default();
        let mut misses = HashMap::new();

        for trigger in self.store.list::<HttpTrigger>()? {
            let key = TriggerRef::of(&trigger);
            let resolved = match self.resolver.resolve(&trigger) {
                Ok(resolved) => resolved,
                Err(e) => {
                    warn!(trigger = %key.trigger, namespace = %key.namespace, error = %e, "skipping unresolvable trigger");
                    misses.insert(key, e.message);
                    stats.skipped += 1;
                    continue;
                }
            };
            let handler = Arc::new(FunctionHandler::for_trigger(self.ctx.clone(), trigger.clone(), resolved));
            if add_trigger_routes(&mut table, &trigger, handler) {
                stats.triggers += 1;
            } else {
                stats.skipped += 1;
            }
        }
        *self.misses.lock().unwrap_or_else(PoisonError::into_inner) = misses;

        if !table.has_exact(&Method::GET, "/") {
            table.add(fixed(PathMatch::Exact("/".into()), Some(vec![Method::GET]), Endpoint::Ok));
        }
        table.add(fixed(PathMatch::Exact(HEALTHZ_PATH.into()), None, Endpoint::Ok));
        table.add(fixed(PathMatch::Exact(VERSION_PATH.into()), Some(vec![Method::GET]), Endpoint::Version));

        for function in self.store.list::<Function>()? {
            let url = url_for_function(&function.metadata.name, &function.metadata.namespace);
            let handler = Arc::new(FunctionHandler::for_function(self.ctx.clone(), function));
            table.add(fixed(PathMatch::Exact(url.clone()), None, Endpoint::Function(handler.clone())));
            table.add(fixed(PathMatch::Prefix(format!("{url}/")), None, Endpoint::Function(handler)));
            stats.functions += 1;
        }

        stats.routes = table.len();
        Ok((table, stats))
    }

    /// Publish an initial table, then keep it current in the background.
    /// Must be called inside a tokio runtime.
    pub fn start(self: &Arc<Self>) -> FissionResult<()> {
        let events = self.store.watch();
        let stats = self.sync()?;
        info!(triggers = stats.triggers, functions = stats.functions, "router table ready");

        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_CAPACITY);
        tokio::spawn(self.clone().watch(events, signal_tx));
        tokio::spawn(self.clone().update(signal_rx));
        Ok(())
    }

    async fn watch(self: Arc<Self>, mut events: broadcast::Receiver<CatalogEvent>, signal: mpsc::Sender<()>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if self.observe(&event) {
                        // Full means a rebuild is already queued.
                        let _ = signal.try_send(());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "router fell behind the catalog, rebuilding");
                    let _ = signal.try_send(());
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("catalog watch closed");
                    return;
                }
            }
        }
    }

    /// Update resolver state for `event`; true when the table needs a rebuild.
    fn observe(&self, event: &CatalogEvent) -> bool {
        match event {
            CatalogEvent::HttpTrigger(change) => {
                if let Change::Deleted(trigger) | Change::Updated { old: trigger, .. } = change {
                    self.resolver.delete(&TriggerRef::of(trigger));
                }
                true
            }
            CatalogEvent::Function(change) => {
                match change {
                    Change::Updated { old, new } if old.metadata.resource_version != new.metadata.resource_version => {
                        let dropped = self.resolver.invalidate_function(new);
                        debug!(function = %new.metadata.name, dropped, "function changed, resolver invalidated");
                    }
                    Change::Deleted(f) => {
                        self.resolver.forget_function(&f.metadata.namespace, &f.metadata.name);
                    }
                    _ => {}
                }
                true
            }
            _ => false,
        }
    }

    async fn update(self: Arc<Self>, mut signal: mpsc::Receiver<()>) {
        while signal.recv().await.is_some() {
            tokio::time::sleep(DEBOUNCE).await;
            while signal.try_recv().is_ok() {}
            if let Err(e) = self.sync() {
                warn!(error = %e, "route table rebuild failed");
            }
        }
    }
}

fn fixed(path: PathMatch, methods: Option<Vec<Method>>, endpoint: Endpoint) -> Route {
    Route {
        path,
        methods,
        host: None,
        endpoint,
    }
}

/// Register `trigger`'s routes. A prefix ending in `/` is one prefix route;
/// any other prefix gets both its exact form and its `/` sub-tree.
fn add_trigger_routes(table: &mut RouteTable, trigger: &HttpTrigger, handler: Arc<FunctionHandler>) -> bool {
    let methods: Vec<Method> = trigger
        .methods()
        .iter()
        .filter_map(|m| match Method::from_str(m) {
            Ok(m) => Some(m),
            Err(_) => {
                warn!(trigger = %trigger.metadata.name, method = %m, "ignoring invalid method");
                None
            }
        })
        .collect();
    let host = match trigger.spec.host.trim() {
        "" | "*" => None,
        h => Some(h.to_string()),
    };
    let route = |path: PathMatch| Route {
        path,
        methods: Some(methods.clone()),
        host: host.clone(),
        endpoint: Endpoint::Function(handler.clone()),
    };

    match trigger.spec.prefix.as_deref().filter(|p| !p.is_empty()) {
        Some(prefix) if prefix.ends_with('/') => table.add(route(PathMatch::Prefix(prefix.to_string()))),
        Some(prefix) => {
            table.add(route(PathMatch::Exact(prefix.to_string())));
            table.add(route(PathMatch::Prefix(format!("{prefix}/"))));
        }
        None if trigger.spec.relative_url.is_empty() => {
            warn!(trigger = %trigger.metadata.name, "trigger has neither a URL nor a prefix");
            return false;
        }
        None => table.add(route(PathMatch::Exact(trigger.spec.relative_url.clone()))),
    }
    true
}
