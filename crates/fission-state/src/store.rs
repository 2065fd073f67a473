//! StateStore — redb-backed resource catalog.
//!
//! Typed CRUD over every [`Stored`] resource kind. Values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing and
//! standalone mode).

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use fission_core::{
    ConfigMap, DEFAULT_NAMESPACE, Environment, Function, HttpTrigger, Package, Resource, Secret,
};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::watch::{CatalogEvent, Change};

/// Buffered events per watcher before it starts lagging.
const WATCH_BUFFER: usize = 1024;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// A resource kind with its own catalog table.
pub trait Stored: Resource {
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]>;

    fn wrap(change: Change<Self>) -> CatalogEvent;
}

impl Stored for Function {
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]> = FUNCTIONS;

    fn wrap(change: Change<Self>) -> CatalogEvent {
        CatalogEvent::Function(change)
    }
}

impl Stored for Environment {
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]> = ENVIRONMENTS;

    fn wrap(change: Change<Self>) -> CatalogEvent {
        CatalogEvent::Environment(change)
    }
}

impl Stored for Package {
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]> = PACKAGES;

    fn wrap(change: Change<Self>) -> CatalogEvent {
        CatalogEvent::Package(change)
    }
}

impl Stored for HttpTrigger {
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]> = HTTP_TRIGGERS;

    fn wrap(change: Change<Self>) -> CatalogEvent {
        CatalogEvent::HttpTrigger(change)
    }
}

impl Stored for ConfigMap {
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]> = CONFIG_MAPS;

    fn wrap(change: Change<Self>) -> CatalogEvent {
        CatalogEvent::ConfigMap(change)
    }
}

impl Stored for Secret {
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]> = SECRETS;

    fn wrap(change: Change<Self>) -> CatalogEvent {
        CatalogEvent::Secret(change)
    }
}

/// Thread-safe resource catalog backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    /// Orders commit + event publication across writers.
    write_lock: Arc<Mutex<()>>,
    events: broadcast::Sender<CatalogEvent>,
}

impl StateStore {
    /// Open (or create) a persistent catalog at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!(?path, "catalog opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory catalog.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!("in-memory catalog opened");
        Ok(store)
    }

    fn from_database(db: Database) -> StateResult<Self> {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        let store = Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
            events,
        };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(FUNCTIONS).map_err(map_err!(Table))?;
        txn.open_table(ENVIRONMENTS).map_err(map_err!(Table))?;
        txn.open_table(PACKAGES).map_err(map_err!(Table))?;
        txn.open_table(HTTP_TRIGGERS).map_err(map_err!(Table))?;
        txn.open_table(CONFIG_MAPS).map_err(map_err!(Table))?;
        txn.open_table(SECRETS).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Subscribe to catalog changes committed from now on.
    pub fn watch(&self) -> broadcast::Receiver<CatalogEvent> {
        self.events.subscribe()
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Insert a new resource. Fails if one with the same key exists.
    pub fn create<T: Stored>(&self, obj: T) -> StateResult<T> {
        let obj = with_default_namespace(obj);
        let key = obj.meta().table_key();
        let (_, stored) = self.commit::<T>(&key, |old, rv| {
            if old.is_some() {
                return Err(StateError::AlreadyExists(format!("{} {key}", T::KIND)));
            }
            let mut obj = obj;
            let meta = obj.meta_mut();
            if meta.uid.is_empty() {
                meta.uid = new_uid();
            }
            meta.resource_version = rv.to_string();
            meta.generation = 1;
            Ok(Some(obj))
        })?;
        debug!(kind = %T::KIND, %key, "resource created");
        stored.ok_or_else(|| StateError::Write(format!("{} {key} vanished", T::KIND)))
    }

    /// Replace an existing resource. When the incoming resource carries a
    /// resource version it must match the stored one.
    pub fn update<T: Stored>(&self, obj: T) -> StateResult<T> {
        self.write_existing(obj, true)
    }

    /// Create or replace, ignoring the incoming resource version.
    pub fn apply<T: Stored>(&self, obj: T) -> StateResult<T> {
        let obj = with_default_namespace(obj);
        let exists = self
            .get::<T>(&obj.meta().namespace, &obj.meta().name)?
            .is_some();
        if exists {
            self.write_existing(obj, false)
        } else {
            self.create(obj)
        }
    }

    fn write_existing<T: Stored>(&self, obj: T, check_version: bool) -> StateResult<T> {
        let obj = with_default_namespace(obj);
        let key = obj.meta().table_key();
        let (_, stored) = self.commit::<T>(&key, |old, rv| {
            let Some(old) = old else {
                return Err(StateError::NotFound(format!("{} {key}", T::KIND)));
            };
            let given = &obj.meta().resource_version;
            if check_version && !given.is_empty() && *given != old.meta().resource_version {
                return Err(StateError::Conflict {
                    key: key.clone(),
                    current: old.meta().resource_version.clone(),
                    given: given.clone(),
                });
            }
            let spec_changed = !old.same_spec(&obj);
            let mut obj = obj;
            let meta = obj.meta_mut();
            meta.uid = old.meta().uid.clone();
            meta.resource_version = rv.to_string();
            meta.generation = old.meta().generation + i64::from(spec_changed);
            Ok(Some(obj))
        })?;
        debug!(kind = %T::KIND, %key, "resource updated");
        stored.ok_or_else(|| StateError::Write(format!("{} {key} vanished", T::KIND)))
    }

    /// Delete a resource. Returns the deleted resource if it existed.
    pub fn delete<T: Stored>(&self, namespace: &str, name: &str) -> StateResult<Option<T>> {
        let key = format!("{}/{name}", namespace_or_default(namespace));
        let (old, _) = self.commit::<T>(&key, |_, _| Ok(None))?;
        debug!(kind = %T::KIND, %key, existed = old.is_some(), "resource deleted");
        Ok(old)
    }

    /// Run `mutate` against the stored value inside one write transaction,
    /// then publish the resulting change. `mutate` receives the current
    /// value and the resource version to stamp; returning `None` deletes.
    fn commit<T: Stored>(
        &self,
        key: &str,
        mutate: impl FnOnce(Option<T>, u64) -> StateResult<Option<T>>,
    ) -> StateResult<(Option<T>, Option<T>)> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let (old, new) = {
            let mut table = txn.open_table(T::TABLE).map_err(map_err!(Table))?;
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;

            let old: Option<T> = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            let next_rv = meta
                .get(RESOURCE_VERSION_KEY)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0)
                + 1;

            let new = mutate(old.clone(), next_rv)?;
            match &new {
                Some(obj) => {
                    let value = serde_json::to_vec(obj).map_err(map_err!(Serialize))?;
                    table
                        .insert(key, value.as_slice())
                        .map_err(map_err!(Write))?;
                    meta.insert(RESOURCE_VERSION_KEY, next_rv)
                        .map_err(map_err!(Write))?;
                }
                None if old.is_some() => {
                    table.remove(key).map_err(map_err!(Write))?;
                    meta.insert(RESOURCE_VERSION_KEY, next_rv)
                        .map_err(map_err!(Write))?;
                }
                None => {}
            }
            (old, new)
        };
        txn.commit().map_err(map_err!(Transaction))?;

        let change = match (&old, &new) {
            (None, Some(n)) => Some(Change::Added(n.clone())),
            (Some(o), Some(n)) => Some(Change::Updated {
                old: o.clone(),
                new: n.clone(),
            }),
            (Some(o), None) => Some(Change::Deleted(o.clone())),
            (None, None) => None,
        };
        if let Some(change) = change {
            // No receivers is fine.
            let _ = self.events.send(T::wrap(change));
        }
        Ok((old, new))
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Get a resource by namespace and name.
    pub fn get<T: Stored>(&self, namespace: &str, name: &str) -> StateResult<Option<T>> {
        let key = format!("{}/{name}", namespace_or_default(namespace));
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(T::TABLE).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let obj: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(obj))
            }
            None => Ok(None),
        }
    }

    /// Like [`get`](Self::get) but a missing resource is an error.
    pub fn require<T: Stored>(&self, namespace: &str, name: &str) -> StateResult<T> {
        self.get(namespace, name)?.ok_or_else(|| {
            StateError::NotFound(format!("{} {}/{name}", T::KIND, namespace_or_default(namespace)))
        })
    }

    /// List every resource of a kind.
    pub fn list<T: Stored>(&self) -> StateResult<Vec<T>> {
        self.scan(None)
    }

    /// List the resources of a kind in one namespace.
    pub fn list_namespace<T: Stored>(&self, namespace: &str) -> StateResult<Vec<T>> {
        let prefix = format!("{}/", namespace_or_default(namespace));
        self.scan(Some(&prefix))
    }

    fn scan<T: Stored>(&self, prefix: Option<&str>) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(T::TABLE).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if prefix.is_some_and(|p| !key.value().starts_with(p)) {
                continue;
            }
            let obj: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(obj);
        }
        Ok(results)
    }
}

fn namespace_or_default(namespace: &str) -> &str {
    if namespace.is_empty() {
        DEFAULT_NAMESPACE
    } else {
        namespace
    }
}

fn with_default_namespace<T: Resource>(mut obj: T) -> T {
    if obj.meta().namespace.is_empty() {
        obj.meta_mut().namespace = DEFAULT_NAMESPACE.to_string();
    }
    obj
}

/// Random RFC 4122 style (version 4) identifier.
fn new_uid() -> String {
    let v: u128 = rand::random();
    let v = (v & !(0xf << 76)) | (0x4 << 76);
    let v = (v & !(0x3 << 62)) | (0x2 << 62);
    let hex = format!("{v:032x}");
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}
