//! Keyed cache owned by a single worker task.
//!
//! Callers never touch the map directly: every operation is a request on
//! an mpsc channel with a oneshot reply, so reads and writes are totally
//! ordered without locks. Entries optionally expire `ttl` after they were
//! stored; expiry is applied lazily on reads and by a periodic sweep.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{FissionError, FissionResult};

const REQUEST_BUFFER: usize = 256;

enum Request<K, V> {
    Get(K, oneshot::Sender<Option<V>>),
    /// Insert unless present; replies with the existing value otherwise.
    Set(K, V, oneshot::Sender<Option<V>>),
    Upsert(K, V, oneshot::Sender<()>),
    Delete(K, oneshot::Sender<Option<V>>),
    Copy(oneshot::Sender<Vec<(K, V)>>),
}

struct Entry<V> {
    value: V,
    ctime: Instant,
}

/// Handle to a cache worker. Cheap to clone; the worker stops when the last
/// handle is dropped.
pub struct Cache<K, V> {
    tx: mpsc::Sender<Request<K, V>>,
}

impl<K, V> Clone for Cache<K, V> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone + Send + std::fmt::Debug + 'static,
    V: Clone + Send + 'static,
{
    /// Spawn the worker. Must be called from within a tokio runtime.
    pub fn new(ttl: Option<Duration>) -> Self {
        let (tx, rx) = mpsc::channel(REQUEST_BUFFER);
        tokio::spawn(service(rx, ttl));
        Self { tx }
    }

    pub async fn get(&self, key: &K) -> FissionResult<V> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Get(key.clone(), reply)).await?;
        rx.await
            .map_err(|_| closed())?
            .ok_or_else(|| FissionError::not_found(format!("cache entry {key:?} not found")))
    }

    /// Store `value` unless `key` is already present. Returns the value
    /// that was already cached, if any.
    pub async fn set(&self, key: K, value: V) -> FissionResult<Option<V>> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Set(key, value, reply)).await?;
        rx.await.map_err(|_| closed())
    }

    /// Store `value`, replacing any existing entry.
    pub async fn upsert(&self, key: K, value: V) -> FissionResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Upsert(key, value, reply)).await?;
        rx.await.map_err(|_| closed())
    }

    /// Remove `key`, returning the removed value.
    pub async fn delete(&self, key: &K) -> FissionResult<Option<V>> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Delete(key.clone(), reply)).await?;
        rx.await.map_err(|_| closed())
    }

    /// Snapshot of all live entries.
    pub async fn copy(&self) -> FissionResult<Vec<(K, V)>> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Copy(reply)).await?;
        rx.await.map_err(|_| closed())
    }

    async fn send(&self, req: Request<K, V>) -> FissionResult<()> {
        self.tx.send(req).await.map_err(|_| closed())
    }
}

fn closed() -> FissionError {
    FissionError::internal("cache worker stopped")
}

async fn service<K, V>(mut rx: mpsc::Receiver<Request<K, V>>, ttl: Option<Duration>)
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    let mut map: HashMap<K, Entry<V>> = HashMap::new();
    let sweep_every = ttl.unwrap_or(Duration::from_secs(3600));
    let mut sweep = tokio::time::interval(sweep_every);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let expired = |e: &Entry<V>, now: Instant| ttl.is_some_and(|t| now.duration_since(e.ctime) > t);

    loop {
        let req = tokio::select! {
            req = rx.recv() => match req {
                Some(req) => req,
                None => break,
            },
            _ = sweep.tick() => {
                if ttl.is_some() {
                    let now = Instant::now();
                    let before = map.len();
                    map.retain(|_, e| !expired(e, now));
                    if map.len() != before {
                        debug!(removed = before - map.len(), "expired cache entries");
                    }
                }
                continue;
            }
        };

        let now = Instant::now();
        match req {
            Request::Get(key, reply) => {
                if map.get(&key).is_some_and(|e| expired(e, now)) {
                    map.remove(&key);
                }
                let _ = reply.send(map.get(&key).map(|e| e.value.clone()));
            }
            Request::Set(key, value, reply) => {
                if map.get(&key).is_some_and(|e| expired(e, now)) {
                    map.remove(&key);
                }
                match map.get(&key) {
                    Some(existing) => {
                        let _ = reply.send(Some(existing.value.clone()));
                    }
                    None => {
                        map.insert(key, Entry { value, ctime: now });
                        let _ = reply.send(None);
                    }
                }
            }
            Request::Upsert(key, value, reply) => {
                map.insert(key, Entry { value, ctime: now });
                let _ = reply.send(());
            }
            Request::Delete(key, reply) => {
                let _ = reply.send(map.remove(&key).map(|e| e.value));
            }
            Request::Copy(reply) => {
                let snapshot = map
                    .iter()
                    .filter(|(_, e)| !expired(e, now))
                    .map(|(k, e)| (k.clone(), e.value.clone()))
                    .collect();
                let _ = reply.send(snapshot);
            }
        }
    }
}
