//! Function-service cache for deployment-backed executors.
//!
//! `newdeploy` and `container` functions have exactly one service per
//! function revision, so a plain keyed map suffices. Secondary indexes map
//! an address and a function uid back to the revision key, and a pod index
//! maps specialized pool pods to the service they host.

use std::collections::HashMap;
use std::time::Duration;

use fission_core::{FissionError, FissionResult, FunctionKey, ObjectMeta};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::funcsvc::FuncSvc;
use crate::poolcache::PoolCache;

const REQUEST_BUFFER: usize = 256;

enum Request {
    Add(Box<FuncSvc>, oneshot::Sender<Option<FuncSvc>>),
    ByKey(FunctionKey, oneshot::Sender<Option<FuncSvc>>),
    ByUid(String, oneshot::Sender<Option<FuncSvc>>),
    Touch(String, oneshot::Sender<bool>),
    Delete(Box<FuncSvc>, oneshot::Sender<()>),
    DeleteOld(Box<FuncSvc>, Duration, oneshot::Sender<bool>),
    ListOld(Duration, oneshot::Sender<Vec<FuncSvc>>),
    SetPod(String, Box<FuncSvc>, oneshot::Sender<()>),
    Pod(String, oneshot::Sender<Option<FuncSvc>>),
    RemovePod(String, oneshot::Sender<Option<FuncSvc>>),
    PodsOf(String, oneshot::Sender<Vec<(String, FuncSvc)>>),
    Dump(oneshot::Sender<Vec<String>>),
}

#[derive(Default)]
struct State {
    by_function: HashMap<FunctionKey, FuncSvc>,
    by_address: HashMap<String, FunctionKey>,
    by_uid: HashMap<String, FunctionKey>,
    pods: HashMap<String, FuncSvc>,
}

impl State {
    fn touch_key(&mut self, key: &FunctionKey) -> Option<FuncSvc> {
        let fsvc = self.by_function.get_mut(key)?;
        fsvc.atime = Instant::now();
        Some(fsvc.clone())
    }

    fn remove(&mut self, fsvc: &FuncSvc) {
        let key = fsvc.key();
        self.by_function.remove(&key);
        if self.by_address.get(&fsvc.address) == Some(&key) {
            self.by_address.remove(&fsvc.address);
        }
        if self.by_uid.get(&fsvc.function.uid) == Some(&key) {
            self.by_uid.remove(&fsvc.function.uid);
        }
        debug!(%key, address = %fsvc.address, lifetime = ?fsvc.ctime.elapsed(), "function service removed");
    }
}

/// Handle to the function-service cache. Cheap to clone.
#[derive(Clone)]
pub struct FunctionServiceCache {
    tx: mpsc::Sender<Request>,
    pool: PoolCache,
}

impl FunctionServiceCache {
    /// Spawn the cache worker and its pool cache. Must be called from within
    /// a tokio runtime.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(REQUEST_BUFFER);
        tokio::spawn(service(rx));
        Self {
            tx,
            pool: PoolCache::new(),
        }
    }

    /// The pool cache used for pool-managed functions.
    pub fn pool(&self) -> &PoolCache {
        &self.pool
    }

    /// Cache `fsvc` unless its revision already has a service. In that case
    /// the existing entry is touched and returned.
    pub async fn add(&self, fsvc: FuncSvc) -> FissionResult<Option<FuncSvc>> {
        let (reply, rx) = oneshot::channel();
        self.call(Request::Add(Box::new(fsvc), reply), rx).await
    }

    pub async fn get_by_function(&self, meta: &ObjectMeta) -> FissionResult<FuncSvc> {
        let key = FunctionKey::from_meta(meta);
        let (reply, rx) = oneshot::channel();
        self.call(Request::ByKey(key.clone(), reply), rx)
            .await?
            .ok_or_else(|| FissionError::not_found(format!("function service for '{key}' not found")))
    }

    pub async fn get_by_function_uid(&self, uid: &str) -> FissionResult<FuncSvc> {
        let (reply, rx) = oneshot::channel();
        self.call(Request::ByUid(uid.to_string(), reply), rx)
            .await?
            .ok_or_else(|| FissionError::not_found(format!("function service for uid '{uid}' not found")))
    }

    pub async fn touch_by_address(&self, address: &str) -> FissionResult<()> {
        let (reply, rx) = oneshot::channel();
        if self.call(Request::Touch(address.to_string(), reply), rx).await? {
            Ok(())
        } else {
            Err(FissionError::not_found(format!("no function service at {address}")))
        }
    }

    pub async fn delete_entry(&self, fsvc: &FuncSvc) -> FissionResult<()> {
        let (reply, rx) = oneshot::channel();
        self.call(Request::Delete(Box::new(fsvc.clone()), reply), rx).await
    }

    /// Delete `fsvc` if it has been idle for at least `min_age`.
    pub async fn delete_old(&self, fsvc: &FuncSvc, min_age: Duration) -> FissionResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.call(Request::DeleteOld(Box::new(fsvc.clone()), min_age, reply), rx)
            .await
    }

    /// Services idle for longer than `age`.
    pub async fn list_old(&self, age: Duration) -> FissionResult<Vec<FuncSvc>> {
        let (reply, rx) = oneshot::channel();
        self.call(Request::ListOld(age, reply), rx).await
    }

    /// Record that pool pod `pod` (`{namespace}/{name}`) hosts `fsvc`.
    pub async fn set_pod(&self, pod: &str, fsvc: &FuncSvc) -> FissionResult<()> {
        let (reply, rx) = oneshot::channel();
        self.call(Request::SetPod(pod.to_string(), Box::new(fsvc.clone()), reply), rx)
            .await
    }

    pub async fn pod_to_fsvc(&self, pod: &str) -> FissionResult<Option<FuncSvc>> {
        let (reply, rx) = oneshot::channel();
        self.call(Request::Pod(pod.to_string(), reply), rx).await
    }

    pub async fn remove_pod(&self, pod: &str) -> FissionResult<Option<FuncSvc>> {
        let (reply, rx) = oneshot::channel();
        self.call(Request::RemovePod(pod.to_string(), reply), rx).await
    }

    /// Pool pods hosting any revision of function `uid`.
    pub async fn pods_of(&self, uid: &str) -> FissionResult<Vec<(String, FuncSvc)>> {
        let (reply, rx) = oneshot::channel();
        self.call(Request::PodsOf(uid.to_string(), reply), rx).await
    }

    /// Log every cached service with its backing objects.
    pub async fn log(&self) -> FissionResult<()> {
        let (reply, rx) = oneshot::channel();
        let lines = self.call(Request::Dump(reply), rx).await?;
        info!(item_count = lines.len(), cache = ?lines, "function service cache");
        Ok(())
    }

    async fn call<T>(&self, req: Request, rx: oneshot::Receiver<T>) -> FissionResult<T> {
        self.tx.send(req).await.map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }
}

impl Default for FunctionServiceCache {
    fn default() -> Self {
        Self::new()
    }
}

fn stopped() -> FissionError {
    FissionError::internal("function service cache worker stopped")
}

async fn service(mut rx: mpsc::Receiver<Request>) {
    let mut state = State::default();

    while let Some(req) = rx.recv().await {
        match req {
            Request::Add(fsvc, reply) => {
                let mut fsvc = *fsvc;
                let key = fsvc.key();
                if let Some(existing) = state.touch_key(&key) {
                    let _ = reply.send(Some(existing));
                    continue;
                }
                let now = Instant::now();
                fsvc.ctime = now;
                fsvc.atime = now;
                state.by_address.entry(fsvc.address.clone()).or_insert_with(|| key.clone());
                state
                    .by_uid
                    .entry(fsvc.function.uid.clone())
                    .or_insert_with(|| key.clone());
                debug!(%key, address = %fsvc.address, "function service cached");
                state.by_function.insert(key, fsvc);
                let _ = reply.send(None);
            }
            Request::ByKey(key, reply) => {
                let _ = reply.send(state.touch_key(&key));
            }
            Request::ByUid(uid, reply) => {
                let found = state.by_uid.get(&uid).cloned().and_then(|key| state.touch_key(&key));
                let _ = reply.send(found);
            }
            Request::Touch(address, reply) => {
                let found = state
                    .by_address
                    .get(&address)
                    .cloned()
                    .and_then(|key| state.touch_key(&key));
                let _ = reply.send(found.is_some());
            }
            Request::Delete(fsvc, reply) => {
                state.remove(&fsvc);
                let _ = reply.send(());
            }
            Request::DeleteOld(fsvc, min_age, reply) => {
                let atime = state
                    .by_function
                    .get(&fsvc.key())
                    .map_or(fsvc.atime, |cached| cached.atime);
                let old = atime.elapsed() >= min_age;
                if old {
                    state.remove(&fsvc);
                }
                let _ = reply.send(old);
            }
            Request::ListOld(age, reply) => {
                let old = state
                    .by_function
                    .values()
                    .filter(|f| f.atime.elapsed() > age)
                    .cloned()
                    .collect();
                let _ = reply.send(old);
            }
            Request::SetPod(pod, fsvc, reply) => {
                state.pods.insert(pod, *fsvc);
                let _ = reply.send(());
            }
            Request::Pod(pod, reply) => {
                let _ = reply.send(state.pods.get(&pod).cloned());
            }
            Request::RemovePod(pod, reply) => {
                let _ = reply.send(state.pods.remove(&pod));
            }
            Request::PodsOf(uid, reply) => {
                let pods = state
                    .pods
                    .iter()
                    .filter(|(_, f)| f.function.uid == uid)
                    .map(|(p, f)| (p.clone(), f.clone()))
                    .collect();
                let _ = reply.send(pods);
            }
            Request::Dump(reply) => {
                let lines = state
                    .by_function
                    .iter()
                    .flat_map(|(key, f)| {
                        f.kube_objects
                            .iter()
                            .map(move |o| format!("{key}\t{}\t{}", o.kind, o.name))
                    })
                    .collect();
                let _ = reply.send(lines);
            }
        }
    }
}
