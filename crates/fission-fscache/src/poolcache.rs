//! Admission serializer for pool-managed functions.
//!
//! # Architecture
//!
//! One worker task owns a map of [`FunctionKey`] → group. A group holds the
//! specialized pods of one function revision (in insertion order), the
//! number of specializations in flight, and a FIFO of parked requests.
//! Every public method sends one request and awaits its reply, so all reads,
//! writes and queue pops are totally ordered.
//!
//! Admission on [`PoolCache::admit`]:
//!
//! 1. The first pod with a free request slot (and CPU usage within its
//!    limit) is taken.
//! 2. Otherwise the request parks when slots that pods or specializations
//!    will provide are still unclaimed:
//!    `capacity = (pods + specializing) × requestsPerPod − (active + specializing + waiters)`.
//!    The owner of an in-flight specialization counts as active.
//! 3. Otherwise, if `pods + specializing < concurrency`, the caller gets
//!    `NotFound` and is expected to start a specialization.
//! 4. Otherwise, for multi-request pods, the request parks as backlog as
//!    long as the outstanding work stays under twice the slot count.
//! 5. Otherwise the request is rejected with `TooManyRequests`.
//!
//! Parked requests are released FIFO by [`PoolCache::set_svc_value`] and
//! [`PoolCache::mark_available`]. A parked request whose receiver was
//! dropped (its caller went away) is skipped and discarded.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Write as _;
use std::time::Duration;

use fission_core::{FissionError, FissionResult, FunctionKey};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::funcsvc::FuncSvc;

const REQUEST_BUFFER: usize = 1024;

// ── Public types ───────────────────────────────────────────────────

/// Outcome of a successful admission.
#[derive(Debug)]
pub enum Admission {
    /// A request slot on a specialized pod was reserved.
    Ready(FuncSvc),
    /// The request is parked; await the handle.
    Wait(SvcWait),
}

/// Handle for a parked request. Dropping it abandons the wait.
#[derive(Debug)]
pub struct SvcWait {
    rx: oneshot::Receiver<FissionResult<FuncSvc>>,
}

impl SvcWait {
    /// Wait until a slot is handed over or the wait is failed.
    pub async fn wait(self) -> FissionResult<FuncSvc> {
        self.rx
            .await
            .map_err(|_| FissionError::internal("pool cache dropped a parked request"))?
    }
}

/// Counters of one group, for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupStats {
    pub pods: usize,
    pub specializing: u32,
    pub waiters: usize,
    pub active: u32,
    pub deleted: bool,
}

// ── Worker state ───────────────────────────────────────────────────

struct Waiter {
    tx: oneshot::Sender<FissionResult<FuncSvc>>,
}

struct SvcRecord {
    fsvc: FuncSvc,
    active: u32,
    cpu_usage: u64,
    cpu_limit: u64,
}

impl SvcRecord {
    fn cpu_ok(&self) -> bool {
        self.cpu_limit == 0 || self.cpu_usage <= self.cpu_limit
    }

    fn has_slot(&self, requests_per_pod: u32) -> bool {
        self.active < requests_per_pod && self.cpu_ok()
    }

    fn atime_touch(&mut self) {
        self.fsvc.atime = Instant::now();
    }
}

struct Group {
    svcs: Vec<SvcRecord>,
    specializing: u32,
    waiters: VecDeque<Waiter>,
    requests_per_pod: u32,
    retain: u32,
    deleted: bool,
}

impl Group {
    fn new() -> Self {
        Self {
            svcs: Vec::new(),
            specializing: 0,
            waiters: VecDeque::new(),
            requests_per_pod: 1,
            retain: 0,
            deleted: false,
        }
    }

    fn prune_waiters(&mut self) {
        self.waiters.retain(|w| !w.tx.is_closed());
    }

    fn active(&self) -> u32 {
        self.svcs.iter().map(|s| s.active).sum()
    }

    /// Slots on pods under their CPU limit plus slots promised by
    /// in-flight specializations.
    fn slots(&self) -> usize {
        let usable = self.svcs.iter().filter(|s| s.cpu_ok()).count();
        (usable + self.specializing as usize) * self.requests_per_pod as usize
    }

    /// Requests holding a usable slot, owning a specialization, or parked.
    fn outstanding(&self) -> usize {
        self.busy() + self.waiters.len()
    }

    fn busy(&self) -> usize {
        let active: u32 = self.svcs.iter().filter(|s| s.cpu_ok()).map(|s| s.active).sum();
        active as usize + self.specializing as usize
    }

    /// Waiters this group can still be expected to serve.
    fn waiter_limit(&self) -> usize {
        let factor = if self.requests_per_pod > 1 { 2 } else { 1 };
        (self.slots() * factor).saturating_sub(self.busy())
    }

    fn position(&self, address: &str) -> Option<usize> {
        self.svcs.iter().position(|s| s.fsvc.address == address)
    }

    /// Hand up to `budget` slots of record `idx` to parked requests, FIFO.
    fn release_waiters(&mut self, idx: usize, budget: usize) -> usize {
        let mut delivered = 0;
        while delivered < budget {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            let record = &mut self.svcs[idx];
            record.atime_touch();
            if waiter.tx.send(Ok(record.fsvc.clone())).is_ok() {
                record.active += 1;
                delivered += 1;
            }
        }
        delivered
    }

    fn stats(&self) -> GroupStats {
        GroupStats {
            pods: self.svcs.len(),
            specializing: self.specializing,
            waiters: self.waiters.len(),
            active: self.active(),
            deleted: self.deleted,
        }
    }
}

enum Request {
    Admit {
        key: FunctionKey,
        requests_per_pod: u32,
        concurrency: u32,
        reply: oneshot::Sender<FissionResult<Admission>>,
    },
    Set {
        key: FunctionKey,
        fsvc: Box<FuncSvc>,
        cpu_limit: u64,
        requests_per_pod: u32,
        retain: u32,
        reply: oneshot::Sender<FissionResult<()>>,
    },
    SpecializationStart {
        key: FunctionKey,
        concurrency: u32,
        reply: oneshot::Sender<FissionResult<()>>,
    },
    SpecializationEnd {
        key: FunctionKey,
        reply: oneshot::Sender<()>,
    },
    SpecializationFailure {
        key: FunctionKey,
        error: FissionError,
        reply: oneshot::Sender<()>,
    },
    MarkAvailable {
        key: FunctionKey,
        address: String,
        reply: oneshot::Sender<()>,
    },
    Touch {
        key: FunctionKey,
        address: String,
        reply: oneshot::Sender<FissionResult<()>>,
    },
    SetCpuUtilization {
        key: FunctionKey,
        address: String,
        usage: u64,
        reply: oneshot::Sender<()>,
    },
    ListAvailable {
        reply: oneshot::Sender<Vec<FuncSvc>>,
    },
    Delete {
        key: FunctionKey,
        address: String,
        reply: oneshot::Sender<()>,
    },
    DeleteIdle {
        key: FunctionKey,
        address: String,
        min_idle: Duration,
        reply: oneshot::Sender<bool>,
    },
    MarkDeleted {
        uid: String,
        reply: oneshot::Sender<()>,
    },
    Stats {
        key: FunctionKey,
        reply: oneshot::Sender<Option<GroupStats>>,
    },
    Dump {
        reply: oneshot::Sender<String>,
    },
}

// ── Handle ─────────────────────────────────────────────────────────

/// Handle to the pool cache worker. Cheap to clone.
#[derive(Clone)]
pub struct PoolCache {
    tx: mpsc::Sender<Request>,
}

impl PoolCache {
    /// Spawn the worker. Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(REQUEST_BUFFER);
        tokio::spawn(service(rx));
        Self { tx }
    }

    /// Run admission for one request. `NotFound` means the caller should
    /// specialize a new pod; `TooManyRequests` means the function is at its
    /// concurrency limit.
    pub async fn admit(
        &self,
        key: &FunctionKey,
        requests_per_pod: u32,
        concurrency: u32,
    ) -> FissionResult<Admission> {
        let (reply, rx) = oneshot::channel();
        self.call(
            Request::Admit {
                key: key.clone(),
                requests_per_pod: requests_per_pod.max(1),
                concurrency,
                reply,
            },
            rx,
        )
        .await?
    }

    /// Admission followed by waiting on the parked handle, if any. Dropping
    /// the returned future abandons the wait.
    pub async fn get_svc_value(
        &self,
        key: &FunctionKey,
        requests_per_pod: u32,
        concurrency: u32,
    ) -> FissionResult<FuncSvc> {
        match self.admit(key, requests_per_pod, concurrency).await? {
            Admission::Ready(fsvc) => Ok(fsvc),
            Admission::Wait(handle) => handle.wait().await,
        }
    }

    /// Publish a specialized pod and reserve one of its slots for the
    /// publishing request. Parked requests take the remaining slots.
    pub async fn set_svc_value(
        &self,
        key: &FunctionKey,
        fsvc: FuncSvc,
        cpu_limit: u64,
        requests_per_pod: u32,
        retain: u32,
    ) -> FissionResult<()> {
        let (reply, rx) = oneshot::channel();
        self.call(
            Request::Set {
                key: key.clone(),
                fsvc: Box::new(fsvc),
                cpu_limit,
                requests_per_pod: requests_per_pod.max(1),
                retain,
                reply,
            },
            rx,
        )
        .await?
    }

    /// Claim a specialization slot under `concurrency`.
    pub async fn specialization_start(&self, key: &FunctionKey, concurrency: u32) -> FissionResult<()> {
        let (reply, rx) = oneshot::channel();
        self.call(
            Request::SpecializationStart {
                key: key.clone(),
                concurrency,
                reply,
            },
            rx,
        )
        .await?
    }

    pub async fn specialization_end(&self, key: &FunctionKey) -> FissionResult<()> {
        let (reply, rx) = oneshot::channel();
        self.call(Request::SpecializationEnd { key: key.clone(), reply }, rx)
            .await
    }

    /// End a specialization that never published. Parked requests the group
    /// can no longer serve receive `error`.
    pub async fn mark_specialization_failure(&self, key: &FunctionKey, error: FissionError) -> FissionResult<()> {
        let (reply, rx) = oneshot::channel();
        self.call(
            Request::SpecializationFailure {
                key: key.clone(),
                error,
                reply,
            },
            rx,
        )
        .await
    }

    /// Release one request slot on `address`. An unknown address is logged.
    pub async fn mark_available(&self, key: &FunctionKey, address: &str) -> FissionResult<()> {
        let (reply, rx) = oneshot::channel();
        self.call(
            Request::MarkAvailable {
                key: key.clone(),
                address: address.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    /// Refresh the access time of `address`.
    pub async fn touch(&self, key: &FunctionKey, address: &str) -> FissionResult<()> {
        let (reply, rx) = oneshot::channel();
        self.call(
            Request::Touch {
                key: key.clone(),
                address: address.to_string(),
                reply,
            },
            rx,
        )
        .await?
    }

    pub async fn set_cpu_utilization(&self, key: &FunctionKey, address: &str, usage_millis: u64) -> FissionResult<()> {
        let (reply, rx) = oneshot::channel();
        self.call(
            Request::SetCpuUtilization {
                key: key.clone(),
                address: address.to_string(),
                usage: usage_millis,
                reply,
            },
            rx,
        )
        .await
    }

    /// Idle services beyond each group's retain quota.
    pub async fn list_available_value(&self) -> FissionResult<Vec<FuncSvc>> {
        let (reply, rx) = oneshot::channel();
        self.call(Request::ListAvailable { reply }, rx).await
    }

    pub async fn delete_value(&self, key: &FunctionKey, address: &str) -> FissionResult<()> {
        let (reply, rx) = oneshot::channel();
        self.call(
            Request::Delete {
                key: key.clone(),
                address: address.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    /// Remove `address` only if it serves no request and has been idle for
    /// at least `min_idle`. Returns whether it was removed.
    pub async fn delete_if_idle(&self, key: &FunctionKey, address: &str, min_idle: Duration) -> FissionResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.call(
            Request::DeleteIdle {
                key: key.clone(),
                address: address.to_string(),
                min_idle,
                reply,
            },
            rx,
        )
        .await
    }

    /// Mark every group of function `uid` deleted: no further inserts, and
    /// its pods stop counting towards the retain quota.
    pub async fn mark_func_deleted(&self, uid: &str) -> FissionResult<()> {
        let (reply, rx) = oneshot::channel();
        self.call(
            Request::MarkDeleted {
                uid: uid.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn stats(&self, key: &FunctionKey) -> FissionResult<Option<GroupStats>> {
        let (reply, rx) = oneshot::channel();
        self.call(Request::Stats { key: key.clone(), reply }, rx).await
    }

    /// Text dump of every group, one line per group and per pod.
    pub async fn log_dump(&self) -> FissionResult<String> {
        let (reply, rx) = oneshot::channel();
        self.call(Request::Dump { reply }, rx).await
    }

    async fn call<T>(&self, req: Request, rx: oneshot::Receiver<T>) -> FissionResult<T> {
        self.tx.send(req).await.map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }
}

impl Default for PoolCache {
    fn default() -> Self {
        Self::new()
    }
}

fn stopped() -> FissionError {
    FissionError::internal("pool cache worker stopped")
}

// ── Worker ─────────────────────────────────────────────────────────

async fn service(mut rx: mpsc::Receiver<Request>) {
    let mut groups: HashMap<FunctionKey, Group> = HashMap::new();

    while let Some(req) = rx.recv().await {
        match req {
            Request::Admit {
                key,
                requests_per_pod,
                concurrency,
                reply,
            } => {
                let result = admit(&mut groups, &key, requests_per_pod, concurrency);
                if let Err(Ok(Admission::Ready(fsvc))) = reply.send(result) {
                    // Caller left before the reply; give the slot back.
                    release(&mut groups, &key, &fsvc.address);
                }
            }
            Request::Set {
                key,
                fsvc,
                cpu_limit,
                requests_per_pod,
                retain,
                reply,
            } => {
                let _ = reply.send(set_value(&mut groups, &key, *fsvc, cpu_limit, requests_per_pod, retain));
            }
            Request::SpecializationStart { key, concurrency, reply } => {
                let group = groups.entry(key.clone()).or_insert_with(Group::new);
                let in_use = group.svcs.len() + group.specializing as usize;
                let result = if concurrency > 0 && in_use >= concurrency as usize {
                    Err(FissionError::too_many_requests(format!(
                        "function '{key}' concurrency '{concurrency}' limit reached"
                    )))
                } else {
                    group.specializing += 1;
                    debug!(%key, specializing = group.specializing, "specialization started");
                    Ok(())
                };
                let _ = reply.send(result);
            }
            Request::SpecializationEnd { key, reply } => {
                if let Some(group) = groups.get_mut(&key) {
                    group.specializing = group.specializing.saturating_sub(1);
                }
                let _ = reply.send(());
            }
            Request::SpecializationFailure { key, error, reply } => {
                if let Some(group) = groups.get_mut(&key) {
                    group.specializing = group.specializing.saturating_sub(1);
                    group.prune_waiters();
                    let limit = group.waiter_limit();
                    let mut failed = 0;
                    while group.waiters.len() > limit {
                        if let Some(waiter) = group.waiters.pop_back() {
                            let _ = waiter.tx.send(Err(error.clone()));
                            failed += 1;
                        }
                    }
                    warn!(%key, failed, error = %error, "specialization failed");
                }
                let _ = reply.send(());
            }
            Request::MarkAvailable { key, address, reply } => {
                release(&mut groups, &key, &address);
                let _ = reply.send(());
            }
            Request::Touch { key, address, reply } => {
                let _ = reply.send(touch(&mut groups, &key, &address));
            }
            Request::SetCpuUtilization {
                key,
                address,
                usage,
                reply,
            } => {
                let group = groups.entry(key).or_insert_with(Group::new);
                if let Some(idx) = group.position(&address) {
                    group.svcs[idx].cpu_usage = usage;
                }
                let _ = reply.send(());
            }
            Request::ListAvailable { reply } => {
                let _ = reply.send(list_available(&groups));
            }
            Request::Delete { key, address, reply } => {
                remove(&mut groups, &key, &address);
                let _ = reply.send(());
            }
            Request::DeleteIdle {
                key,
                address,
                min_idle,
                reply,
            } => {
                let now = Instant::now();
                let idle = groups
                    .get(&key)
                    .and_then(|g| g.position(&address).map(|idx| &g.svcs[idx]))
                    .is_some_and(|s| s.active == 0 && s.fsvc.idle_for(now) >= min_idle);
                if idle {
                    remove(&mut groups, &key, &address);
                }
                let _ = reply.send(idle);
            }
            Request::MarkDeleted { uid, reply } => {
                for (key, group) in groups.iter_mut().filter(|(k, _)| k.uid == uid) {
                    group.deleted = true;
                    debug!(%key, "function group marked deleted");
                }
                let _ = reply.send(());
            }
            Request::Stats { key, reply } => {
                let _ = reply.send(groups.get(&key).map(Group::stats));
            }
            Request::Dump { reply } => {
                let _ = reply.send(dump(&groups));
            }
        }
    }
}

fn admit(
    groups: &mut HashMap<FunctionKey, Group>,
    key: &FunctionKey,
    requests_per_pod: u32,
    concurrency: u32,
) -> FissionResult<Admission> {
    let Some(group) = groups.get_mut(key) else {
        groups.insert(key.clone(), Group::new());
        return Err(FissionError::not_found(format!("function '{key}' not found")));
    };
    group.requests_per_pod = requests_per_pod;
    group.prune_waiters();

    if let Some(record) = group.svcs.iter_mut().find(|s| s.has_slot(requests_per_pod)) {
        record.active += 1;
        record.atime_touch();
        debug!(%key, address = %record.fsvc.address, active = record.active, "slot reserved");
        return Ok(Admission::Ready(record.fsvc.clone()));
    }

    let slots = group.slots();
    let outstanding = group.outstanding();
    let in_use = group.svcs.len() + group.specializing as usize;
    let park = if outstanding < slots {
        true
    } else if concurrency == 0 || in_use < concurrency as usize {
        return Err(FissionError::not_found(format!("function '{key}' all pods are busy")));
    } else {
        requests_per_pod > 1 && outstanding < 2 * slots
    };

    if !park {
        return Err(FissionError::too_many_requests(format!(
            "function '{key}' concurrency '{concurrency}' limit reached"
        )));
    }

    let (tx, rx) = oneshot::channel();
    group.waiters.push_back(Waiter { tx });
    debug!(%key, waiters = group.waiters.len(), "request parked");
    Ok(Admission::Wait(SvcWait { rx }))
}

fn set_value(
    groups: &mut HashMap<FunctionKey, Group>,
    key: &FunctionKey,
    mut fsvc: FuncSvc,
    cpu_limit: u64,
    requests_per_pod: u32,
    retain: u32,
) -> FissionResult<()> {
    let group = groups.entry(key.clone()).or_insert_with(Group::new);
    if group.deleted {
        return Err(FissionError::not_found(format!("function '{key}' was deleted")));
    }
    group.requests_per_pod = requests_per_pod;
    group.retain = retain;
    group.prune_waiters();

    fsvc.atime = Instant::now();
    let address = fsvc.address.clone();
    let idx = match group.position(&address) {
        Some(idx) => {
            group.svcs[idx].fsvc = fsvc;
            idx
        }
        None => {
            group.svcs.push(SvcRecord {
                fsvc,
                active: 0,
                cpu_usage: 0,
                cpu_limit,
            });
            group.svcs.len() - 1
        }
    };
    let record = &mut group.svcs[idx];
    record.active += 1;
    record.cpu_limit = cpu_limit;

    let free = requests_per_pod.saturating_sub(record.active) as usize;
    let budget = free.min(group.waiters.len());
    let delivered = group.release_waiters(idx, budget);
    debug!(%key, %address, active = group.svcs[idx].active, delivered, "function service published");
    Ok(())
}

fn release(groups: &mut HashMap<FunctionKey, Group>, key: &FunctionKey, address: &str) {
    let Some(group) = groups.get_mut(key) else {
        warn!(%key, address, "release for unknown function");
        return;
    };
    let Some(idx) = group.position(address) else {
        warn!(%key, address, "release for unknown address");
        return;
    };
    let record = &mut group.svcs[idx];
    if record.active == 0 {
        warn!(%key, address, "release with no active requests");
        return;
    }
    record.active -= 1;
    record.atime_touch();
    group.prune_waiters();
    if group.svcs[idx].has_slot(group.requests_per_pod) {
        group.release_waiters(idx, 1);
    }
    debug!(%key, address, active = group.svcs[idx].active, "slot released");
}

fn remove(groups: &mut HashMap<FunctionKey, Group>, key: &FunctionKey, address: &str) {
    if let Some(group) = groups.get_mut(key) {
        group.svcs.retain(|s| s.fsvc.address != address);
        if group.deleted && group.svcs.is_empty() {
            groups.remove(key);
            debug!(%key, "deleted function group removed");
        }
    }
}

fn touch(groups: &mut HashMap<FunctionKey, Group>, key: &FunctionKey, address: &str) -> FissionResult<()> {
    let Some(group) = groups.get_mut(key) else {
        return Err(FissionError::not_found(format!("function '{key}' not found")));
    };
    let Some(idx) = group.position(address) else {
        return Err(FissionError::not_found(format!(
            "function service {address} of '{key}' not found"
        )));
    };
    group.svcs[idx].atime_touch();
    Ok(())
}

fn list_available(groups: &HashMap<FunctionKey, Group>) -> Vec<FuncSvc> {
    let mut latest: HashMap<&str, i64> = HashMap::new();
    for key in groups.keys() {
        let entry = latest.entry(key.uid.as_str()).or_insert(key.generation);
        *entry = (*entry).max(key.generation);
    }

    let mut out = Vec::new();
    for (key, group) in groups {
        let retain = if group.deleted || latest.get(key.uid.as_str()) != Some(&key.generation) {
            0
        } else {
            group.retain as usize
        };
        let quota = group.svcs.len().saturating_sub(retain);
        if quota == 0 {
            continue;
        }
        let mut idle: Vec<&SvcRecord> = group.svcs.iter().filter(|s| s.active == 0).collect();
        idle.sort_by_key(|s| s.fsvc.atime);
        out.extend(idle.into_iter().take(quota).map(|s| s.fsvc.clone()));
    }
    out
}

fn dump(groups: &HashMap<FunctionKey, Group>) -> String {
    let ordered: BTreeMap<&FunctionKey, &Group> = groups.iter().collect();
    let mut out = String::new();
    for (key, group) in ordered {
        let _ = writeln!(
            out,
            "function:{key}\tspecializing:{}\twaiters:{}\tretain:{}\tdeleted:{}",
            group.specializing,
            group.waiters.len(),
            group.retain,
            group.deleted
        );
        for svc in &group.svcs {
            let _ = writeln!(
                out,
                "\tfunction_name:{}\taddress:{}\tactive_req:{}\tcpu_usage:{}m\tcpu_limit:{}m",
                svc.fsvc.function.name, svc.fsvc.address, svc.active, svc.cpu_usage, svc.cpu_limit
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fission_core::{Environment, ErrorCode, ExecutorType, ObjectMeta};

    use super::*;

    fn meta(uid: &str, generation: i64) -> ObjectMeta {
        let mut meta = ObjectMeta::new("default", "hello");
        meta.uid = uid.to_string();
        meta.resource_version = "1".into();
        meta.generation = generation;
        meta
    }

    fn fsvc(meta: &ObjectMeta, address: &str) -> FuncSvc {
        FuncSvc::new(meta.clone(), Environment::default(), address.to_string(), ExecutorType::Poolmgr)
    }

    fn expect_ready(admission: Admission) -> FuncSvc {
        match admission {
            Admission::Ready(fsvc) => fsvc,
            Admission::Wait(_) => panic!("expected a reserved slot"),
        }
    }

    fn expect_wait(admission: Admission) -> SvcWait {
        match admission {
            Admission::Wait(handle) => handle,
            Admission::Ready(fsvc) => panic!("expected to park, got {}", fsvc.address),
        }
    }

    /// Drive one specialization the way the executor does and return the
    /// owner's service.
    async fn publish(cache: &PoolCache, m: &ObjectMeta, address: &str, rpp: u32, concurrency: u32) {
        let key = FunctionKey::from_meta(m);
        cache.specialization_start(&key, concurrency).await.unwrap();
        cache.set_svc_value(&key, fsvc(m, address), 0, rpp, 0).await.unwrap();
        cache.specialization_end(&key).await.unwrap();
    }

    #[tokio::test]
    async fn first_request_creates_group_and_misses() {
        let cache = PoolCache::new();
        let key = FunctionKey::from_meta(&meta("u1", 1));
        let err = cache.admit(&key, 1, 1).await.unwrap_err();
        assert!(err.is(ErrorCode::NotFound));
        let stats = cache.stats(&key).await.unwrap().unwrap();
        assert_eq!(stats, GroupStats::default());
    }

    #[tokio::test]
    async fn published_value_is_returned() {
        let cache = PoolCache::new();
        let m = meta("u1", 1);
        let key = FunctionKey::from_meta(&m);
        cache.admit(&key, 2, 1).await.unwrap_err();
        publish(&cache, &m, "10.0.0.5:8888", 2, 1).await;

        let got = expect_ready(cache.admit(&key, 2, 1).await.unwrap());
        assert_eq!(got.address, "10.0.0.5:8888");
        let stats = cache.stats(&key).await.unwrap().unwrap();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.pods, 1);
    }

    #[tokio::test]
    async fn slot_cap_per_pod_and_concurrency_limit() {
        let cache = PoolCache::new();
        let m = meta("u1", 1);
        let key = FunctionKey::from_meta(&m);
        cache.admit(&key, 1, 1).await.unwrap_err();
        publish(&cache, &m, "10.0.0.5:8888", 1, 1).await;

        let err = cache.admit(&key, 1, 1).await.unwrap_err();
        assert!(err.is(ErrorCode::TooManyRequests));
        let err = cache.specialization_start(&key, 1).await.unwrap_err();
        assert!(err.is(ErrorCode::TooManyRequests));
    }

    #[tokio::test]
    async fn busy_pods_under_concurrency_ask_for_specialization() {
        let cache = PoolCache::new();
        let m = meta("u1", 1);
        let key = FunctionKey::from_meta(&m);
        cache.admit(&key, 1, 3).await.unwrap_err();
        publish(&cache, &m, "10.0.0.5:8888", 1, 3).await;

        let err = cache.admit(&key, 1, 3).await.unwrap_err();
        assert!(err.is(ErrorCode::NotFound));
    }

    #[tokio::test]
    async fn waiters_share_a_specializing_pod() {
        let cache = PoolCache::new();
        let m = meta("u1", 1);
        let key = FunctionKey::from_meta(&m);
        cache.admit(&key, 3, 1).await.unwrap_err();
        cache.specialization_start(&key, 1).await.unwrap();

        let w1 = expect_wait(cache.admit(&key, 3, 1).await.unwrap());
        let w2 = expect_wait(cache.admit(&key, 3, 1).await.unwrap());

        cache
            .set_svc_value(&key, fsvc(&m, "10.0.0.5:8888"), 0, 3, 0)
            .await
            .unwrap();
        cache.specialization_end(&key).await.unwrap();

        assert_eq!(w1.wait().await.unwrap().address, "10.0.0.5:8888");
        assert_eq!(w2.wait().await.unwrap().address, "10.0.0.5:8888");
        let stats = cache.stats(&key).await.unwrap().unwrap();
        assert_eq!(stats.active, 3);
        assert_eq!(stats.waiters, 0);
    }

    #[tokio::test]
    async fn backlog_waiters_released_by_mark_available_in_order() {
        let cache = PoolCache::new();
        let m = meta("u1", 1);
        let key = FunctionKey::from_meta(&m);
        cache.admit(&key, 2, 1).await.unwrap_err();
        publish(&cache, &m, "10.0.0.5:8888", 2, 1).await;
        expect_ready(cache.admit(&key, 2, 1).await.unwrap());

        let first = expect_wait(cache.admit(&key, 2, 1).await.unwrap());
        let second = expect_wait(cache.admit(&key, 2, 1).await.unwrap());
        let err = cache.admit(&key, 2, 1).await.unwrap_err();
        assert!(err.is(ErrorCode::TooManyRequests), "backlog is bounded");

        cache.mark_available(&key, "10.0.0.5:8888").await.unwrap();
        first.wait().await.unwrap();
        let stats = cache.stats(&key).await.unwrap().unwrap();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.waiters, 1);

        cache.mark_available(&key, "10.0.0.5:8888").await.unwrap();
        second.wait().await.unwrap();
    }

    #[tokio::test]
    async fn abandoned_waiter_is_skipped() {
        let cache = PoolCache::new();
        let m = meta("u1", 1);
        let key = FunctionKey::from_meta(&m);
        cache.admit(&key, 3, 1).await.unwrap_err();
        cache.specialization_start(&key, 1).await.unwrap();
        let gone = expect_wait(cache.admit(&key, 3, 1).await.unwrap());
        let kept = expect_wait(cache.admit(&key, 3, 1).await.unwrap());
        drop(gone);

        cache
            .set_svc_value(&key, fsvc(&m, "10.0.0.5:8888"), 0, 3, 0)
            .await
            .unwrap();
        kept.wait().await.unwrap();
        let stats = cache.stats(&key).await.unwrap().unwrap();
        assert_eq!(stats.active, 2, "owner and the live waiter only");
    }

    #[tokio::test]
    async fn mark_available_floors_at_zero() {
        let cache = PoolCache::new();
        let m = meta("u1", 1);
        let key = FunctionKey::from_meta(&m);
        publish(&cache, &m, "10.0.0.5:8888", 1, 1).await;
        for _ in 0..3 {
            cache.mark_available(&key, "10.0.0.5:8888").await.unwrap();
        }
        cache.mark_available(&key, "10.9.9.9:8888").await.unwrap();
        let stats = cache.stats(&key).await.unwrap().unwrap();
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn specialization_failure_fails_unservable_waiters() {
        let cache = PoolCache::new();
        let m = meta("u1", 1);
        let key = FunctionKey::from_meta(&m);
        cache.admit(&key, 2, 1).await.unwrap_err();
        cache.specialization_start(&key, 1).await.unwrap();
        let waiter = expect_wait(cache.admit(&key, 2, 1).await.unwrap());

        cache
            .mark_specialization_failure(&key, FissionError::internal("fetch failed"))
            .await
            .unwrap();
        let err = waiter.wait().await.unwrap_err();
        assert!(err.is(ErrorCode::Internal));
        let stats = cache.stats(&key).await.unwrap().unwrap();
        assert_eq!(stats.specializing, 0);
        assert_eq!(stats.waiters, 0);
    }

    #[tokio::test]
    async fn cpu_over_limit_blocks_the_slot() {
        let cache = PoolCache::new();
        let m = meta("u1", 1);
        let key = FunctionKey::from_meta(&m);
        cache.specialization_start(&key, 2).await.unwrap();
        cache
            .set_svc_value(&key, fsvc(&m, "10.0.0.5:8888"), 850, 4, 0)
            .await
            .unwrap();
        cache.specialization_end(&key).await.unwrap();
        cache.set_cpu_utilization(&key, "10.0.0.5:8888", 900).await.unwrap();

        let err = cache.admit(&key, 4, 2).await.unwrap_err();
        assert!(err.is(ErrorCode::NotFound));
    }

    #[tokio::test]
    async fn list_available_keeps_retained_pods() {
        let cache = PoolCache::new();
        let m = meta("u1", 1);
        let key = FunctionKey::from_meta(&m);
        for i in 0..5 {
            cache.specialization_start(&key, 10).await.unwrap();
            cache
                .set_svc_value(&key, fsvc(&m, &format!("10.0.0.{i}:8888")), 0, 1, 2)
                .await
                .unwrap();
            cache.specialization_end(&key).await.unwrap();
        }
        for i in 0..5 {
            cache.mark_available(&key, &format!("10.0.0.{i}:8888")).await.unwrap();
        }
        assert_eq!(cache.list_available_value().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn stale_generation_and_deleted_groups_retain_nothing() {
        let cache = PoolCache::new();
        let old = meta("u1", 1);
        let new = meta("u1", 2);
        let old_key = FunctionKey::from_meta(&old);
        cache.specialization_start(&old_key, 5).await.unwrap();
        cache
            .set_svc_value(&old_key, fsvc(&old, "10.0.0.1:8888"), 0, 1, 1)
            .await
            .unwrap();
        cache.mark_available(&old_key, "10.0.0.1:8888").await.unwrap();
        publish(&cache, &new, "10.0.0.2:8888", 1, 5).await;
        let new_key = FunctionKey::from_meta(&new);
        cache.mark_available(&new_key, "10.0.0.2:8888").await.unwrap();

        let idle = cache.list_available_value().await.unwrap();
        assert_eq!(idle.len(), 2, "new generation has retain 0 as published");

        cache.mark_func_deleted("u1").await.unwrap();
        let err = cache
            .set_svc_value(&new_key, fsvc(&new, "10.0.0.3:8888"), 0, 1, 1)
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::NotFound));

        cache.delete_value(&new_key, "10.0.0.2:8888").await.unwrap();
        assert!(cache.stats(&new_key).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn touch_refreshes_access_time() {
        let cache = PoolCache::new();
        let m = meta("u1", 1);
        let key = FunctionKey::from_meta(&m);
        publish(&cache, &m, "10.0.0.5:8888", 1, 1).await;
        cache.mark_available(&key, "10.0.0.5:8888").await.unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        let before = cache.list_available_value().await.unwrap()[0].atime;
        cache.touch(&key, "10.0.0.5:8888").await.unwrap();
        let after = cache.list_available_value().await.unwrap()[0].atime;
        assert!(after > before);
        assert!(cache.touch(&key, "10.0.0.6:8888").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn delete_if_idle_spares_busy_and_recent_pods() {
        let cache = PoolCache::new();
        let m = meta("u1", 1);
        let key = FunctionKey::from_meta(&m);
        publish(&cache, &m, "10.0.0.5:8888", 1, 1).await;

        let idle = Duration::from_secs(120);
        assert!(!cache.delete_if_idle(&key, "10.0.0.5:8888", idle).await.unwrap());

        cache.mark_available(&key, "10.0.0.5:8888").await.unwrap();
        assert!(!cache.delete_if_idle(&key, "10.0.0.5:8888", idle).await.unwrap());

        tokio::time::advance(Duration::from_secs(121)).await;
        assert!(cache.delete_if_idle(&key, "10.0.0.5:8888", idle).await.unwrap());
        assert_eq!(cache.stats(&key).await.unwrap().unwrap().pods, 0);
    }

    #[tokio::test]
    async fn dump_lists_groups_and_pods() {
        let cache = PoolCache::new();
        let m = meta("u1", 1);
        publish(&cache, &m, "10.0.0.5:8888", 1, 1).await;
        let text = cache.log_dump().await.unwrap();
        assert!(text.contains("function:u1_1_1"));
        assert!(text.contains("address:10.0.0.5:8888\tactive_req:1"));
    }
}
