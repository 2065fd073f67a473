//! Single-flight creation of function services.
//!
//! # Architecture
//!
//! One task owns the map of in-flight creations keyed by function revision.
//! The first request for a key starts the creation in its own task and
//! becomes the leader; later requests for the same key park as followers.
//! When the creation finishes the leader receives the service, and the
//! followers are told to retry through the cache (or receive the error).
//!
//! A leader whose caller went away does not leak its request slot: the
//! creation task notices the failed reply and releases the slot again.

use std::collections::HashMap;

use fission_core::{FissionError, FissionResult, Function, FunctionKey};
use fission_fscache::FuncSvc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::kind::ExecutorKind;

const REQUEST_BUFFER: usize = 1024;

/// What a creation request resolves to.
#[derive(Debug)]
pub enum Outcome {
    /// This request led the creation and holds the new service.
    Served(FuncSvc),
    /// Another request created the service; look it up again.
    Retry,
}

struct Create {
    kind: ExecutorKind,
    function: Box<Function>,
    reply: oneshot::Sender<FissionResult<Outcome>>,
}

type Done = (FunctionKey, FissionResult<()>);

/// Handle to the dispatcher task. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<Create>,
}

impl Dispatcher {
    /// Spawn the dispatcher. Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(REQUEST_BUFFER);
        tokio::spawn(service(rx));
        Self { tx }
    }

    pub async fn create(&self, kind: ExecutorKind, function: Function) -> FissionResult<Outcome> {
        let (reply, rx) = oneshot::channel();
        let req = Create {
            kind,
            function: Box::new(function),
            reply,
        };
        self.tx.send(req).await.map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn stopped() -> FissionError {
    FissionError::internal("executor dispatcher stopped")
}

async fn service(mut rx: mpsc::Receiver<Create>) {
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Done>();
    let mut inflight: HashMap<FunctionKey, Vec<oneshot::Sender<FissionResult<Outcome>>>> = HashMap::new();

    loop {
        tokio::select! {
            req = rx.recv() => {
                let Some(req) = req else { break };
                let key = req.function.cache_key();
                if let Some(followers) = inflight.get_mut(&key) {
                    debug!(%key, "joining in-flight creation");
                    followers.push(req.reply);
                    continue;
                }
                inflight.insert(key.clone(), Vec::new());
                tokio::spawn(lead(key, req, done_tx.clone()));
            }
            Some((key, result)) = done_rx.recv() => {
                for follower in inflight.remove(&key).unwrap_or_default() {
                    let _ = follower.send(result.clone().map(|()| Outcome::Retry));
                }
            }
        }
    }
}

async fn lead(key: FunctionKey, req: Create, done: mpsc::UnboundedSender<Done>) {
    let Create { kind, function, reply } = req;
    let result = kind.get_func_svc(&function).await;
    let summary = result.as_ref().map(|_| ()).map_err(Clone::clone);

    match result {
        Ok(fsvc) => {
            if let Err(Ok(Outcome::Served(fsvc))) = reply.send(Ok(Outcome::Served(fsvc))) {
                debug!(%key, address = %fsvc.address, "caller went away, releasing new service");
                if let ExecutorKind::Poolmgr(_) = kind {
                    if let Err(e) = kind.un_tap_service(&fsvc.function, &fsvc.address).await {
                        warn!(%key, error = %e, "failed to release abandoned service");
                    }
                }
            }
        }
        Err(e) => {
            let _ = reply.send(Err(e));
        }
    }
    let _ = done.send((key, summary));
}
