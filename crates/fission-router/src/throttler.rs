//! Collapses concurrent address lookups for the same function.
//!
//! The first caller for a key runs its lookup with `first = true`. Callers
//! arriving while that is in flight wait for it to finish and then run
//! their own closure with `first = false`, which normally just reads the
//! address the leader cached. A lock older than the TTL is taken over, and
//! a follower waits at most the TTL.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use fission_core::{FissionError, FissionResult};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

struct Lock {
    id: u64,
    created: Instant,
    done: watch::Receiver<bool>,
}

pub struct Throttler {
    locks: Mutex<HashMap<String, Lock>>,
    ttl: Duration,
    next_id: AtomicU64,
}

/// Removes the caller's lock on every exit path, including cancellation.
struct Release<'a> {
    throttler: &'a Throttler,
    key: &'a str,
    id: u64,
}

impl Drop for Release<'_> {
    fn drop(&mut self) {
        let mut locks = self.throttler.lock();
        if locks.get(self.key).is_some_and(|l| l.id == self.id) {
            locks.remove(self.key);
        }
    }
}

impl Throttler {
    pub fn new(ttl: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            ttl,
            next_id: AtomicU64::new(0),
        }
    }

    pub async fn run_once<T, F, Fut>(&self, key: &str, f: F) -> FissionResult<T>
    where
        F: FnOnce(bool) -> Fut,
        Fut: Future<Output = FissionResult<T>>,
    {
        let waiting = {
            let locks = self.lock();
            match locks.get(key) {
                Some(held) if held.created.elapsed() < self.ttl => Some(held.done.clone()),
                _ => None,
            }
        };

        if let Some(mut done) = waiting {
            debug!(%key, "waiting on in-flight lookup");
            // A leader that went away drops its sender; that also ends the wait.
            let finished = tokio::time::timeout(self.ttl, done.wait_for(|d| *d)).await.is_ok();
            if !finished {
                return Err(FissionError::timeout(format!(
                    "timed out waiting for the address lookup of {key}"
                )));
            }
            return f(false).await;
        }

        let (tx, rx) = watch::channel(false);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(
            key.to_string(),
            Lock {
                id,
                created: Instant::now(),
                done: rx,
            },
        );
        let _release = Release { throttler: self, key, id };

        let result = f(true).await;
        let _ = tx.send(true);
        result
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Lock>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn followers_wait_for_the_leader() {
        let throttler = Arc::new(Throttler::new(Duration::from_secs(30)));
        let leaders = Arc::new(AtomicUsize::new(0));

        let run = |throttler: Arc<Throttler>, leaders: Arc<AtomicUsize>| async move {
            throttler
                .run_once("fn", |first| async move {
                    if first {
                        leaders.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok("leader")
                    } else {
                        Ok("follower")
                    }
                })
                .await
        };

        let (a, b, c) = tokio::join!(
            run(throttler.clone(), leaders.clone()),
            run(throttler.clone(), leaders.clone()),
            run(throttler.clone(), leaders.clone())
        );
        let mut answers = vec![a.unwrap(), b.unwrap(), c.unwrap()];
        answers.sort();
        assert_eq!(answers, ["follower", "follower", "leader"]);
        assert_eq!(leaders.load(Ordering::SeqCst), 1);
        assert!(throttler.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_leader_releases_the_key() {
        let throttler = Throttler::new(Duration::from_secs(30));
        let stuck = throttler.run_once("fn", |_| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        });
        assert!(tokio::time::timeout(Duration::from_millis(10), stuck).await.is_err());

        let first = throttler.run_once("fn", |first| async move { Ok(first) }).await.unwrap();
        assert!(first);
    }
}
