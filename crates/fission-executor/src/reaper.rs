//! Periodic removal of idle function services.

use std::time::Duration;

use tracing::{debug, warn};

use crate::kind::Executors;

/// Run every executor kind's idle reaper each `interval`, forever.
pub async fn run(executors: Executors, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        for kind in executors.all() {
            match kind.reap_idle().await {
                Ok(0) => {}
                Ok(reaped) => debug!(executor = %kind.executor_type(), reaped, "idle services reaped"),
                Err(e) => warn!(executor = %kind.executor_type(), error = %e, "idle reaping failed"),
            }
        }
    }
}
