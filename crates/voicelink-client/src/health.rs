//! Liveness probing of an established connection.

use crate::connection::Shared;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use voicelink_core::Message;

/// Ping/pong bookkeeping shared by the health monitor and the receive loop.
///
/// A pong clears the failure count whenever it arrives; pings are rare
/// compared to round trips, so no per-ping matching is needed.
#[derive(Debug, Default)]
pub(crate) struct Probe {
    awaiting: AtomicBool,
    failures: AtomicU32,
}

impl Probe {
    /// A ping is about to go out.
    pub fn arm(&self) {
        self.awaiting.store(true, Ordering::SeqCst);
    }

    pub fn pong(&self) {
        self.awaiting.store(false, Ordering::SeqCst);
        self.failures.store(0, Ordering::SeqCst);
    }

    /// Called once the pong deadline passed. Returns the number of
    /// consecutive misses if the last ping went unanswered.
    pub fn settle(&self) -> Option<u32> {
        if self.awaiting.load(Ordering::SeqCst) {
            Some(self.failures.fetch_add(1, Ordering::SeqCst) + 1)
        } else {
            None
        }
    }
}

/// Health monitor for one connection epoch.
///
/// Ends after triggering a reconnect; the next successful connect starts a
/// fresh monitor.
pub(crate) async fn run(shared: Arc<Shared>, epoch: u64, probe: Arc<Probe>) {
    let config = shared.config().health_check.clone();
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires at once; the first ping waits a full interval.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        probe.arm();
        if let Err(e) = shared.send_on(epoch, &Message::ping()).await {
            tracing::debug!("Health check ping not sent: {}", e);
        }
        tokio::time::sleep(config.timeout.min(config.interval)).await;

        let Some(failures) = probe.settle() else {
            continue;
        };
        tracing::warn!(
            "Health check missed a pong ({}/{})",
            failures,
            config.max_failures
        );
        if failures >= config.max_failures {
            tracing::error!("Health check failed {} times in a row, reconnecting", failures);
            shared.link_lost(epoch, format!("no pong after {failures} pings"));
            return;
        }
    }
}
