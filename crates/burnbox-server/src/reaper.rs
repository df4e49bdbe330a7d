use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};

use crate::store::Store;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Periodic deletion of expired, unredeemed secrets.
///
/// Redeem already refuses expired records, so a missed sweep only delays
/// reclaiming space.
#[derive(Clone)]
pub struct ExpiryReaper {
    store: Store,
    interval: Duration,
}

impl ExpiryReaper {
    pub fn new(store: Store, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Run one sweep against the current time.
    pub fn sweep_once(&self) -> Result<usize> {
        let removed = self.store.delete_expired(Store::now())?;
        debug!(removed, "expiry sweep finished");
        Ok(removed)
    }

    /// Spawn a background Tokio task that sweeps every `interval`.
    /// Errors are logged and the next tick tries again.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(self.interval);
            ticker.tick().await; // skip first immediate tick
            loop {
                ticker.tick().await;
                let reaper = self.clone();
                // redb calls block; keep them off the async workers.
                match tokio::task::spawn_blocking(move || reaper.sweep_once()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(error = %e, "expiry sweep error"),
                    Err(e) => warn!(error = %e, "expiry sweep task failed"),
                }
            }
        })
    }
}
