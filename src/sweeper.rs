//! Background job: evict expired tokens.
//!
//! Redemption checks expiry on its own, so this only bounds memory.

use std::{sync::Arc, time::Duration};

use tokio::{
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::store::TokenStore;

/// Spawn the sweep task. It stops once `shutdown` is cancelled.
pub fn spawn(
    store: Arc<TokenStore>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let report = store.sweep_expired();
                    if report.expired > 0 || report.tombstones_dropped > 0 {
                        info!(
                            expired = report.expired,
                            tombstones_dropped = report.tombstones_dropped,
                            remaining = store.live_len(),
                            "swept token store"
                        );
                    }
                }
            }
        }

        debug!("token sweeper stopped");
    })
}
