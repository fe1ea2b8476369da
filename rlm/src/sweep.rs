//! Lazy expiry of leases.
//!
//! Every store operation that reads lease state first sweeps the
//! `(resource, scope)` it touches, so a stale row anywhere else in the table
//! is harmless. The [`Housekeeper`] is an optional periodic whole-table sweep;
//! nothing depends on it for correctness.

use crate::{
    lease::Lease,
    store::LeaseStore,
    time::{Clock, Timestamp},
};
use std::{sync::Arc, time::Duration};
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, info, warn};

/// Whether a row still counts as held at `now`.
pub fn is_still_active(lease: &Lease, now: Timestamp) -> bool {
    lease.is_live(now)
}

/// Tombstones every active row whose expiry has passed. Returns how many
/// rows flipped.
pub fn sweep_rows<'a>(rows: impl IntoIterator<Item = &'a mut Lease>, now: Timestamp) -> usize {
    let mut swept = 0;
    for lease in rows {
        if lease.is_active && !is_still_active(lease, now) {
            lease.is_active = false;
            swept += 1;
        }
    }
    swept
}

/// Periodic background sweep across the whole table.
#[derive(Debug)]
pub struct Housekeeper {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl Housekeeper {
    pub fn spawn(store: Arc<dyn LeaseStore>, clock: Arc<dyn Clock>, interval: Duration) -> Self {
        let shutdown = Arc::new(Notify::new());
        let signal = shutdown.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = signal.notified() => break,
                    _ = ticker.tick() => {}
                }

                match store.sweep_expired(clock.now()).await {
                    Ok(0) => {}
                    Ok(count) => info!("Housekeeping swept {} expired leases", count),
                    Err(e) => warn!("Housekeeping sweep failed: {}", e),
                }
            }
            debug!("Housekeeper stopped");
        });

        Self { shutdown, handle }
    }

    pub async fn stop(self) {
        self.shutdown.notify_one();
        let _ = self.handle.await;
    }
}
