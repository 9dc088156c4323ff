#![forbid(unsafe_code)]

pub mod broker;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::broker::ConnectionRegistry;

pub const DEFAULT_HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(30);

pub struct RealtimeRuntime;

impl RealtimeRuntime {
    /// Periodically drops connections whose transport closed without unregistering.
    pub fn spawn_housekeeping(
        registry: Arc<ConnectionRegistry>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {
                        let pruned = registry.prune_closed();
                        if pruned > 0 {
                            tracing::debug!(pruned, "pruned closed realtime connections");
                        }
                    }
                }
            }
        })
    }
}
