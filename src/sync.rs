//! Keeps the in-memory store in step with etcd.
//!
//! The synchronizer is the single owner of store publications: initial load,
//! then a watch loop that parses each change and swaps in a new snapshot.
//! Events carry etcd revisions; anything older than the last published
//! revision is discarded, so a late-delivered event can never roll the view
//! backwards. Watch failures back off briefly and re-subscribe while queries
//! keep being served from the last good snapshot.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::healthcheck::Checker;
use crate::metrics;
use crate::parser::parse_records;
use crate::storage::{Storage, WatchEvent};
use crate::store::HostStore;

/// Delay before re-subscribing after a failed or closed watch stream.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Long-running task that feeds etcd state into the store.
pub struct Synchronizer {
    storage: Arc<dyn Storage>,
    store: HostStore,
    checker: Option<Arc<Checker>>,
    last_revision: i64,
}

impl Synchronizer {
    /// Create a synchronizer publishing into `store` (and, when health
    /// checking is on, refreshing the checker's target set).
    pub fn new(storage: Arc<dyn Storage>, store: HostStore, checker: Option<Arc<Checker>>) -> Self {
        Self {
            storage,
            store,
            checker,
            last_revision: 0,
        }
    }

    /// Run until `cancel` fires: initial load, then the watch loop.
    pub async fn run(mut self, cancel: CancellationToken) {
        // A failed initial load is not fatal. The server keeps answering
        // from whatever it has (an empty view on first boot) and converges
        // once etcd becomes reachable.
        match self.storage.load().await {
            Ok((data, revision)) => self.publish(&data, revision),
            Err(err) => {
                warn!(%err, "initial hosts load failed, serving stale view until sync succeeds");
                metrics::record_sync_error();
            }
        }

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let mut events = match self.storage.watch(cancel.clone()).await {
                Ok(rx) => rx,
                Err(err) => {
                    error!(%err, "etcd watch subscribe failed");
                    metrics::record_sync_error();
                    if !sleep_or_cancel(&cancel, RECONNECT_DELAY).await {
                        break;
                    }
                    continue;
                }
            };

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    event = events.recv() => match event {
                        Some(WatchEvent::Changed { data, revision }) => {
                            self.handle_change(data, revision).await;
                        }
                        Some(WatchEvent::Error(err)) => {
                            error!(%err, "etcd watch error");
                            metrics::record_sync_error();
                            break;
                        }
                        None => {
                            info!("etcd watch stream ended, re-subscribing");
                            break;
                        }
                    },
                }
            }

            if !sleep_or_cancel(&cancel, RECONNECT_DELAY).await {
                break;
            }
        }
    }

    async fn handle_change(&mut self, data: Option<Vec<u8>>, revision: i64) {
        if revision < self.last_revision {
            warn!(
                revision,
                last_revision = self.last_revision,
                "discarding stale watch event"
            );
            return;
        }

        let (data, revision) = match data {
            Some(data) => (data, revision),
            // Dirty signal: the layout cannot express the change
            // incrementally, so read the whole dataset back.
            None => match self.storage.load().await {
                Ok((data, load_revision)) => (data, load_revision.max(revision)),
                Err(err) => {
                    error!(%err, "reload after watch event failed");
                    metrics::record_sync_error();
                    return;
                }
            },
        };

        self.publish(&data, revision);
    }

    fn publish(&mut self, data: &[u8], revision: i64) {
        let records = parse_records(data);
        if let Some(checker) = &self.checker {
            checker.update_targets(&records);
        }
        self.store.update(records);
        self.last_revision = revision;
        metrics::record_sync_success(self.store.len());
        info!(entries = self.store.len(), revision, "hosts snapshot published");
    }
}

/// Sleep unless cancelled first; returns false on cancellation.
async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
