//! The dispatch loop: turns pending hosts into fetch tasks, at most
//! `num_fetchers` at a time, while the merge side has room.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{Inner, ShuffleScheduler};
use crate::error::{Result, ShuffleError};
use crate::fetch::FetchTask;
use crate::host::MapHostRef;

struct FetchOutcome {
    id: Uuid,
    host: MapHostRef,
    result: Result<()>,
}

/// Holds one fetch slot. Dropping it, also on abort or panic, frees the slot
/// and wakes the dispatch loop.
struct FetchSlot(Arc<Inner>);

impl FetchSlot {
    fn acquire(inner: &Arc<Inner>) -> Self {
        inner.running_fetchers.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(inner))
    }
}

impl Drop for FetchSlot {
    fn drop(&mut self) {
        self.0.running_fetchers.fetch_sub(1, Ordering::SeqCst);
        self.0.state_changed.notify_waiters();
    }
}

impl ShuffleScheduler {
    /// Drive the shuffle until every input is fetched or [`close`] is called.
    ///
    /// Returns `Ok(())` in both cases; an `Err` means waiting on the merge
    /// side failed while the scheduler was still running. Fatal fetch
    /// problems are not returned here, they go to the event sink.
    ///
    /// [`close`]: ShuffleScheduler::close
    pub async fn run(&self) -> Result<()> {
        let mut pool = JoinSet::new();
        let outcome = self.dispatch(&mut pool).await;

        info!(
            source = %self.inner.config.source_name,
            interrupted = self.is_shutdown(),
            remaining = self.remaining_inputs(),
            "Shutting down fetch scheduler"
        );
        pool.shutdown().await;
        outcome
    }

    async fn dispatch(&self, pool: &mut JoinSet<FetchOutcome>) -> Result<()> {
        let inner = &self.inner;

        while !inner.shutdown.is_cancelled() && !self.is_done() {
            // Wait for a free slot and a pending host.
            loop {
                let notified = inner.state_changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if inner.shutdown.is_cancelled() {
                    return Ok(());
                }
                {
                    let state = inner.state.lock();
                    if state.remaining == 0
                        || (self.num_running_fetchers() < inner.num_fetchers
                            && state.registry.has_pending())
                    {
                        break;
                    }
                }

                tokio::select! {
                    biased;

                    _ = inner.shutdown.cancelled() => return Ok(()),

                    Some(joined) = pool.join_next(), if !pool.is_empty() => {
                        self.on_fetch_complete(joined);
                    }

                    _ = &mut notified => {}
                }
            }
            if self.is_done() {
                break;
            }

            debug!(
                running = self.num_running_fetchers(),
                remaining = self.remaining_inputs(),
                "Waiting for merge capacity"
            );
            let merge = Arc::clone(&inner.merge);
            let capacity = async move {
                merge.wait_for_in_memory_merge().await?;
                merge.wait_for_shuffle_to_merge_memory().await
            };
            tokio::select! {
                biased;

                _ = inner.shutdown.cancelled() => return Ok(()),

                result = capacity => {
                    if let Err(e) = result {
                        if inner.shutdown.is_cancelled() {
                            return Ok(());
                        }
                        return Err(e);
                    }
                }
            }

            // Fill the free slots; the pending list may have changed while
            // waiting on the merge side.
            let free = inner
                .num_fetchers
                .saturating_sub(self.num_running_fetchers());
            for _ in 0..free {
                if inner.shutdown.is_cancelled() {
                    return Ok(());
                }
                let host = inner.state.lock().registry.take_pending(Instant::now());
                match host {
                    Some(host) => self.spawn_fetch(pool, host),
                    None => break,
                }
            }
        }
        Ok(())
    }

    fn spawn_fetch(&self, pool: &mut JoinSet<FetchOutcome>, host: MapHostRef) {
        let inner = &self.inner;
        let task = FetchTask {
            id: Uuid::new_v4(),
            attempts: self.get_maps_for_host(&host),
            host,
            params: inner.config.connection_params(),
            cancel: inner.shutdown.child_token(),
        };
        info!(
            fetch_id = %task.id,
            host = %task.host,
            outputs = task.attempts.len(),
            running = self.num_running_fetchers() + 1,
            "Scheduling fetch"
        );

        let slot = FetchSlot::acquire(inner);
        let fetcher = Arc::clone(&inner.fetcher);
        let scheduler = self.clone();
        pool.spawn(async move {
            let _slot = slot;
            let id = task.id;
            let host = task.host.clone();
            let result = if task.attempts.is_empty() {
                // Everything queued on the host was finished or obsolete.
                Ok(())
            } else {
                fetcher.fetch(task, scheduler.clone()).await
            };
            scheduler.free_host(&host);
            FetchOutcome { id, host, result }
        });
    }

    fn on_fetch_complete(&self, joined: std::result::Result<FetchOutcome, JoinError>) {
        let shut_down = self.is_shutdown();
        match joined {
            Ok(FetchOutcome {
                id,
                result: Ok(()),
                ..
            }) => debug!(fetch_id = %id, "Fetch task completed"),
            Ok(FetchOutcome {
                id,
                host,
                result: Err(e),
            }) => {
                if shut_down {
                    info!(fetch_id = %id, error = %e, "Already shut down, ignoring fetch failure");
                } else {
                    error!(fetch_id = %id, host = %host, error = %e, "Fetcher failed");
                    self.report_exception(ShuffleError::Fetcher {
                        host: host.to_string(),
                        message: e.to_string(),
                    });
                }
            }
            Err(_) if shut_down => {}
            Err(e) if e.is_cancelled() => {
                self.report_exception(ShuffleError::Interrupted(e.to_string()));
            }
            Err(e) => {
                self.report_exception(ShuffleError::Fetcher {
                    host: "unknown".to_string(),
                    message: e.to_string(),
                });
            }
        }
    }
}
