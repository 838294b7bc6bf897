//! The contract between the scheduler and the code that moves bytes.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::host::MapHostRef;
use crate::scheduler::ShuffleScheduler;
use crate::InputAttemptIdentifier;

/// Connection settings shared by every fetch task of a shuffle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionParams {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub keep_alive: bool,
    /// Read outputs of maps on `local_hostname` directly from disk.
    pub local_disk_fetch: bool,
    pub local_hostname: String,
    pub shuffle_port: u16,
}

impl ConnectionParams {
    /// Whether outputs served by `host` can be read from local disk.
    pub fn is_local(&self, host: &MapHostRef) -> bool {
        self.local_disk_fetch
            && host.host_name().eq_ignore_ascii_case(&self.local_hostname)
            && host.port() == Some(self.shuffle_port)
    }
}

/// One unit of work for a [`Fetcher`]: pull `attempts` from `host`.
#[derive(Clone, Debug)]
pub struct FetchTask {
    pub id: Uuid,
    pub host: MapHostRef,
    pub attempts: Vec<InputAttemptIdentifier>,
    pub params: ConnectionParams,
    /// Cancelled when the shuffle shuts down.
    pub cancel: CancellationToken,
}

/// Transfers map outputs from a host.
///
/// Every fetched attempt is reported with [`ShuffleScheduler::copy_succeeded`],
/// a failed one with [`ShuffleScheduler::copy_failed`]. Attempts that were
/// not fetched, failed ones included, go back to the host through
/// [`ShuffleScheduler::put_back_known_map_output`] so they are retried. The
/// pool frees the host once `fetch` returns. An `Err` means the fetcher
/// itself broke and is escalated as fatal.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    async fn fetch(&self, task: FetchTask, scheduler: ShuffleScheduler) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(local_disk_fetch: bool) -> ConnectionParams {
        ConnectionParams {
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
            keep_alive: true,
            local_disk_fetch,
            local_hostname: "worker-7".into(),
            shuffle_port: 13562,
        }
    }

    #[test]
    fn local_fetch_needs_matching_host_and_port() {
        let local = MapHostRef::new("Worker-7:13562", 0);
        let other_port = MapHostRef::new("worker-7:9999", 0);
        let remote = MapHostRef::new("worker-8:13562", 0);

        assert!(params(true).is_local(&local));
        assert!(!params(true).is_local(&other_port));
        assert!(!params(true).is_local(&remote));
        assert!(!params(false).is_local(&local));
    }
}
