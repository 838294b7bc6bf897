//! Exponential back-off for hosts that failed a fetch.
//!
//! A failed host is penalized for `2s * 1.3^failures`. The referee task sleeps
//! until the earliest penalty matures and then makes the host eligible again.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use fnv::FnvHashMap;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

use super::Inner;

pub const INITIAL_PENALTY: Duration = Duration::from_millis(2000);
pub const PENALTY_GROWTH_RATE: f64 = 1.3;

/// Penalty for a host whose latest attempt has failed `failures` times.
pub fn penalty_delay(failures: u32) -> Duration {
    let millis = INITIAL_PENALTY.as_millis() as f64 * PENALTY_GROWTH_RATE.powi(failures as i32);
    Duration::from_millis(millis as u64)
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Penalty {
    expires_at: Instant,
    host: String,
}

impl Ord for Penalty {
    fn cmp(&self, other: &Self) -> Ordering {
        self.expires_at
            .cmp(&other.expires_at)
            .then_with(|| self.host.cmp(&other.host))
    }
}

impl PartialOrd for Penalty {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Pending penalties, earliest expiry first.
///
/// Penalizing a host again replaces its previous penalty; superseded heap
/// entries are skipped when they surface.
#[derive(Debug, Default)]
pub struct PenaltyQueue {
    heap: BinaryHeap<Reverse<Penalty>>,
    latest: FnvHashMap<String, Instant>,
}

impl PenaltyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, host: &str, expires_at: Instant) {
        self.latest.insert(host.to_string(), expires_at);
        self.heap.push(Reverse(Penalty {
            expires_at,
            host: host.to_string(),
        }));
    }

    /// Expiry of the earliest live penalty.
    pub fn next_expiry(&mut self) -> Option<Instant> {
        while let Some(Reverse(head)) = self.heap.peek() {
            if self.is_live(head) {
                return Some(head.expires_at);
            }
            self.heap.pop();
        }
        None
    }

    /// Remove and return every host whose penalty has matured at `now`.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<String> {
        let mut expired = Vec::new();
        while let Some(Reverse(head)) = self.heap.peek() {
            if head.expires_at > now {
                break;
            }
            let Some(Reverse(penalty)) = self.heap.pop() else {
                break;
            };
            if self.is_live(&penalty) {
                self.latest.remove(&penalty.host);
                expired.push(penalty.host);
            }
        }
        expired
    }

    #[cfg(test)]
    fn is_penalized(&self, host: &str) -> bool {
        self.latest.contains_key(host)
    }

    /// Number of hosts currently serving a penalty.
    #[cfg(test)]
    fn len(&self) -> usize {
        self.latest.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    fn is_live(&self, penalty: &Penalty) -> bool {
        self.latest.get(&penalty.host) == Some(&penalty.expires_at)
    }
}

/// Body of the referee task. Runs until the scheduler shuts down.
pub(super) async fn run_referee(inner: Arc<Inner>) {
    loop {
        let next = inner.state.lock().penalties.next_expiry();
        let matured = async move {
            match next {
                Some(at) => sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;

            _ = inner.shutdown.cancelled() => break,

            _ = inner.penalty_added.notified() => continue,

            _ = matured => {
                let now = Instant::now();
                let released = {
                    let mut state = inner.state.lock();
                    let expired = state.penalties.pop_expired(now);
                    let released = expired
                        .iter()
                        .filter(|host| state.registry.release_penalized(host))
                        .count();
                    released
                };
                trace!(released, "Penalties matured");
                if released > 0 {
                    inner.state_changed.notify_waiters();
                }
            }
        }
    }
    debug!(source = %inner.config.source_name, "Penalty referee stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_by_thirty_percent_per_failure() {
        assert_eq!(penalty_delay(0), Duration::from_millis(2000));
        assert_eq!(penalty_delay(1), Duration::from_millis(2600));
        assert_eq!(penalty_delay(2), Duration::from_millis(3380));
        let expected = (2000.0 * 1.3f64.powi(10)) as u64;
        assert_eq!(penalty_delay(10), Duration::from_millis(expected));
    }

    #[test]
    fn earliest_penalty_matures_first() {
        let start = Instant::now();
        let mut queue = PenaltyQueue::new();
        queue.schedule("b", start + Duration::from_secs(5));
        queue.schedule("a", start + Duration::from_secs(2));

        assert_eq!(queue.next_expiry(), Some(start + Duration::from_secs(2)));
        assert!(queue.pop_expired(start + Duration::from_secs(1)).is_empty());
        assert_eq!(queue.pop_expired(start + Duration::from_secs(3)), vec!["a"]);
        assert_eq!(queue.pop_expired(start + Duration::from_secs(9)), vec!["b"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn repeated_penalties_do_not_stack() {
        let start = Instant::now();
        let mut queue = PenaltyQueue::new();
        queue.schedule("a", start + Duration::from_secs(2));
        queue.schedule("a", start + Duration::from_secs(6));
        assert_eq!(queue.len(), 1);

        // The first penalty was replaced and must not release the host early.
        assert!(queue.pop_expired(start + Duration::from_secs(3)).is_empty());
        assert!(queue.is_penalized("a"));
        assert_eq!(queue.next_expiry(), Some(start + Duration::from_secs(6)));
        assert_eq!(queue.pop_expired(start + Duration::from_secs(6)), vec!["a"]);
        assert!(!queue.is_penalized("a"));
    }
}
