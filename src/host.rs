use std::fmt;

use tokio::time::Instant;

use crate::utils::host_identifier;
use crate::InputAttemptIdentifier;

// A host starts out `Idle`. It becomes `Pending` as soon as it has outputs to
// serve, `Busy` while a fetch task works on it, and `Penalized` after a failed
// fetch until its penalty expires.
//
// Only `Pending` hosts are handed out to fetch tasks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HostState {
    Idle,
    Pending,
    Busy,
    Penalized,
}

/// A cheap, cloneable handle naming a host. Fetch tasks hold this, never the
/// host entry itself.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MapHostRef {
    identifier: String,
    host_port: String,
    partition_id: u32,
}

impl MapHostRef {
    pub fn new(host_port: impl ToString, partition_id: u32) -> Self {
        let host_port = host_port.to_string();
        Self {
            identifier: host_identifier(&host_port, partition_id),
            host_port,
            partition_id,
        }
    }

    /// Registry key, `host:port/partition`.
    #[inline]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    #[inline]
    pub fn host_port(&self) -> &str {
        &self.host_port
    }

    #[inline]
    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    pub fn host_name(&self) -> &str {
        self.host_port
            .rsplit_once(':')
            .map_or(self.host_port.as_str(), |(host, _)| host)
    }

    pub fn port(&self) -> Option<u16> {
        self.host_port
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
    }
}

impl fmt::Display for MapHostRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identifier)
    }
}

// A producer location together with the outputs it is known to serve.
#[derive(Debug)]
pub struct MapHost {
    handle: MapHostRef,
    state: HostState,
    known_maps: Vec<InputAttemptIdentifier>,
    /// When the current fetch task took the host.
    busy_since: Option<Instant>,
}

impl MapHost {
    pub fn new(handle: MapHostRef) -> Self {
        Self {
            handle,
            state: HostState::Idle,
            known_maps: Vec::new(),
            busy_since: None,
        }
    }

    #[inline]
    pub fn handle(&self) -> &MapHostRef {
        &self.handle
    }

    #[inline]
    pub fn state(&self) -> HostState {
        self.state
    }

    #[inline]
    pub fn num_known_maps(&self) -> usize {
        self.known_maps.len()
    }

    /// Queue an output. An idle host becomes pending; a penalized or busy
    /// host keeps its state and serves the output later.
    pub fn add_known_map(&mut self, attempt: InputAttemptIdentifier) {
        self.known_maps.push(attempt);
        if self.state == HostState::Idle {
            self.state = HostState::Pending;
        }
    }

    pub fn get_and_clear_known_maps(&mut self) -> Vec<InputAttemptIdentifier> {
        std::mem::take(&mut self.known_maps)
    }

    pub fn mark_busy(&mut self, now: Instant) {
        self.state = HostState::Busy;
        self.busy_since = Some(now);
    }

    /// Leave `Busy` or `Penalized`. Returns the new state.
    pub fn mark_available(&mut self) -> HostState {
        self.state = if self.known_maps.is_empty() {
            HostState::Idle
        } else {
            HostState::Pending
        };
        self.state
    }

    pub fn penalize(&mut self) {
        self.state = HostState::Penalized;
    }

    pub fn take_busy_since(&mut self) -> Option<Instant> {
        self.busy_since.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(index: u32) -> InputAttemptIdentifier {
        InputAttemptIdentifier::new(index, 0, format!("attempt_{index}"))
    }

    #[test]
    fn known_output_makes_idle_host_pending() {
        let mut host = MapHost::new(MapHostRef::new("node:1", 0));
        assert_eq!(host.state(), HostState::Idle);
        host.add_known_map(id(0));
        assert_eq!(host.state(), HostState::Pending);
        assert_eq!(host.num_known_maps(), 1);
    }

    #[test]
    fn penalized_host_stays_penalized_on_new_output() {
        let mut host = MapHost::new(MapHostRef::new("node:1", 0));
        host.penalize();
        host.add_known_map(id(0));
        assert_eq!(host.state(), HostState::Penalized);
        assert_eq!(host.mark_available(), HostState::Pending);
    }

    #[test]
    fn available_host_without_outputs_is_idle() {
        let mut host = MapHost::new(MapHostRef::new("node:1", 0));
        host.add_known_map(id(0));
        host.mark_busy(Instant::now());
        let drained = host.get_and_clear_known_maps();
        assert_eq!(drained.len(), 1);
        assert_eq!(host.mark_available(), HostState::Idle);
    }

    #[test]
    fn host_ref_splits_host_and_port() {
        let handle = MapHostRef::new("node-3:13562", 2);
        assert_eq!(handle.host_name(), "node-3");
        assert_eq!(handle.port(), Some(13562));
        assert_eq!(handle.identifier(), "node-3:13562/2");
        assert_eq!(MapHostRef::new("bare", 0).port(), None);
    }
}
