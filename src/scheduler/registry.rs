//! Known producer hosts, the outputs they serve and which of them may be
//! handed to a fetch task.

use fnv::{FnvHashMap, FnvHashSet};
use itertools::Itertools;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::host::{HostState, MapHost, MapHostRef};
use crate::InputAttemptIdentifier;

#[derive(Debug)]
pub struct HostRegistry {
    hosts: FnvHashMap<String, MapHost>,
    /// Identifiers of `Pending` hosts. A vector so that a uniformly random
    /// entry can be picked in constant time.
    pending: Vec<String>,
    obsolete: FnvHashSet<InputAttemptIdentifier>,
    rng: StdRng,
}

impl HostRegistry {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            hosts: FnvHashMap::default(),
            pending: Vec::new(),
            obsolete: FnvHashSet::default(),
            rng,
        }
    }

    /// Queue `attempt` on the host serving `handle`, creating the host entry
    /// if needed. Returns `true` if the host just became pending.
    pub fn add_known_map(&mut self, handle: MapHostRef, attempt: InputAttemptIdentifier) -> bool {
        let host = self
            .hosts
            .entry(handle.identifier().to_string())
            .or_insert_with(|| MapHost::new(handle));
        host.add_known_map(attempt);
        if host.state() == HostState::Pending {
            let identifier = host.handle().identifier().to_string();
            return self.mark_pending(identifier);
        }
        false
    }

    /// Requeue an attempt on a host without changing its pending status.
    pub fn put_back(&mut self, handle: &MapHostRef, attempt: InputAttemptIdentifier) {
        match self.hosts.get_mut(handle.identifier()) {
            Some(host) => host.add_known_map(attempt),
            None => debug!(host = %handle, %attempt, "Put back for unknown host ignored"),
        }
    }

    /// Take a uniformly random pending host and mark it busy.
    pub fn take_pending(&mut self, now: Instant) -> Option<MapHostRef> {
        if self.pending.is_empty() {
            return None;
        }
        let pick = self.rng.gen_range(0..self.pending.len());
        let identifier = self.pending.swap_remove(pick);
        let host = self.hosts.get_mut(&identifier)?;
        host.mark_busy(now);
        debug!(
            host = %host.handle(),
            known_maps = host.num_known_maps(),
            "Assigning host"
        );
        Some(host.handle().clone())
    }

    /// A fetch task is done with `handle`. A penalized host stays penalized.
    /// Returns the time the host was busy for, and whether it became pending.
    pub fn free_host(&mut self, handle: &MapHostRef, now: Instant) -> (Option<std::time::Duration>, bool) {
        let Some(host) = self.hosts.get_mut(handle.identifier()) else {
            return (None, false);
        };
        let busy_for = host.take_busy_since().map(|since| now - since);
        if host.state() == HostState::Penalized {
            return (busy_for, false);
        }
        if host.mark_available() == HostState::Pending {
            let identifier = handle.identifier().to_string();
            return (busy_for, self.mark_pending(identifier));
        }
        (busy_for, false)
    }

    pub fn penalize(&mut self, handle: &MapHostRef) {
        if let Some(host) = self.hosts.get_mut(handle.identifier()) {
            host.penalize();
        }
        self.pending.retain(|id| id != handle.identifier());
    }

    /// The penalty of `identifier` expired. Returns `true` if it became pending.
    pub fn release_penalized(&mut self, identifier: &str) -> bool {
        let Some(host) = self.hosts.get_mut(identifier) else {
            return false;
        };
        if host.state() != HostState::Penalized {
            return false;
        }
        if host.mark_available() == HostState::Pending {
            return self.mark_pending(identifier.to_string());
        }
        false
    }

    pub fn mark_obsolete(&mut self, attempt: InputAttemptIdentifier) {
        self.obsolete.insert(attempt);
    }

    #[cfg(test)]
    fn is_obsolete(&self, attempt: &InputAttemptIdentifier) -> bool {
        self.obsolete.contains(attempt)
    }

    /// Drain the queue of `handle` into a batch for one fetch task.
    ///
    /// Outputs for which `is_finished` holds and obsolete outputs are dropped.
    /// Per input only the newest attempt survives; for pipelined outputs every
    /// distinct chunk of that attempt is kept. At most `max_outputs` are
    /// returned, the rest goes back onto the host.
    pub fn get_maps_for_host(
        &mut self,
        handle: &MapHostRef,
        max_outputs: usize,
        is_finished: impl Fn(u32) -> bool,
    ) -> Vec<InputAttemptIdentifier> {
        let Some(host) = self.hosts.get_mut(handle.identifier()) else {
            return Vec::new();
        };
        let known = host.get_and_clear_known_maps();
        let obsolete = &self.obsolete;
        let consumable = known.into_iter().filter(|id| {
            let keep = !obsolete.contains(id) && !is_finished(id.input_index());
            if !keep {
                debug!(%id, "Ignoring finished or obsolete source");
            }
            keep
        });
        let deduped = dedupe_attempts(consumable);
        let total = deduped.len();

        let mut batch = deduped;
        let overflow = if batch.len() > max_outputs {
            batch.split_off(max_outputs)
        } else {
            Vec::new()
        };
        for id in overflow {
            host.add_known_map(id);
        }
        debug!(host = %handle, assigned = batch.len(), total, "Assigned outputs");
        batch
    }

    pub fn host_state(&self, handle: &MapHostRef) -> Option<HostState> {
        self.hosts.get(handle.identifier()).map(MapHost::state)
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    #[cfg(test)]
    fn num_hosts(&self) -> usize {
        self.hosts.len()
    }

    /// Forget every host, the pending list and obsolete markers.
    pub fn reset(&mut self) {
        self.hosts.clear();
        self.pending.clear();
        self.obsolete.clear();
    }

    fn mark_pending(&mut self, identifier: String) -> bool {
        if self.pending.contains(&identifier) {
            return false;
        }
        self.pending.push(identifier);
        true
    }
}

/// Keep the newest attempt per input, preserving first-seen input order.
/// Chunks of a pipelined attempt are distinct outputs; a repeated chunk id is
/// dropped.
fn dedupe_attempts(
    attempts: impl Iterator<Item = InputAttemptIdentifier>,
) -> Vec<InputAttemptIdentifier> {
    let mut groups: Vec<(u32, Vec<InputAttemptIdentifier>)> = Vec::new();
    let mut position: FnvHashMap<u32, usize> = FnvHashMap::default();

    for id in attempts {
        let index = id.input_index();
        let Some(&slot) = position.get(&index) else {
            position.insert(index, groups.len());
            groups.push((index, vec![id]));
            continue;
        };
        let group = &mut groups[slot].1;
        // Every member of a group shares one attempt number.
        let kept_attempt = group[0].attempt_number();

        if id.attempt_number() > kept_attempt {
            warn!(
                input = index,
                old_attempt = kept_attempt,
                new_attempt = id.attempt_number(),
                "Ignoring older source attempt in favour of a newer one"
            );
            group.clear();
            group.push(id);
        } else if id.attempt_number() < kept_attempt {
            warn!(
                input = index,
                old_attempt = id.attempt_number(),
                new_attempt = kept_attempt,
                "Ignoring older source attempt in favour of a newer one"
            );
        } else if id.can_retrieve_input_in_chunks() && !group.contains(&id) {
            group.push(id);
        }
    }

    groups.into_iter().flat_map(|(_, group)| group).collect_vec()
}
