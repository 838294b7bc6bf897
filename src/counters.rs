//! Aggregate shuffle counters.

use serde::Serialize;

use crate::merge::MapOutputKind;

/// Error categories a fetcher may record while talking to a host.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum FetchErrorKind {
    Io,
    WrongLength,
    BadId,
    WrongMap,
    Connection,
    WrongReduce,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FetchErrorCounts {
    pub io: u64,
    pub wrong_length: u64,
    pub bad_id: u64,
    pub wrong_map: u64,
    pub connection: u64,
    pub wrong_reduce: u64,
}

impl FetchErrorCounts {
    fn slot(&mut self, kind: FetchErrorKind) -> &mut u64 {
        match kind {
            FetchErrorKind::Io => &mut self.io,
            FetchErrorKind::WrongLength => &mut self.wrong_length,
            FetchErrorKind::BadId => &mut self.bad_id,
            FetchErrorKind::WrongMap => &mut self.wrong_map,
            FetchErrorKind::Connection => &mut self.connection,
            FetchErrorKind::WrongReduce => &mut self.wrong_reduce,
        }
    }
}

/// Counters kept by the scheduler. A copy can be taken at any time through
/// [`crate::ShuffleScheduler::counters`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ShuffleCounters {
    pub num_inputs: usize,
    pub remaining_inputs: usize,
    /// Outputs fetched with data.
    pub shuffled_inputs: u64,
    /// Inputs completed without anything to fetch.
    pub skipped_inputs: u64,
    pub fetched_spills: u64,
    pub failed_fetches: u64,
    pub bytes_compressed: u64,
    pub bytes_decompressed: u64,
    pub bytes_to_memory: u64,
    pub bytes_to_disk: u64,
    pub bytes_disk_direct: u64,
    pub fetch_errors: FetchErrorCounts,
    /// Milliseconds after start at which the first and the latest output
    /// announcement arrived.
    pub first_event_received_ms: u64,
    pub last_event_received_ms: u64,
}

impl ShuffleCounters {
    pub fn new(num_inputs: usize) -> Self {
        Self {
            num_inputs,
            remaining_inputs: num_inputs,
            ..Default::default()
        }
    }

    pub fn record_output(&mut self, kind: MapOutputKind, bytes: u64) {
        match kind {
            MapOutputKind::Memory => self.bytes_to_memory += bytes,
            MapOutputKind::Disk => self.bytes_to_disk += bytes,
            MapOutputKind::DiskDirect => self.bytes_disk_direct += bytes,
        }
        self.shuffled_inputs += 1;
    }

    pub fn record_fetch_error(&mut self, kind: FetchErrorKind) {
        *self.fetch_errors.slot(kind) += 1;
    }

    pub fn record_event_received(&mut self, relative_ms: u64) {
        if self.first_event_received_ms == 0 {
            self.first_event_received_ms = relative_ms;
        }
        self.last_event_received_ms = relative_ms;
    }

    #[inline]
    pub fn done_inputs(&self) -> usize {
        self.num_inputs - self.remaining_inputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_bytes_land_in_their_bucket() {
        let mut counters = ShuffleCounters::new(4);
        counters.record_output(MapOutputKind::Memory, 10);
        counters.record_output(MapOutputKind::Disk, 20);
        counters.record_output(MapOutputKind::DiskDirect, 30);
        assert_eq!(counters.bytes_to_memory, 10);
        assert_eq!(counters.bytes_to_disk, 20);
        assert_eq!(counters.bytes_disk_direct, 30);
        assert_eq!(counters.shuffled_inputs, 3);
    }

    #[test]
    fn first_event_time_sticks() {
        let mut counters = ShuffleCounters::new(1);
        counters.record_event_received(15);
        counters.record_event_received(40);
        assert_eq!(counters.first_event_received_ms, 15);
        assert_eq!(counters.last_event_received_ms, 40);
    }

    #[test]
    fn fetch_errors_by_kind() {
        let mut counters = ShuffleCounters::new(1);
        counters.record_fetch_error(FetchErrorKind::Connection);
        counters.record_fetch_error(FetchErrorKind::Connection);
        counters.record_fetch_error(FetchErrorKind::BadId);
        assert_eq!(counters.fetch_errors.connection, 2);
        assert_eq!(counters.fetch_errors.bad_id, 1);
        assert_eq!(counters.fetch_errors.io, 0);
    }
}
