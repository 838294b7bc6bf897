//! Utility functions and small containers shared by the scheduler.
//!

use std::time::Duration;

/// Build the registry key of a host serving one partition.
///
/// The host part is lower-cased so that `Node-1:13562` and `node-1:13562`
/// end up in the same entry.
pub fn host_identifier(host_port: &str, partition_id: u32) -> String {
    format!("{}/{}", host_port.to_ascii_lowercase(), partition_id)
}

/// Key of the path → identifier lookup.
#[inline]
pub fn path_identifier(path: &str, partition_id: u32) -> String {
    format!("{path}_{partition_id}")
}

/// Human readable name of a map task attempt, e.g. `map_000003_01`.
pub fn task_attempt_identifier(source_name: &str, input_index: u32, attempt: u32) -> String {
    format!("{source_name}_{input_index:06}_{attempt:02}")
}

/// Cumulative transfer rate in MB/s. The elapsed time is rounded up to whole
/// seconds plus one so the very first fetch does not report a huge rate.
pub fn transfer_rate_mbps(total_bytes: u64, elapsed: Duration) -> f64 {
    let mbs = total_bytes as f64 / (1024.0 * 1024.0);
    let secs = elapsed.as_secs() + 1;
    mbs / secs as f64
}

/// A growable bit set backed by 64-bit words.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bits: usize) -> Self {
        Self {
            words: vec![0; bits.div_ceil(64)],
        }
    }

    /// Set bit `index`. Returns `true` if it was not set before.
    pub fn insert(&mut self, index: usize) -> bool {
        let (word, bit) = (index / 64, index % 64);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let mask = 1u64 << bit;
        let fresh = self.words[word] & mask == 0;
        self.words[word] |= mask;
        fresh
    }

    pub fn contains(&self, index: usize) -> bool {
        let (word, bit) = (index / 64, index % 64);
        self.words
            .get(word)
            .map_or(false, |w| w & (1u64 << bit) != 0)
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, w)| {
            (0..64).filter(move |b| w & (1u64 << b) != 0).map(move |b| i * 64 + b)
        })
    }
}
