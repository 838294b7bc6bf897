//! The fetch scheduler of a MapReduce (lite) shuffle.
//!
//! A reduce-side task must pull one partition of every map output, each
//! produced by a different map attempt on a different host. The
//! [`ShuffleScheduler`] keeps track of which hosts and outputs are known,
//! which were fetched and which failed, and decides what to fetch next,
//! when to back off from a flaky host and when to give up on the shuffle.
//!
//! Moving the bytes and merging them are left to a [`fetch::Fetcher`] and a
//! [`merge::MergeSink`] supplied by the caller.

use std::fmt;
use std::hash::{Hash, Hasher};

pub mod config;
pub mod counters;
pub mod error;
pub mod events;
pub mod fetch;
pub mod host;
pub mod merge;
pub mod scheduler;
pub mod standalone;
pub mod utils;

pub use config::ShuffleConfig;
pub use error::{Result, ShuffleError};
pub use host::{HostState, MapHostRef};
pub use scheduler::ShuffleScheduler;

/////////////////////////////////////////////////////////////////////////////
// Map output identifiers
/////////////////////////////////////////////////////////////////////////////

/// How a map attempt delivers its output for one partition.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SpillInfo {
    /// The map merged all of its spills; there is exactly one output to fetch.
    FinalMerged,
    /// One intermediate chunk of a pipelined output.
    Incremental { spill_id: u32 },
    /// The last chunk of a pipelined output. Its id is the highest chunk id.
    FinalUpdate { spill_id: u32 },
}

/// Identifies one fetchable output: a map input index, the attempt that
/// produced it and, for pipelined maps, the chunk.
///
/// Two identifiers are equal when index, attempt and chunk id match. The path
/// component is only a locator and does not take part in equality.
#[derive(Clone, Debug)]
pub struct InputAttemptIdentifier {
    input_index: u32,
    attempt_number: u32,
    path_component: String,
    spill: SpillInfo,
}

impl InputAttemptIdentifier {
    /// An identifier for a map that publishes a single merged output.
    pub fn new(input_index: u32, attempt_number: u32, path_component: impl ToString) -> Self {
        Self {
            input_index,
            attempt_number,
            path_component: path_component.to_string(),
            spill: SpillInfo::FinalMerged,
        }
    }

    /// An identifier for chunk `spill_id` of a pipelined map output.
    pub fn pipelined(
        input_index: u32,
        attempt_number: u32,
        path_component: impl ToString,
        spill_id: u32,
        is_final: bool,
    ) -> Self {
        let spill = if is_final {
            SpillInfo::FinalUpdate { spill_id }
        } else {
            SpillInfo::Incremental { spill_id }
        };
        Self {
            input_index,
            attempt_number,
            path_component: path_component.to_string(),
            spill,
        }
    }

    #[inline]
    pub fn input_index(&self) -> u32 {
        self.input_index
    }

    #[inline]
    pub fn attempt_number(&self) -> u32 {
        self.attempt_number
    }

    #[inline]
    pub fn path_component(&self) -> &str {
        &self.path_component
    }

    #[inline]
    pub fn spill(&self) -> SpillInfo {
        self.spill
    }

    /// The chunk id, or `None` for a merged output.
    #[inline]
    pub fn spill_id(&self) -> Option<u32> {
        match self.spill {
            SpillInfo::FinalMerged => None,
            SpillInfo::Incremental { spill_id } | SpillInfo::FinalUpdate { spill_id } => {
                Some(spill_id)
            }
        }
    }

    /// Whether the map emits its output in several chunks.
    #[inline]
    pub fn can_retrieve_input_in_chunks(&self) -> bool {
        !matches!(self.spill, SpillInfo::FinalMerged)
    }

    /// Whether this is the last chunk of a pipelined output.
    #[inline]
    pub fn is_final_chunk(&self) -> bool {
        matches!(self.spill, SpillInfo::FinalUpdate { .. })
    }
}

impl PartialEq for InputAttemptIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.input_index == other.input_index
            && self.attempt_number == other.attempt_number
            && self.spill_id() == other.spill_id()
    }
}

impl Eq for InputAttemptIdentifier {}

impl Hash for InputAttemptIdentifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.input_index.hash(state);
        self.attempt_number.hash(state);
        self.spill_id().hash(state);
    }
}

impl fmt::Display for InputAttemptIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "input={} attempt={} path={}",
            self.input_index, self.attempt_number, self.path_component
        )?;
        match self.spill {
            SpillInfo::FinalMerged => Ok(()),
            SpillInfo::Incremental { spill_id } => write!(f, " spill={spill_id}"),
            SpillInfo::FinalUpdate { spill_id } => write!(f, " spill={spill_id} (final)"),
        }
    }
}
