//! Completion tracking for pipelined map outputs.
//!
//! A pipelined map publishes its output as numbered chunks and flags the
//! last one. Chunks may be fetched in any order, so an input only counts as
//! fetched once every chunk up to the final one has arrived.

use fnv::FnvHashMap;

use crate::error::{Result, ShuffleError};
use crate::utils::BitSet;
use crate::InputAttemptIdentifier;

/// Received chunks of one input, bound to a single map attempt.
#[derive(Clone, Debug)]
pub struct PipelinedProgress {
    chunks: BitSet,
    final_chunk: Option<u32>,
    attempt_number: u32,
}

impl PipelinedProgress {
    pub fn new(attempt_number: u32) -> Self {
        Self {
            chunks: BitSet::new(),
            final_chunk: None,
            attempt_number,
        }
    }

    #[inline]
    pub fn attempt_number(&self) -> u32 {
        self.attempt_number
    }

    #[inline]
    pub fn final_chunk(&self) -> Option<u32> {
        self.final_chunk
    }

    #[inline]
    pub fn chunks_seen(&self) -> usize {
        self.chunks.count()
    }

    pub fn record_chunk(&mut self, chunk_id: u32) -> Result<()> {
        if let Some(last) = self.final_chunk {
            if chunk_id > last || self.chunks.count() > last as usize + 1 {
                return Err(ShuffleError::Inconsistent(format!(
                    "chunk {chunk_id} recorded after final chunk {last}: {self}"
                )));
            }
        }
        self.chunks.insert(chunk_id as usize);
        Ok(())
    }

    pub fn set_final_chunk(&mut self, chunk_id: u32) -> Result<()> {
        if let Some(last) = self.final_chunk {
            if last != chunk_id {
                return Err(ShuffleError::Inconsistent(format!(
                    "final chunk moved from {last} to {chunk_id}: {self}"
                )));
            }
        }
        if self.chunks.count() > chunk_id as usize + 1 {
            return Err(ShuffleError::Inconsistent(format!(
                "final chunk {chunk_id} but more chunks already received: {self}"
            )));
        }
        self.final_chunk = Some(chunk_id);
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        self.final_chunk
            .map_or(false, |last| self.chunks.count() == last as usize + 1)
    }
}

impl std::fmt::Display for PipelinedProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[chunks={:?}, final={:?}, attempt={}]",
            self.chunks.iter().collect::<Vec<_>>(),
            self.final_chunk,
            self.attempt_number
        )
    }
}

/// Outcome of matching a reported attempt against the tracked one.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AttemptCheck {
    Accepted,
    /// The report comes from an attempt older than the tracked one.
    Superseded { tracked: u32 },
    /// A newer attempt showed up for an input already bound to an attempt.
    Conflict { tracked: u32, chunks_seen: usize },
}

/// Progress of every pipelined input that is not finished yet.
#[derive(Debug, Default)]
pub struct PipelinedTracker {
    inputs: FnvHashMap<u32, PipelinedProgress>,
}

impl PipelinedTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `attempt` to its input. The first attempt seen for an input is
    /// tracked for as long as the input is open; any other attempt is refused.
    pub fn check_attempt(&mut self, attempt: &InputAttemptIdentifier) -> AttemptCheck {
        let index = attempt.input_index();
        let number = attempt.attempt_number();
        let tracked = self
            .inputs
            .get(&index)
            .map(|p| (p.attempt_number, p.chunks_seen()));
        match tracked {
            Some((tracked, _)) if tracked == number => AttemptCheck::Accepted,
            Some((tracked, _)) if tracked > number => AttemptCheck::Superseded { tracked },
            Some((tracked, chunks_seen)) => AttemptCheck::Conflict {
                tracked,
                chunks_seen,
            },
            None => {
                self.inputs.insert(index, PipelinedProgress::new(number));
                AttemptCheck::Accepted
            }
        }
    }

    /// Record a fetched chunk. Returns `true` when this completed the input,
    /// in which case the input is no longer tracked.
    pub fn record(&mut self, attempt: &InputAttemptIdentifier) -> Result<bool> {
        let chunk_id = attempt.spill_id().ok_or_else(|| {
            ShuffleError::Inconsistent(format!("{attempt} is not a pipelined output"))
        })?;
        let index = attempt.input_index();
        let progress = self
            .inputs
            .entry(index)
            .or_insert_with(|| PipelinedProgress::new(attempt.attempt_number()));
        progress.record_chunk(chunk_id)?;
        if attempt.is_final_chunk() {
            progress.set_final_chunk(chunk_id)?;
        }
        if progress.is_done() {
            self.inputs.remove(&index);
            return Ok(true);
        }
        Ok(false)
    }

    pub fn get(&self, input_index: u32) -> Option<&PipelinedProgress> {
        self.inputs.get(&input_index)
    }

    pub fn tracked_attempt(&self, input_index: u32) -> Option<u32> {
        self.inputs.get(&input_index).map(|p| p.attempt_number)
    }
}
