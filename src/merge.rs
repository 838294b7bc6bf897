//! The merge side of the shuffle, as seen by the scheduler.
//!
//! The scheduler never merges anything itself. It hands committed outputs to
//! a [`MergeSink`] and asks it for room before starting more fetches.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::{Result, ShuffleError};
use crate::InputAttemptIdentifier;

/// Where a fetched output was placed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum MapOutputKind {
    Memory,
    Disk,
    /// Read in place from the local disk of a co-located map.
    DiskDirect,
}

/// A fetched, not yet committed map output.
#[derive(Clone, Debug)]
pub struct MapOutput {
    pub attempt: InputAttemptIdentifier,
    pub kind: MapOutputKind,
    pub data: Bytes,
}

impl MapOutput {
    pub fn new(attempt: InputAttemptIdentifier, kind: MapOutputKind, data: Bytes) -> Self {
        Self {
            attempt,
            kind,
            data,
        }
    }
}

#[async_trait]
pub trait MergeSink: Send + Sync + 'static {
    /// Block while an in-memory merge is running.
    async fn wait_for_in_memory_merge(&self) -> Result<()>;

    /// Block until fetched data fits in the shuffle memory budget again.
    async fn wait_for_shuffle_to_merge_memory(&self) -> Result<()>;

    /// Take ownership of a successfully fetched output.
    fn commit(&self, output: MapOutput) -> Result<()>;

    /// Release an output that turned out not to be needed.
    fn abort(&self, output: MapOutput);
}

/// Keeps committed outputs in memory.
///
/// Capacity is controlled by an explicit gate: while the gate is closed, the
/// scheduler will not start new fetch tasks.
#[derive(Debug)]
pub struct InMemoryMergeSink {
    committed: Mutex<Vec<MapOutput>>,
    committed_bytes: AtomicU64,
    aborted: AtomicU64,
    gate: watch::Sender<bool>,
}

impl Default for InMemoryMergeSink {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMergeSink {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            committed: Mutex::new(Vec::new()),
            committed_bytes: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
            gate,
        }
    }

    /// Open or close the buffer. New fetches only start while it is open.
    pub fn set_available(&self, available: bool) {
        self.gate.send_replace(available);
    }

    pub fn committed(&self) -> Vec<InputAttemptIdentifier> {
        self.committed
            .lock()
            .iter()
            .map(|o| o.attempt.clone())
            .collect()
    }

    pub fn committed_bytes(&self) -> u64 {
        self.committed_bytes.load(Ordering::Relaxed)
    }

    pub fn aborted(&self) -> u64 {
        self.aborted.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MergeSink for InMemoryMergeSink {
    async fn wait_for_in_memory_merge(&self) -> Result<()> {
        Ok(())
    }

    async fn wait_for_shuffle_to_merge_memory(&self) -> Result<()> {
        let mut rx = self.gate.subscribe();
        rx.wait_for(|available| *available)
            .await
            .map_err(|e| ShuffleError::Merge(e.to_string()))?;
        Ok(())
    }

    fn commit(&self, output: MapOutput) -> Result<()> {
        self.committed_bytes
            .fetch_add(output.data.len() as u64, Ordering::Relaxed);
        self.committed.lock().push(output);
        Ok(())
    }

    fn abort(&self, _output: MapOutput) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn closed_gate_blocks_until_reopened() {
        let sink = std::sync::Arc::new(InMemoryMergeSink::new());
        sink.set_available(false);

        let waiter = {
            let sink = sink.clone();
            tokio::spawn(async move { sink.wait_for_shuffle_to_merge_memory().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        sink.set_available(true);
        waiter.await.unwrap().unwrap();
    }

    #[test]
    fn commit_and_abort_are_tracked() {
        let sink = InMemoryMergeSink::new();
        let id = InputAttemptIdentifier::new(0, 0, "p");
        sink.commit(MapOutput::new(
            id.clone(),
            MapOutputKind::Memory,
            Bytes::from_static(b"abcd"),
        ))
        .unwrap();
        sink.abort(MapOutput::new(id.clone(), MapOutputKind::Disk, Bytes::new()));
        assert_eq!(sink.committed(), vec![id]);
        assert_eq!(sink.committed_bytes(), 4);
        assert_eq!(sink.aborted(), 1);
    }
}
