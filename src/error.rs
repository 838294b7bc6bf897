use thiserror::Error;

pub type Result<T, E = ShuffleError> = std::result::Result<T, E>;

/// Errors surfaced by the shuffle scheduler.
///
/// Transient fetch failures never show up here; they are absorbed by the
/// penalty and retry machinery. Everything else reaches the owner of the run
/// through [`crate::events::EventSink::report_exception`].
#[derive(Debug, Error)]
pub enum ShuffleError {
    #[error("{failures} failures downloading {attempt}")]
    TooManyFetchFailures { failures: u32, attempt: String },

    #[error(
        "previous event already got scheduled for {attempt}; data of attempt {tracked_attempt} \
         could have been already merged (chunks seen: {chunks_seen}), failing the fetch early"
    )]
    StaleAttempt {
        attempt: String,
        tracked_attempt: u32,
        chunks_seen: usize,
    },

    #[error(
        "{attempt} is marked as obsolete but has pipelined progress; \
         some data could have been already merged"
    )]
    ObsoleteAfterProgress { attempt: String },

    #[error(
        "exceeded max failed unique fetches, bailing out (failed attempts={failed_attempts}, \
         pending inputs={pending_inputs}, healthy={healthy}, progressed enough={progressed_enough}, \
         stalled={stalled})"
    )]
    Unhealthy {
        failed_attempts: usize,
        pending_inputs: usize,
        healthy: bool,
        progressed_enough: bool,
        stalled: bool,
    },

    #[error("inconsistent shuffle state: {0}")]
    Inconsistent(String),

    #[error("fetcher for {host} failed: {message}")]
    Fetcher { host: String, message: String },

    #[error("merge error: {0}")]
    Merge(String),

    #[error("local error: {0}")]
    Local(#[from] std::io::Error),

    #[error("interrupted while the shuffle was still expected to run: {0}")]
    Interrupted(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ShuffleError {
    /// Whether the error is a protocol violation that must never be retried.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ShuffleError::StaleAttempt { .. } | ShuffleError::ObsoleteAfterProgress { .. }
        )
    }
}
