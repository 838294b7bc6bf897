//! Circuit breaker deciding when a shuffle should stop retrying.
//!
//! Evaluated after every failed fetch. The shuffle is given up when enough
//! distinct attempts keep failing, failures outnumber successes and the
//! shuffle either has not made enough progress or has stalled.

use std::time::Duration;

pub const MAX_ALLOWED_FAILED_FETCH_FRACTION: f64 = 0.5;
pub const MIN_REQUIRED_PROGRESS_FRACTION: f64 = 0.5;
pub const MAX_ALLOWED_STALL_FRACTION: f64 = 0.5;

/// A snapshot of what the health check looks at.
#[derive(Clone, Debug, PartialEq)]
pub struct HealthInputs {
    pub total_failures: u64,
    pub done_inputs: usize,
    pub num_inputs: usize,
    /// Distinct attempts that have failed and not yet succeeded.
    pub failed_attempts: usize,
    pub max_failed_unique_fetches: usize,
    /// Time since the last successful fetch.
    pub stall_duration: Duration,
    /// Time between the start of the shuffle and the last successful fetch.
    pub progress_duration: Duration,
    /// Longest map runtime reported so far, zero if none was reported.
    pub max_map_runtime: Duration,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HealthVerdict {
    pub healthy: bool,
    pub progressed_enough: bool,
    pub stalled: bool,
    pub should_abort: bool,
}

pub fn evaluate(inputs: &HealthInputs) -> HealthVerdict {
    let failures = inputs.total_failures as f64;
    let done = inputs.done_inputs as f64;

    let healthy = failures / (failures + done) < MAX_ALLOWED_FAILED_FETCH_FRACTION;
    let progressed_enough = done / inputs.num_inputs as f64 >= MIN_REQUIRED_PROGRESS_FRACTION;

    // With no progress and no reported map runtime the baseline is zero;
    // the ratio then becomes infinite (stalled) or NaN (not stalled).
    let baseline = inputs.progress_duration.max(inputs.max_map_runtime);
    let stalled = inputs.stall_duration.as_millis() as f64 / baseline.as_millis() as f64
        >= MAX_ALLOWED_STALL_FRACTION;

    let pending_inputs = inputs.num_inputs - inputs.done_inputs;
    let enough_failed_attempts = inputs.failed_attempts >= inputs.max_failed_unique_fetches
        || inputs.failed_attempts == pending_inputs;

    HealthVerdict {
        healthy,
        progressed_enough,
        stalled,
        should_abort: enough_failed_attempts && !healthy && (!progressed_enough || stalled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> HealthInputs {
        HealthInputs {
            total_failures: 0,
            done_inputs: 0,
            num_inputs: 10,
            failed_attempts: 0,
            max_failed_unique_fetches: 5,
            stall_duration: Duration::from_secs(1),
            progress_duration: Duration::from_secs(10),
            max_map_runtime: Duration::ZERO,
        }
    }

    #[test]
    fn many_failing_attempts_without_progress_abort() {
        let verdict = evaluate(&HealthInputs {
            total_failures: 6,
            failed_attempts: 5,
            ..inputs()
        });
        assert!(!verdict.healthy);
        assert!(!verdict.progressed_enough);
        assert!(verdict.should_abort);
    }

    #[test]
    fn few_failing_attempts_do_not_abort() {
        let verdict = evaluate(&HealthInputs {
            total_failures: 40,
            failed_attempts: 1,
            ..inputs()
        });
        assert!(!verdict.healthy);
        assert!(!verdict.should_abort);
    }

    #[test]
    fn all_pending_inputs_failing_counts_as_enough() {
        let verdict = evaluate(&HealthInputs {
            total_failures: 20,
            done_inputs: 8,
            failed_attempts: 2,
            stall_duration: Duration::from_secs(30),
            ..inputs()
        });
        assert!(verdict.progressed_enough);
        assert!(verdict.stalled);
        assert!(verdict.should_abort);
    }

    #[test]
    fn progressing_shuffle_survives_failures() {
        let verdict = evaluate(&HealthInputs {
            total_failures: 20,
            done_inputs: 8,
            failed_attempts: 2,
            stall_duration: Duration::from_secs(1),
            ..inputs()
        });
        assert!(verdict.progressed_enough);
        assert!(!verdict.stalled);
        assert!(!verdict.should_abort);
    }

    #[test]
    fn mostly_successful_shuffle_is_healthy() {
        let verdict = evaluate(&HealthInputs {
            total_failures: 2,
            done_inputs: 3,
            failed_attempts: 5,
            ..inputs()
        });
        assert!(verdict.healthy);
        assert!(!verdict.should_abort);
    }

    #[test]
    fn map_runtime_widens_the_stall_baseline() {
        let base = HealthInputs {
            total_failures: 10,
            done_inputs: 6,
            failed_attempts: 4,
            stall_duration: Duration::from_secs(8),
            progress_duration: Duration::from_secs(10),
            ..inputs()
        };
        assert!(evaluate(&base).stalled);
        let informed = HealthInputs {
            max_map_runtime: Duration::from_secs(60),
            ..base
        };
        assert!(!evaluate(&informed).stalled);
    }

    #[test]
    fn zero_baseline_is_degenerate() {
        let instant = HealthInputs {
            stall_duration: Duration::ZERO,
            progress_duration: Duration::ZERO,
            ..inputs()
        };
        assert!(!evaluate(&instant).stalled);

        let waited = HealthInputs {
            stall_duration: Duration::from_millis(1),
            progress_duration: Duration::ZERO,
            ..inputs()
        };
        assert!(evaluate(&waited).stalled);
    }
}
