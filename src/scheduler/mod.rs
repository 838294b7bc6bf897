//! The shuffle scheduler.
//!
//! All bookkeeping (hosts, pending list, failure counts, pipelined progress,
//! penalties, counters) lives in one [`SchedulerState`] behind a single
//! mutex. The lock is never held across an `.await`; waiters are woken
//! through [`Notify`] instead.
//!
//! Three kinds of tasks share that state:
//! - the dispatch loop ([`ShuffleScheduler::run`]), which starts fetch tasks,
//! - the penalty referee, which puts penalized hosts back into play,
//! - the fetch tasks, which report back through [`ShuffleScheduler::copy_succeeded`]
//!   and [`ShuffleScheduler::copy_failed`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use fnv::FnvHashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ShuffleConfig;
use crate::counters::{FetchErrorKind, ShuffleCounters};
use crate::error::{Result, ShuffleError};
use crate::events::{EventSink, InputReadErrorEvent};
use crate::fetch::Fetcher;
use crate::host::{HostState, MapHostRef};
use crate::merge::{MapOutput, MergeSink};
use crate::utils::{path_identifier, task_attempt_identifier, transfer_rate_mbps, BitSet};
use crate::InputAttemptIdentifier;

use self::health::HealthInputs;
use self::penalty::{penalty_delay, PenaltyQueue};
use self::progress::{AttemptCheck, PipelinedTracker};
use self::registry::HostRegistry;

mod dispatch;
pub mod health;
pub mod penalty;
pub mod progress;
pub mod registry;

/// Mutable state of a shuffle, guarded by [`Inner::state`].
struct SchedulerState {
    registry: HostRegistry,
    tracker: PipelinedTracker,
    finished: BitSet,
    remaining: usize,
    failure_counts: FnvHashMap<InputAttemptIdentifier, u32>,
    host_failures: FnvHashMap<String, u32>,
    penalties: PenaltyQueue,
    counters: ShuffleCounters,
    last_progress: Instant,
    max_map_runtime: Duration,
}

impl SchedulerState {
    #[inline]
    fn is_input_finished(&self, input_index: u32) -> bool {
        self.finished.contains(input_index as usize)
    }

    /// Mark an input fetched. Finishing an input twice is a no-op.
    fn finish_input(&mut self, input_index: u32) {
        if self.finished.insert(input_index as usize) {
            self.remaining -= 1;
            self.counters.remaining_inputs = self.remaining;
        }
    }
}

struct Inner {
    config: ShuffleConfig,
    num_inputs: usize,
    num_fetchers: usize,
    abort_failure_limit: u32,
    max_failed_unique_fetches: usize,
    start: Instant,

    state: Mutex<SchedulerState>,
    /// Pending host added, fetch slot freed, all inputs done or shutdown.
    state_changed: Notify,
    /// A penalty was scheduled; the referee re-reads the earliest expiry.
    penalty_added: Notify,
    shutdown: CancellationToken,
    closed: AtomicBool,
    running_fetchers: AtomicUsize,

    /// Read by fetchers to map fetched paths back to identifiers without
    /// taking the state lock.
    path_to_identifier: DashMap<String, InputAttemptIdentifier>,

    fetcher: Arc<dyn Fetcher>,
    merge: Arc<dyn MergeSink>,
    events: Arc<dyn EventSink>,
    referee: Mutex<Option<JoinHandle<()>>>,
}

/// Schedules the fetches of one shuffle. Cloning is cheap; all clones drive
/// the same shuffle.
#[derive(Clone)]
pub struct ShuffleScheduler {
    inner: Arc<Inner>,
}

impl ShuffleScheduler {
    /// Create the scheduler for a shuffle of `num_inputs` map outputs and
    /// start its penalty referee.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: ShuffleConfig,
        num_inputs: usize,
        fetcher: Arc<dyn Fetcher>,
        merge: Arc<dyn MergeSink>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        config.validate()?;
        let num_fetchers = config.num_fetchers(num_inputs);
        let abort_failure_limit = config.abort_failure_limit(num_inputs);
        let max_failed_unique_fetches = config.max_failed_unique_fetches.min(num_inputs);
        let start = Instant::now();

        info!(
            source = %config.source_name,
            num_inputs,
            num_fetchers,
            fetch_failures_limit = config.fetch_failures_limit,
            notify_read_error = config.notify_read_error,
            max_failed_unique_fetches,
            abort_failure_limit,
            "Shuffle scheduler created"
        );

        let state = SchedulerState {
            registry: HostRegistry::new(config.rng_seed),
            tracker: PipelinedTracker::new(),
            finished: BitSet::with_capacity(num_inputs),
            remaining: num_inputs,
            failure_counts: FnvHashMap::default(),
            host_failures: FnvHashMap::default(),
            penalties: PenaltyQueue::new(),
            counters: ShuffleCounters::new(num_inputs),
            last_progress: start,
            max_map_runtime: Duration::ZERO,
        };

        let inner = Arc::new(Inner {
            config,
            num_inputs,
            num_fetchers,
            abort_failure_limit,
            max_failed_unique_fetches,
            start,
            state: Mutex::new(state),
            state_changed: Notify::new(),
            penalty_added: Notify::new(),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            running_fetchers: AtomicUsize::new(0),
            path_to_identifier: DashMap::new(),
            fetcher,
            merge,
            events,
            referee: Mutex::new(None),
        });

        let referee = tokio::spawn(penalty::run_referee(Arc::clone(&inner)));
        *inner.referee.lock() = Some(referee);
        Ok(Self { inner })
    }

    /////////////////////////////////////////////////////////////////////////
    // Announcements
    /////////////////////////////////////////////////////////////////////////

    /// Register an output of `attempt` served by `host:port` for `partition_id`.
    pub fn add_known_map_output(
        &self,
        host: &str,
        port: u16,
        partition_id: u32,
        attempt: InputAttemptIdentifier,
    ) {
        if !self.is_known_input(&attempt) {
            return;
        }
        let handle = MapHostRef::new(format!("{host}:{port}"), partition_id);
        let mut state = self.inner.state.lock();
        self.record_event_received(&mut state);

        if state.is_input_finished(attempt.input_index()) {
            debug!(%attempt, "Ignoring output of finished input");
            return;
        }
        if attempt.can_retrieve_input_in_chunks() {
            match state.tracker.check_attempt(&attempt) {
                AttemptCheck::Accepted => {}
                AttemptCheck::Superseded { tracked } => {
                    warn!(%attempt, tracked_attempt = tracked, "Ignoring output of superseded attempt");
                    return;
                }
                AttemptCheck::Conflict {
                    tracked,
                    chunks_seen,
                } => {
                    self.report_exception(ShuffleError::StaleAttempt {
                        attempt: attempt.to_string(),
                        tracked_attempt: tracked,
                        chunks_seen,
                    });
                    return;
                }
            }
        }

        self.inner.path_to_identifier.insert(
            path_identifier(attempt.path_component(), partition_id),
            attempt.clone(),
        );
        let became_pending = state.registry.add_known_map(handle, attempt);
        drop(state);

        if became_pending {
            self.inner.state_changed.notify_waiters();
        }
    }

    /// Mark an attempt's output as no longer needed.
    pub fn obsolete_input(&self, attempt: InputAttemptIdentifier) {
        info!(%attempt, "Adding obsolete input");
        let mut state = self.inner.state.lock();
        let has_progress = state
            .tracker
            .get(attempt.input_index())
            .map_or(false, |p| p.chunks_seen() > 0);
        if has_progress {
            self.report_exception(ShuffleError::ObsoleteAfterProgress {
                attempt: attempt.to_string(),
            });
            return;
        }
        state.registry.mark_obsolete(attempt);
    }

    /// Forget every known host and output, e.g. when the consumer restarts
    /// the shuffle from scratch.
    pub fn reset(&self) {
        self.inner.state.lock().registry.reset();
        self.inner.path_to_identifier.clear();
        info!(source = %self.inner.config.source_name, "Known map outputs reset");
    }

    pub fn get_identifier_for_fetched_output(
        &self,
        path: &str,
        partition_id: u32,
    ) -> Option<InputAttemptIdentifier> {
        self.inner
            .path_to_identifier
            .get(&path_identifier(path, partition_id))
            .map(|entry| entry.value().clone())
    }

    /// Record that an output announcement arrived.
    pub fn update_event_received_time(&self) {
        let mut state = self.inner.state.lock();
        self.record_event_received(&mut state);
    }

    /// Longest map runtime seen by the caller; widens the stall baseline of
    /// the health check.
    pub fn inform_max_map_runtime(&self, runtime: Duration) {
        let mut state = self.inner.state.lock();
        if runtime > state.max_map_runtime {
            state.max_map_runtime = runtime;
        }
    }

    /////////////////////////////////////////////////////////////////////////
    // Host hand-out
    /////////////////////////////////////////////////////////////////////////

    /// Wait for a pending host and mark it busy. Returns `None` once every
    /// input is fetched or the scheduler is shut down.
    pub async fn get_host(&self) -> Option<MapHostRef> {
        let inner = &self.inner;
        loop {
            let notified = inner.state_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if inner.shutdown.is_cancelled() {
                return None;
            }
            {
                let mut state = inner.state.lock();
                if let Some(host) = state.registry.take_pending(Instant::now()) {
                    return Some(host);
                }
                if state.remaining == 0 {
                    return None;
                }
                debug!(pending = state.registry.num_pending(), "Waiting for a pending host");
            }

            tokio::select! {
                _ = inner.shutdown.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }

    /// Deduplicated outputs of `host` for one fetch task.
    pub fn get_maps_for_host(&self, host: &MapHostRef) -> Vec<InputAttemptIdentifier> {
        let max_outputs = self.inner.config.max_task_output_at_once();
        let mut state = self.inner.state.lock();
        let SchedulerState {
            registry, finished, ..
        } = &mut *state;
        registry.get_maps_for_host(host, max_outputs, |index| {
            finished.contains(index as usize)
        })
    }

    /// A fetch task is done with `host`.
    pub fn free_host(&self, host: &MapHostRef) {
        let (busy_for, became_pending) = self
            .inner
            .state
            .lock()
            .registry
            .free_host(host, Instant::now());
        if became_pending {
            self.inner.state_changed.notify_waiters();
        }
        info!(
            host = %host,
            busy_ms = busy_for.map(|d| d.as_millis() as u64),
            "Host freed"
        );
    }

    /// Requeue an output the fetcher could not get to.
    pub fn put_back_known_map_output(&self, host: &MapHostRef, attempt: InputAttemptIdentifier) {
        self.inner.state.lock().registry.put_back(host, attempt);
    }

    /////////////////////////////////////////////////////////////////////////
    // Fetch results
    /////////////////////////////////////////////////////////////////////////

    /// Report a completed fetch. `output` is `None` when the input had no
    /// data for this partition and only needs to be marked done.
    ///
    /// Returns an error only if the merge sink refused the output.
    pub fn copy_succeeded(
        &self,
        attempt: &InputAttemptIdentifier,
        host: Option<&MapHostRef>,
        bytes_compressed: u64,
        bytes_decompressed: u64,
        elapsed: Duration,
        output: Option<MapOutput>,
    ) -> Result<()> {
        let inner = &self.inner;
        if !self.is_known_input(attempt) {
            if let Some(output) = output {
                inner.merge.abort(output);
            }
            return Ok(());
        }
        let index = attempt.input_index();
        let mut state = inner.state.lock();

        if state.is_input_finished(index) {
            warn!(%attempt, "Duplicate fetch of input no longer needs to be fetched");
            if let Some(output) = output {
                inner.merge.abort(output);
            }
            return Ok(());
        }

        if attempt.can_retrieve_input_in_chunks() {
            let rejected = match state.tracker.check_attempt(attempt) {
                AttemptCheck::Accepted => None,
                AttemptCheck::Superseded { tracked } => Some((tracked, 0)),
                AttemptCheck::Conflict {
                    tracked,
                    chunks_seen,
                } => Some((tracked, chunks_seen)),
            };
            if let Some((tracked, chunks_seen)) = rejected {
                let chunks_seen = state
                    .tracker
                    .get(index)
                    .map_or(chunks_seen, |p| p.chunks_seen());
                self.report_exception(ShuffleError::StaleAttempt {
                    attempt: attempt.to_string(),
                    tracked_attempt: tracked,
                    chunks_seen,
                });
                if let Some(output) = output {
                    inner.merge.abort(output);
                }
                return Ok(());
            }
        }

        match output {
            Some(output) => {
                state.failure_counts.remove(attempt);
                if let Some(host) = host {
                    state.host_failures.remove(host.identifier());
                }
                let kind = output.kind;
                inner.merge.commit(output)?;
                info!(
                    %attempt,
                    elapsed_ms = elapsed.as_millis() as u64,
                    bytes_compressed,
                    bytes_decompressed,
                    ?kind,
                    "Completed fetch"
                );
                state.counters.record_output(kind, bytes_compressed);
            }
            None => state.counters.skipped_inputs += 1,
        }

        if attempt.can_retrieve_input_in_chunks() {
            match state.tracker.record(attempt) {
                Ok(done) => {
                    state.counters.fetched_spills += 1;
                    if done {
                        state.finish_input(index);
                    }
                }
                Err(e) => {
                    self.report_exception(e);
                    return Ok(());
                }
            }
        } else {
            state.finish_input(index);
            state.counters.fetched_spills += 1;
        }

        state.last_progress = Instant::now();
        state.counters.bytes_compressed += bytes_compressed;
        state.counters.bytes_decompressed += bytes_decompressed;
        self.log_progress(&state);

        let all_done = state.remaining == 0;
        drop(state);
        if all_done {
            info!(source = %inner.config.source_name, "All inputs fetched");
            inner.state_changed.notify_waiters();
        }
        Ok(())
    }

    /// Report a failed fetch of `attempt` from `host`.
    pub fn copy_failed(
        &self,
        attempt: &InputAttemptIdentifier,
        host: &MapHostRef,
        read_error: bool,
        connect_error: bool,
    ) {
        if !self.is_known_input(attempt) {
            return;
        }
        let inner = &self.inner;
        let now = Instant::now();
        let mut state = inner.state.lock();

        state.registry.penalize(host);
        let failures = {
            let count = state.failure_counts.entry(attempt.clone()).or_insert(0);
            *count += 1;
            *count
        };
        *state
            .host_failures
            .entry(host.identifier().to_string())
            .or_insert(0) += 1;

        if attempt.can_retrieve_input_in_chunks() {
            if let Some(tracked) = state.tracker.tracked_attempt(attempt.input_index()) {
                if tracked > attempt.attempt_number() {
                    let chunks_seen = state
                        .tracker
                        .get(attempt.input_index())
                        .map_or(0, |p| p.chunks_seen());
                    self.report_exception(ShuffleError::StaleAttempt {
                        attempt: attempt.to_string(),
                        tracked_attempt: tracked,
                        chunks_seen,
                    });
                }
            }
        }

        if failures >= inner.abort_failure_limit {
            // The map may be re-run upstream; give up on this attempt.
            self.report_exception(ShuffleError::TooManyFetchFailures {
                failures,
                attempt: task_attempt_identifier(
                    &inner.config.source_name,
                    attempt.input_index(),
                    attempt.attempt_number(),
                ),
            });
        }

        state.counters.failed_fetches += 1;
        self.check_and_inform_upstream(failures, attempt, read_error, connect_error);
        self.check_health(&state, now);

        let delay = penalty_delay(failures);
        state.penalties.schedule(host.identifier(), now + delay);
        drop(state);
        inner.penalty_added.notify_one();

        debug!(
            %attempt,
            host = %host,
            failures,
            penalty_ms = delay.as_millis() as u64,
            "Fetch failed, host penalized"
        );
    }

    /// A local problem (disk, memory) that makes the shuffle impossible.
    pub fn report_local_error(&self, error: std::io::Error) {
        self.report_exception(ShuffleError::Local(error));
    }

    pub fn record_fetch_error(&self, kind: FetchErrorKind) {
        self.inner.state.lock().counters.record_fetch_error(kind);
    }

    /////////////////////////////////////////////////////////////////////////
    // Inspection and shutdown
    /////////////////////////////////////////////////////////////////////////

    pub fn is_done(&self) -> bool {
        self.inner.state.lock().remaining == 0
    }

    pub fn remaining_inputs(&self) -> usize {
        self.inner.state.lock().remaining
    }

    pub fn counters(&self) -> ShuffleCounters {
        self.inner.state.lock().counters.clone()
    }

    pub fn num_inputs(&self) -> usize {
        self.inner.num_inputs
    }

    pub fn num_fetchers(&self) -> usize {
        self.inner.num_fetchers
    }

    pub fn num_running_fetchers(&self) -> usize {
        self.inner.running_fetchers.load(Ordering::SeqCst)
    }

    pub fn host_state(&self, host: &MapHostRef) -> Option<HostState> {
        self.inner.state.lock().registry.host_state(host)
    }

    /// Failures recorded for `attempt` since its last success.
    pub fn failure_count(&self, attempt: &InputAttemptIdentifier) -> u32 {
        self.inner
            .state
            .lock()
            .failure_counts
            .get(attempt)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop the shuffle: wake every waiter, cancel running fetch tasks and
    /// stop the penalty referee. Calling it more than once is harmless.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.shutdown.cancel();
        inner.state_changed.notify_waiters();

        let referee = inner.referee.lock().take();
        if let Some(referee) = referee {
            if let Err(e) = referee.await {
                warn!(error = %e, "Penalty referee ended abnormally");
            }
        }
        info!(source = %inner.config.source_name, "Shuffle scheduler closed");
    }

    /////////////////////////////////////////////////////////////////////////
    // Internals
    /////////////////////////////////////////////////////////////////////////

    fn report_exception(&self, error: ShuffleError) {
        error!(
            source = %self.inner.config.source_name,
            protocol_violation = error.is_protocol_violation(),
            %error,
            "Reporting exception for input"
        );
        self.inner.events.report_exception(error);
    }

    // Indices at or past `num_inputs` would corrupt the remaining count.
    fn is_known_input(&self, attempt: &InputAttemptIdentifier) -> bool {
        let num_inputs = self.inner.num_inputs;
        if (attempt.input_index() as usize) < num_inputs {
            return true;
        }
        self.report_exception(ShuffleError::Inconsistent(format!(
            "{attempt} is outside the {num_inputs} inputs of this shuffle"
        )));
        false
    }

    fn record_event_received(&self, state: &mut SchedulerState) {
        let relative_ms = self.inner.start.elapsed().as_millis() as u64;
        state.counters.record_event_received(relative_ms);
    }

    // Notify upstream after every read or connect error when configured to,
    // and otherwise after every `fetch_failures_limit` failures.
    fn check_and_inform_upstream(
        &self,
        failures: u32,
        attempt: &InputAttemptIdentifier,
        read_error: bool,
        connect_error: bool,
    ) {
        let config = &self.inner.config;
        let immediate = config.notify_read_error && (read_error || connect_error);
        if !immediate && failures % config.fetch_failures_limit != 0 {
            return;
        }
        let task_attempt = task_attempt_identifier(
            &config.source_name,
            attempt.input_index(),
            attempt.attempt_number(),
        );
        info!(%attempt, %task_attempt, failures, "Reporting fetch failure upstream");
        self.inner.events.send_events(vec![InputReadErrorEvent {
            diagnostics: format!("Fetch failure for {task_attempt} to jobtracker."),
            input_index: attempt.input_index(),
            attempt_number: attempt.attempt_number(),
        }]);
    }

    fn check_health(&self, state: &SchedulerState, now: Instant) {
        let inner = &self.inner;
        let done_inputs = inner.num_inputs - state.remaining;
        let verdict = health::evaluate(&HealthInputs {
            total_failures: state.counters.failed_fetches,
            done_inputs,
            num_inputs: inner.num_inputs,
            failed_attempts: state.failure_counts.len(),
            max_failed_unique_fetches: inner.max_failed_unique_fetches,
            stall_duration: now - state.last_progress,
            progress_duration: state.last_progress - inner.start,
            max_map_runtime: state.max_map_runtime,
        });
        if verdict.should_abort {
            error!(
                failed_attempts = state.failure_counts.len(),
                pending_inputs = state.remaining,
                healthy = verdict.healthy,
                progressed_enough = verdict.progressed_enough,
                stalled = verdict.stalled,
                "Shuffle failed with too many fetch failures and insufficient progress"
            );
            self.report_exception(ShuffleError::Unhealthy {
                failed_attempts: state.failure_counts.len(),
                pending_inputs: state.remaining,
                healthy: verdict.healthy,
                progressed_enough: verdict.progressed_enough,
                stalled: verdict.stalled,
            });
        }
    }

    fn log_progress(&self, state: &SchedulerState) {
        let inner = &self.inner;
        let rate = transfer_rate_mbps(state.counters.bytes_compressed, inner.start.elapsed());
        info!(
            source = %inner.config.source_name,
            done = inner.num_inputs - state.remaining,
            spills_fetched = state.counters.fetched_spills,
            total = inner.num_inputs,
            "copy progress, transfer rate {rate:.2} MB/s"
        );
    }
}
