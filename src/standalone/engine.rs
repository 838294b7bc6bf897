use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use fnv::FnvHashSet;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::counters::{FetchErrorKind, ShuffleCounters};
use crate::events::{ChannelEventSink, ShuffleEvent};
use crate::fetch::{FetchTask, Fetcher};
use crate::merge::{InMemoryMergeSink, MapOutput, MapOutputKind};
use crate::standalone::Job;
use crate::{InputAttemptIdentifier, ShuffleScheduler};

// Outputs above this size are spilled to disk by the simulated fetcher.
const IN_MEMORY_LIMIT_BYTES: usize = 64 * 1024;

/// Pretends to pull outputs over the network. Outputs of the local host are
/// read from "disk" and never fail; flaky hosts fail with a fixed probability.
pub struct SimulatedFetcher {
    flaky: FnvHashSet<String>,
    failure_rate: f64,
    latency: Duration,
    output_bytes: usize,
    rng: Mutex<StdRng>,
}

impl SimulatedFetcher {
    pub fn new(job: &Job) -> Self {
        let flaky = (0..job.hosts)
            .filter(|&h| job.is_flaky(h))
            .map(|h| format!("{}:{}", job.host_name(h), job.config.shuffle_port))
            .collect();
        let rng = match job.config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
            None => StdRng::from_entropy(),
        };
        Self {
            flaky,
            failure_rate: job.failure_rate,
            latency: job.latency,
            output_bytes: job.output_bytes,
            rng: Mutex::new(rng),
        }
    }

    fn fails(&self, host_port: &str) -> bool {
        self.flaky.contains(host_port) && self.rng.lock().gen_bool(self.failure_rate)
    }
}

#[async_trait]
impl Fetcher for SimulatedFetcher {
    async fn fetch(&self, task: FetchTask, scheduler: ShuffleScheduler) -> crate::Result<()> {
        let FetchTask {
            id,
            host,
            attempts,
            params,
            cancel,
        } = task;
        let local = params.is_local(&host);

        if !local && self.fails(host.host_port()) {
            warn!(fetch_id = %id, host = %host, "Failed to connect");
            for attempt in attempts {
                scheduler.record_fetch_error(FetchErrorKind::Connection);
                scheduler.copy_failed(&attempt, &host, false, true);
                scheduler.put_back_known_map_output(&host, attempt);
            }
            return Ok(());
        }

        let mut queue = attempts.into_iter();
        while let Some(attempt) = queue.next() {
            let started = Instant::now();
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(fetch_id = %id, "Fetch cancelled, putting back remaining outputs");
                    scheduler.put_back_known_map_output(&host, attempt);
                    for rest in queue {
                        scheduler.put_back_known_map_output(&host, rest);
                    }
                    return Ok(());
                }
                _ = sleep(self.latency) => {}
            }

            // The serving side names the output by path; map it back the way
            // a real fetcher checks the response header.
            let resolved =
                scheduler.get_identifier_for_fetched_output(attempt.path_component(), host.partition_id());
            if resolved.is_none() {
                scheduler.record_fetch_error(FetchErrorKind::BadId);
                scheduler.copy_failed(&attempt, &host, true, false);
                scheduler.put_back_known_map_output(&host, attempt);
                queue.for_each(|rest| scheduler.put_back_known_map_output(&host, rest));
                return Ok(());
            }

            if !local && self.fails(host.host_port()) {
                scheduler.record_fetch_error(FetchErrorKind::Io);
                scheduler.copy_failed(&attempt, &host, true, false);
                scheduler.put_back_known_map_output(&host, attempt);
                queue.for_each(|rest| scheduler.put_back_known_map_output(&host, rest));
                return Ok(());
            }

            let size = self.output_bytes;
            let kind = if local {
                MapOutputKind::DiskDirect
            } else if size > IN_MEMORY_LIMIT_BYTES {
                MapOutputKind::Disk
            } else {
                MapOutputKind::Memory
            };
            let data = Bytes::from(vec![attempt.input_index() as u8; size]);
            let output = MapOutput::new(attempt.clone(), kind, data);
            scheduler.copy_succeeded(
                &attempt,
                Some(&host),
                size as u64,
                size as u64,
                started.elapsed(),
                Some(output),
            )?;
        }
        Ok(())
    }
}

/// What a simulated run did, printed as JSON by the binary.
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub succeeded: bool,
    pub error: Option<String>,
    pub elapsed_ms: u64,
    pub read_error_events: usize,
    pub committed_outputs: usize,
    pub committed_bytes: u64,
    pub aborted_outputs: u64,
    pub counters: ShuffleCounters,
}

/// Announce every output of `job` to `scheduler`, spread round-robin over
/// the hosts.
pub fn announce_outputs(job: &Job, scheduler: &ShuffleScheduler) {
    let port = job.config.shuffle_port;
    for input in 0..job.inputs {
        let host = job.host_name(input % job.hosts);
        let path = format!("attempt_{input:06}_0");
        if job.spills <= 1 {
            scheduler.add_known_map_output(&host, port, 0, InputAttemptIdentifier::new(input, 0, &path));
            continue;
        }
        for spill in 0..job.spills {
            // Every chunk gets its own path on the serving side.
            let attempt = InputAttemptIdentifier::pipelined(
                input,
                0,
                format!("{path}_spill_{spill}"),
                spill,
                spill + 1 == job.spills,
            );
            scheduler.add_known_map_output(&host, port, 0, attempt);
        }
    }
}

/// Run a whole simulated shuffle. A fatal error stops the shuffle and is
/// reported in the summary rather than returned.
pub async fn run_standalone(job: Job) -> Result<Summary> {
    let (events, mut rx) = ChannelEventSink::new();
    let merge = Arc::new(InMemoryMergeSink::new());
    let fetcher = Arc::new(SimulatedFetcher::new(&job));
    let scheduler = ShuffleScheduler::new(
        job.config.clone(),
        job.inputs as usize,
        fetcher,
        merge.clone(),
        Arc::new(events),
    )?;

    let started = Instant::now();
    scheduler.inform_max_map_runtime(job.map_runtime);
    announce_outputs(&job, &scheduler);

    let mut runner = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run().await })
    };

    let mut fatal: Option<String> = None;
    let mut read_error_events = 0;
    let run_result = loop {
        tokio::select! {
            result = &mut runner => break result,
            Some(event) = rx.recv() => match event {
                ShuffleEvent::Fatal(e) => {
                    error!(error = %e, "Shuffle failed");
                    if fatal.is_none() {
                        fatal = Some(e.to_string());
                    }
                    scheduler.close().await;
                }
                ShuffleEvent::ReadError(event) => {
                    debug!(input = event.input_index, attempt = event.attempt_number, "Read error reported");
                    read_error_events += 1;
                }
            },
        }
    };
    scheduler.close().await;
    run_result??;

    while let Ok(event) = rx.try_recv() {
        match event {
            ShuffleEvent::Fatal(e) if fatal.is_none() => fatal = Some(e.to_string()),
            ShuffleEvent::Fatal(_) => {}
            ShuffleEvent::ReadError(_) => read_error_events += 1,
        }
    }

    let summary = Summary {
        succeeded: fatal.is_none() && scheduler.is_done(),
        error: fatal,
        elapsed_ms: started.elapsed().as_millis() as u64,
        read_error_events,
        committed_outputs: merge.committed().len(),
        committed_bytes: merge.committed_bytes(),
        aborted_outputs: merge.aborted(),
        counters: scheduler.counters(),
    };
    info!(
        succeeded = summary.succeeded,
        elapsed_ms = summary.elapsed_ms,
        "Standalone shuffle finished"
    );
    Ok(summary)
}
