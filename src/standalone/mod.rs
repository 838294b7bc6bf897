use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::config::ShuffleConfig;

pub mod engine;

/// Simulate a shuffle: every input is served by one of `hosts` simulated
/// hosts, some of which fail fetches at random.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// JSON file with scheduler settings
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Number of map outputs to fetch
    #[arg(short = 'n', long, default_value_t = 64)]
    pub inputs: u32,

    /// Number of hosts serving them
    #[arg(long, default_value_t = 4)]
    pub hosts: u32,

    /// Chunks per input; more than one makes every input pipelined
    #[arg(long, default_value_t = 1)]
    pub spills: u32,

    /// Overrides `parallel_copies` from the config
    #[arg(short, long)]
    pub parallel_copies: Option<usize>,

    /// Number of hosts that fail fetches at random
    #[arg(long, default_value_t = 0)]
    pub flaky_hosts: u32,

    /// Probability that a fetch from a flaky host fails
    #[arg(long, default_value_t = 0.3)]
    pub failure_rate: f64,

    /// Seed for host selection and simulated failures
    #[arg(long)]
    pub seed: Option<u64>,

    /// Simulated transfer time per output, in milliseconds
    #[arg(long, default_value_t = 5)]
    pub latency_ms: u64,

    /// Size of every simulated output, in bytes
    #[arg(long, default_value_t = 4096)]
    pub output_bytes: usize,

    /// Longest map runtime to report to the scheduler, in milliseconds
    #[arg(long, default_value_t = 10_000)]
    pub map_runtime_ms: u64,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub config: ShuffleConfig,
    pub inputs: u32,
    pub hosts: u32,
    pub spills: u32,
    pub flaky_hosts: u32,
    pub failure_rate: f64,
    pub latency: Duration,
    pub output_bytes: usize,
    pub map_runtime: Duration,
}

impl Job {
    pub fn from_args(args: Args) -> anyhow::Result<Self> {
        let mut config = match &args.config {
            Some(path) => ShuffleConfig::from_json_file(path)?,
            None => ShuffleConfig::default(),
        };
        if let Some(parallel_copies) = args.parallel_copies {
            config.parallel_copies = parallel_copies;
        }
        if args.seed.is_some() {
            config.rng_seed = args.seed;
        }
        config.validate()?;

        anyhow::ensure!(args.hosts > 0, "at least one host is required");
        anyhow::ensure!(args.spills > 0, "at least one spill per input is required");
        anyhow::ensure!(
            (0.0..=1.0).contains(&args.failure_rate),
            "failure rate must be between 0 and 1"
        );

        Ok(Self {
            config,
            inputs: args.inputs,
            hosts: args.hosts,
            spills: args.spills,
            flaky_hosts: args.flaky_hosts.min(args.hosts),
            failure_rate: args.failure_rate,
            latency: Duration::from_millis(args.latency_ms),
            output_bytes: args.output_bytes,
            map_runtime: Duration::from_millis(args.map_runtime_ms),
        })
    }

    /// Host name of host number `host`. Host 0 is the local host.
    pub fn host_name(&self, host: u32) -> String {
        if host == 0 {
            self.config.local_hostname.clone()
        } else {
            format!("host-{host}")
        }
    }

    /// The last `flaky_hosts` hosts are flaky.
    pub fn is_flaky(&self, host: u32) -> bool {
        host >= self.hosts - self.flaky_hosts
    }
}
