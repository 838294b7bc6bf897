use anyhow::*;
use clap::Parser;
use shufflite::standalone::{engine::run_standalone, Args, Job};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let job = Job::from_args(Args::parse())?;
    let summary = run_standalone(job).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if let Some(error) = summary.error {
        bail!("shuffle failed: {error}");
    }
    ensure!(summary.succeeded, "shuffle stopped before every input was fetched");
    Ok(())
}
