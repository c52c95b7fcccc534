use anyhow::Result;
use clap::Parser;
use jobstore::cli::{self, RootArgs};
use tracing_subscriber::EnvFilter;

/// Log filter variable, e.g. `JOBSTORE_LOG=jobstore=debug`.
const LOG_ENV: &str = "JOBSTORE_LOG";

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    cli::run(RootArgs::parse())
}
