//! The in-container agent: reads line-delimited bundles on stdin, builds and
//! runs them, and answers with exactly one result line per bundle on stdout.
//! The orchestrator runs this as the container entrypoint in one-shot mode.

use clap::Parser;
use matryoshka::runner;
use stacked_errors::Result;
use tracing_subscriber::EnvFilter;

/// Runs the sandbox agent
#[derive(Parser, Debug)]
#[command(about, version)]
struct Args {
    /// Keep processing bundles until stdin closes instead of exiting after
    /// the first one
    #[arg(long)]
    daemon: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries result lines only, all logging goes to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    runner::serve(!args.daemon).await
}
