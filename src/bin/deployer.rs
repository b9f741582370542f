//! The deployer daemon: accepts code payloads over HTTP and runs each one
//! inside a fresh sandbox container.

use std::{path::Path, sync::Arc};

use clap::Parser;
use matryoshka::{engine::DockerEngine, orchestrator::Orchestrator, server, Config};
use stacked_errors::{Result, StackableErr};
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_FILE: &str = "~/.matryoshka/config.toml";

/// Runs the deployer HTTP daemon
#[derive(Parser, Debug)]
#[command(about, version)]
struct Args {
    /// Path to the configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config_file: String,
}

fn expand_home(path: &str) -> String {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => Path::new(&home).join(rest).to_string_lossy().into_owned(),
        _ => path.to_owned(),
    }
}

async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).ok();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = async {
            match sigterm.as_mut() {
                Some(sigterm) => {
                    sigterm.recv().await;
                }
                None => futures::future::pending().await,
            }
        } => {}
    }
    info!("received signal, shutting down...");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,bollard=warn,hyper_util=info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load_or_default(expand_home(&args.config_file)).await?;
    let engine = DockerEngine::connect(&config).stack()?;
    let orchestrator = Orchestrator::new(Arc::new(engine));
    server::serve(&config, orchestrator, shutdown_signal()).await
}
