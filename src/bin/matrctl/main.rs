//! `matrctl`: command line client for deploying code payloads and listing
//! sandbox images against a local container engine.

mod output;
mod payload;

use std::{process::ExitCode, sync::Arc};

use clap::{Parser, Subcommand, ValueEnum};
use matryoshka::{engine::DockerEngine, orchestrator::Orchestrator, Config};
use stacked_errors::{Result, StackableErr};
use tracing_subscriber::EnvFilter;

/// Exit code for bad invocations, distinct from runtime failures.
const USAGE_ERROR: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "matrctl", about, version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run code for a given programming language
    RunCode(RunCodeArgs),
    /// List available images for a given programming language, operating
    /// system, or architecture
    ListImages(ListImagesArgs),
}

#[derive(clap::Args, Debug, Default)]
pub struct RunCodeArgs {
    /// JSON formatted payload data, inline or `@path` to read from a file
    #[arg(long, conflicts_with_all = ["filepath", "directory", "content"])]
    pub data: Option<String>,
    /// Programming language of the content
    #[arg(long)]
    pub language: Option<String>,
    /// Operating system to run the code on
    #[arg(long)]
    pub os: Option<String>,
    /// Architecture to run the code on
    #[arg(long)]
    pub arch: Option<String>,
    /// Location of file that contains the content
    #[arg(long)]
    pub filepath: Option<String>,
    /// Directory tree to include in the payload, one record per regular file
    #[arg(long)]
    pub directory: Option<String>,
    /// Code to run
    #[arg(long)]
    pub content: Option<String>,
    /// Run timeout in seconds
    #[arg(long, default_value_t = 30)]
    pub timeout: i64,
    /// Set the output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Plain)]
    pub output_format: OutputFormat,
    /// Command to run before the build stage, repeatable
    #[arg(long = "pre-build-command")]
    pub pre_build_commands: Vec<String>,
    /// Command to run after the build stage, repeatable
    #[arg(long = "post-build-command")]
    pub post_build_commands: Vec<String>,
    /// Command to run before the run stage, repeatable
    #[arg(long = "pre-run-command")]
    pub pre_run_commands: Vec<String>,
    /// Command to run after the run stage, repeatable
    #[arg(long = "post-run-command")]
    pub post_run_commands: Vec<String>,
}

#[derive(clap::Args, Debug, Default)]
pub struct ListImagesArgs {
    /// Programming language to filter images by
    #[arg(long, default_value = "")]
    pub language: String,
    /// Operating system to filter images by
    #[arg(long, default_value = "")]
    pub os: String,
    /// Architecture to filter images by
    #[arg(long, default_value = "")]
    pub arch: String,
    /// Set the output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Plain)]
    pub output_format: OutputFormat,
}

#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Plain,
    Json,
}

fn connect() -> Result<Orchestrator> {
    let engine = DockerEngine::connect(&Config::default()).stack()?;
    Ok(Orchestrator::new(Arc::new(engine)))
}

async fn run_code(args: RunCodeArgs) -> ExitCode {
    let payload = match payload::build_payload(&args) {
        Ok(payload) => payload,
        Err(err) => {
            eprintln!("run-code: {err}");
            return ExitCode::from(USAGE_ERROR);
        }
    };
    let orchestrator = match connect() {
        Ok(orchestrator) => orchestrator,
        Err(err) => {
            eprintln!("run-code: {err}");
            return ExitCode::FAILURE;
        }
    };
    let result = match orchestrator.create_deployment(&payload).await {
        Ok(result) => result,
        Err(err) => {
            eprintln!("run-code: {err}");
            return ExitCode::FAILURE;
        }
    };
    let rendered = match args.output_format {
        OutputFormat::Plain => Ok(output::render_result_plain(&result)),
        OutputFormat::Json => output::render_json(&result),
    };
    match rendered {
        Ok(rendered) => print!("{rendered}"),
        Err(err) => {
            eprintln!("run-code: {err}");
            return ExitCode::FAILURE;
        }
    }
    if !result.error.is_empty() {
        eprintln!("run-code: {}", result.error);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn list_images(args: ListImagesArgs) -> ExitCode {
    let orchestrator = match connect() {
        Ok(orchestrator) => orchestrator,
        Err(err) => {
            eprintln!("list-images: {err}");
            return ExitCode::FAILURE;
        }
    };
    let images = match orchestrator
        .list_images(&args.language, &args.os, &args.arch)
        .await
    {
        Ok(images) => images,
        Err(err) => {
            eprintln!("list-images: {err}");
            return ExitCode::FAILURE;
        }
    };
    let rendered = match args.output_format {
        OutputFormat::Plain => Ok(output::render_images_plain(&images)),
        OutputFormat::Json => output::render_json(&images),
    };
    match rendered {
        Ok(rendered) => {
            print!("{rendered}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("list-images: {err}");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::RunCode(args) => run_code(args).await,
        Command::ListImages(args) => list_images(args).await,
    }
}
