//! `protosync` - fetch upstream proto definitions, rewrite them, and run the
//! proto compiler over the result.
//!
//! One command, no subcommands. Settings come from `protosync.toml`; flags
//! override the file. On success the run report is printed to stdout as
//! JSON. Failures exit with a code that identifies the failing stage.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, Level};

use protosync_core::{
    init_tracing, ConfigOverrides, FetchPolicy, Pipeline, PipelineError, ProtosyncConfig,
    RunReport, TargetLanguage, DEFAULT_CONFIG_FILE,
};

#[derive(Parser, Debug)]
#[command(name = "protosync")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Sync external proto definitions and generate code", long_about = None)]
struct Cli {
    /// Config file
    #[arg(short, long, env = "PROTOSYNC_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Directory holding repository caches
    #[arg(long, env = "PROTOSYNC_REPO_ROOT")]
    repo_root: Option<PathBuf>,

    /// Target language (repeatable), e.g. python, java, cpp
    #[arg(short = 'l', long = "target-language")]
    target_languages: Vec<TargetLanguage>,

    /// Where the compiler writes generated code
    #[arg(short, long, env = "PROTOSYNC_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Staging directory (owned and cleared by protosync)
    #[arg(long)]
    staging_dir: Option<PathBuf>,

    /// fail-fast or best-effort
    #[arg(long)]
    fetch_policy: Option<FetchPolicy>,

    /// Reject repos that track "latest"
    #[arg(long)]
    require_pinned: bool,

    /// Use existing repository caches without touching the network
    #[arg(long)]
    offline: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            repo_root: self.repo_root.clone(),
            output_dir: self.output_dir.clone(),
            staging_dir: self.staging_dir.clone(),
            target_languages: self.target_languages.clone(),
            fetch_policy: self.fetch_policy,
            require_pinned: self.require_pinned,
        }
    }
}

async fn run(cli: &Cli) -> Result<RunReport, PipelineError> {
    let config = ProtosyncConfig::load(&cli.config, &cli.overrides())?;
    let pipeline = Pipeline::from_config(config, cli.offline)?;
    pipeline.run().await
}

fn print_report(report: &RunReport) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(report).context("failed to serialize run report")?;
    println!("{json}");
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    match run(&cli).await {
        Ok(report) => match print_report(&report) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!("{err:#}");
                ExitCode::from(1)
            }
        },
        Err(err) => report_failure(&err),
    }
}

/// Log a failed run once, through the subscriber, and pick its exit code.
fn report_failure(err: &PipelineError) -> ExitCode {
    error!(exit_code = err.exit_code(), "{err}");
    ExitCode::from(err.exit_code())
}
