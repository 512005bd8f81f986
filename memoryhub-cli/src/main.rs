use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use memoryhub_core::{MemoryHubConfig, MemoryHub};

mod commands;
mod output;

use output::OutputFormat;

#[derive(Parser)]
#[command(name = "memoryhub")]
#[command(about = "Maintenance CLI for the memoryhub store")]
#[command(version, long_about = None)]
struct Cli {
    /// Root directory of the store.
    #[arg(short = 'd', long, value_name = "PATH", default_value = "./memoryhub_data")]
    data_path: PathBuf,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Human)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LayerArg {
    Application,
    Archive,
}

impl LayerArg {
    fn as_str(self) -> &'static str {
        match self {
            LayerArg::Application => "application",
            LayerArg::Archive => "archive",
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Rebuild the sidecar index and tag pre-index for one or both log layers.
    BuildIndex {
        #[arg(long, value_enum)]
        layer: Option<LayerArg>,
        #[arg(long)]
        force: bool,
    },
    /// Print store-wide counters and recall-latency aggregates.
    Stats {
        #[arg(long)]
        verbose: bool,
    },
    /// Force-flush pending recall-count updates.
    Flush,
    /// Print per-tier file sizes and record counts.
    Info,
    /// Ingest synthetic records then issue recalls, checking the latency target.
    Benchmark {
        #[arg(long, default_value_t = 1000)]
        memories: usize,
        #[arg(long, default_value_t = 100)]
        recalls: usize,
    },
}

/// Exit code for a SIGINT-interrupted run, per the POSIX 128+signal convention.
const SIGINT_EXIT_CODE: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

    let cli = Cli::parse();
    tokio::select! {
        result = run(cli) => match result {
            Ok(code) => code,
            Err(err) => {
                eprintln!("error: {err:#}");
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted by ctrl-c");
            ExitCode::from(SIGINT_EXIT_CODE)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = MemoryHubConfig {
        data_path: cli.data_path,
        ..Default::default()
    };
    let hub = MemoryHub::open(config).await?;

    match cli.command {
        Commands::BuildIndex { layer, force } => {
            let reports = commands::build_index(&hub, layer.map(LayerArg::as_str), force).await?;
            for report in &reports {
                cli.format.print(report)?;
            }
        }
        Commands::Stats { verbose } => {
            let report = commands::stats(&hub).await?;
            if verbose {
                tracing::info!("verbose stats requested");
            }
            cli.format.print(&report)?;
        }
        Commands::Flush => {
            let report = commands::flush(&hub).await?;
            cli.format.print(&report)?;
        }
        Commands::Info => {
            let report = commands::info(&hub).await?;
            cli.format.print(&report)?;
        }
        Commands::Benchmark { memories, recalls } => {
            let report = commands::benchmark(&hub, memories, recalls).await?;
            cli.format.print(&report)?;
            hub.close().await?;
            return Ok(if report.within_target {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            });
        }
    }

    hub.close().await?;
    Ok(ExitCode::SUCCESS)
}
