#![forbid(unsafe_code)]

mod cmd;
mod output;

use clap::{Parser, Subcommand};
use output::OutputMode;
use std::env;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "strata: CDC-to-analytics synchronization",
    long_about = None
)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    /// Derive the output mode from flags.
    fn output_mode(&self) -> OutputMode {
        if self.json {
            OutputMode::Json
        } else {
            OutputMode::Human
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        next_help_heading = "Lifecycle",
        about = "Initialize a strata store",
        long_about = "Initialize a strata store in the current directory.",
        after_help = "EXAMPLES:\n    # Initialize a store in the current directory\n    st init\n\n    # Reinitialize, keeping nothing\n    st init --force"
    )]
    Init(cmd::init::InitArgs),

    #[command(
        next_help_heading = "Pipeline",
        about = "Ingest raw change records",
        long_about = "Normalize NDJSON change records from a configured source and apply them to the store.",
        after_help = "EXAMPLES:\n    # Ingest a batch file of user changes\n    st ingest --source users --file users.ndjson\n\n    # Pipe records from a connector\n    connector-dump | st ingest --source events\n\n    # Emit machine-readable output\n    st ingest --source events --file batch.ndjson --json"
    )]
    Ingest(cmd::ingest::IngestArgs),

    #[command(
        next_help_heading = "Pipeline",
        about = "Aggregate one period",
        long_about = "Run the per-period aggregation job for a single calendar day.",
        after_help = "EXAMPLES:\n    # Aggregate one day\n    st run 2024-01-15\n\n    # Emit machine-readable output\n    st run 2024-01-15 --json"
    )]
    Run(cmd::run::RunArgs),

    #[command(
        next_help_heading = "Pipeline",
        about = "Aggregate a period range",
        long_about = "Run aggregation for every period from START through END inclusive, oldest first.",
        after_help = "EXAMPLES:\n    # Recompute two weeks\n    st backfill 2024-01-01 2024-01-14\n\n    # Emit machine-readable output\n    st backfill 2024-01-01 2024-01-14 --json"
    )]
    Backfill(cmd::backfill::BackfillArgs),

    #[command(
        next_help_heading = "Read",
        about = "Show job status for a period",
        long_about = "Show the recorded aggregation job status for one period.",
        after_help = "EXAMPLES:\n    # Check a period\n    st status 2024-01-15\n\n    # Emit machine-readable output\n    st status 2024-01-15 --json"
    )]
    Status(cmd::status::StatusArgs),

    #[command(
        next_help_heading = "Read",
        about = "Show reconciled or aggregated rows",
        long_about = "Show the current reconciled snapshots for an entity, or the aggregate rows for a period.",
        after_help = "EXAMPLES:\n    # Current user snapshots\n    st view users\n\n    # Include soft-deleted rows\n    st view users --all\n\n    # Aggregate rows for a period\n    st view --period 2024-01-15 --json"
    )]
    View(cmd::view::ViewArgs),

    #[command(
        next_help_heading = "Read",
        about = "Show ingestion lag",
        long_about = "Show source-to-snapshot ingestion lag across all reconciled entities.",
        after_help = "EXAMPLES:\n    # Check lag\n    st lag\n\n    # Emit machine-readable output\n    st lag --json"
    )]
    Lag(cmd::lag::LagArgs),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("STRATA_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "strata=debug,info"
        } else {
            "strata=info,warn"
        })
    });

    let format = env::var("STRATA_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry.with(fmt::layer().json().with_ansi(false)).init();
        }
        _ => {
            registry.with(fmt::layer().compact()).init();
        }
    }
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    if cli.verbose {
        info!("Verbose mode enabled");
    }

    let project_root = std::env::current_dir()?;
    let output = cli.output_mode();

    match cli.command {
        Commands::Init(args) => cmd::init::run_init(&args, &project_root),
        Commands::Ingest(ref args) => cmd::ingest::run_ingest(args, output, &project_root),
        Commands::Run(ref args) => cmd::run::run_run(args, output, &project_root),
        Commands::Backfill(ref args) => cmd::backfill::run_backfill(args, output, &project_root),
        Commands::Status(ref args) => cmd::status::run_status(args, output, &project_root),
        Commands::View(ref args) => cmd::view::run_view(args, output, &project_root),
        Commands::Lag(ref args) => cmd::lag::run_lag(args, output, &project_root),
    }
}
