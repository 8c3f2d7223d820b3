//! pagesync: mirror hosted workspace pages and collections as local Markdown.

mod commands;
mod error;
mod progress;
mod validate;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pagesync", version)]
#[command(about = "Incrementally sync workspace pages and collections to local Markdown")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch changed pages and write them to the output folder
    Sync(SyncArgs),
    /// Show what the last sync recorded
    Status(StatusArgs),
    /// Check configuration, API access and output paths without syncing
    Validate(ValidateArgs),
}

#[derive(Args)]
struct SyncArgs {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Show what would change without writing anything
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Ignore recorded state and sync everything again
    #[arg(short, long)]
    force: bool,

    /// Debug logging
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Args)]
struct StatusArgs {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct ValidateArgs {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let (verbose, quiet) = match &cli.command {
        Command::Sync(args) => (args.verbose, args.quiet),
        Command::Status(_) => (false, false),
        Command::Validate(args) => (args.verbose, false),
    };
    init_logging(verbose, quiet);

    let result = match cli.command {
        Command::Sync(args) => commands::sync(args).await,
        Command::Status(args) => commands::status(args),
        Command::Validate(args) => commands::validate(args).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            if err.is_retryable() {
                eprintln!("Progress was saved; running again resumes where this run stopped.");
            }
            ExitCode::FAILURE
        },
    }
}

/// `RUST_LOG` wins; otherwise the verbosity flags pick the level.
fn init_logging(verbose: bool, quiet: bool) {
    let default = match (verbose, quiet) {
        (true, _) => "debug",
        (_, true) => "warn",
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
