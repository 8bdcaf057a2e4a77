//! Trackforge CLI - command-line interface for tracker training runs
//!
//! Provides the `trackforge` command that drives warm and full training
//! phases from a TOML run configuration.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use trackforge_training::{ErrorKind, TrainingError};

use commands::{checkpoints, train};

/// Trackforge - epoch orchestration for Siamese tracker training
#[derive(Parser, Debug)]
#[command(name = "trackforge", author, version, about = "Trackforge - tracker training orchestration")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run training epochs as described by a run configuration
    Train {
        /// Path to the TOML run configuration
        #[arg(long)]
        cfg: PathBuf,

        /// Append progress events to events.jsonl in the run directory
        #[arg(long)]
        track: bool,

        /// Synthetic samples generated per epoch
        #[arg(long, default_value_t = 64)]
        samples: usize,
    },

    /// List saved checkpoints for the configured architecture
    Checkpoints {
        /// Path to the TOML run configuration
        #[arg(long)]
        cfg: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .without_time()
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install logger: {e}");
    }

    let result = match args.command {
        Command::Train { cfg, track, samples } => train::execute(&cfg, track, samples).await,
        Command::Checkpoints { cfg, json } => checkpoints::execute(&cfg, json),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            ExitCode::from(exit_code(&e))
        }
    }
}

/// Exit status for a failed command, keyed on the training error kind.
fn exit_code(err: &anyhow::Error) -> u8 {
    let kind = err.chain().find_map(|cause| cause.downcast_ref::<TrainingError>()).map(TrainingError::kind);
    match kind {
        Some(ErrorKind::Configuration) => 2,
        Some(ErrorKind::Resource) => 3,
        Some(ErrorKind::Checkpoint) => 4,
        Some(ErrorKind::TrainingStep) => 5,
        Some(ErrorKind::Internal) | None => 1,
    }
}
