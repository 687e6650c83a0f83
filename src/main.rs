//! CLI entry point for Dave.
//!
//! Drives sequence files against an in-process simulated HAL:
//! - `run` executes a sequence and prints the event stream as JSON lines
//! - `estimate` calibrates a sequence in test mode and prints its run length and size
//! - `validate` calibrates a sequence and lists the actions the remote rejected
//!
//! # Usage
//!
//! ```bash
//! dave run demos/focus_and_movies.json --config config/dave.toml
//! dave estimate demos/focus_and_movies.json
//! ```

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use dave::config::{DaveConfig, DEFAULT_CONFIG_PATH};
use dave::descriptor::SequenceFile;
use dave::logging;
use dave::sequencer::{PauseReason, SequencerActor, SequencerHandle};
use dave::transport::mock::{MockTransport, SimulatedRemote};
use dave::{Sequencer, SequencerEvent};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

#[derive(Parser)]
#[command(name = "dave")]
#[command(about = "Sequencer for scripted microscope experiments", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a sequence against the simulated remote
    Run {
        /// Path to the sequence JSON file
        sequence: PathBuf,

        /// Dry run: calibrate instead of executing
        #[arg(long)]
        test_mode: bool,
    },

    /// Print the estimated run length and size of a sequence
    Estimate {
        /// Path to the sequence JSON file
        sequence: PathBuf,
    },

    /// List the actions of a sequence the remote rejects
    Validate {
        /// Path to the sequence JSON file
        sequence: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match cli.config {
        Some(path) => DaveConfig::load_from(path)?,
        None => DaveConfig::load_from(DEFAULT_CONFIG_PATH)?,
    };
    config.validate()?;
    logging::init_from_config(&config)?;

    match cli.command {
        Commands::Run {
            sequence,
            test_mode,
        } => run_sequence(&config, sequence, test_mode).await,
        Commands::Estimate { sequence } => estimate_sequence(&config, sequence).await,
        Commands::Validate { sequence } => validate_sequence(&config, sequence).await,
    }
}

/// Load `path` into a Sequencer wired to a simulated remote and spawn its actor.
fn start_engine(
    config: &DaveConfig,
    path: &Path,
    test_mode: bool,
) -> Result<(SequencerHandle, JoinHandle<()>)> {
    let file = SequenceFile::load(path)?;
    let (transport, events) = MockTransport::new();
    let transport = transport.with_responder(SimulatedRemote::default().into_responder());

    let mut sequencer = Sequencer::new(Box::new(transport), config);
    sequencer.set_test_mode(test_mode)?;
    let estimate = sequencer.load_file(file)?;
    println!(
        "Loaded {} actions from {}",
        estimate.actions,
        path.display()
    );

    Ok(SequencerActor::spawn(
        sequencer,
        events,
        config.sequencer.command_capacity,
    ))
}

/// Run to completion, printing each event. Pauses after an action are resumed;
/// pauses caused by errors or warnings abort the run.
async fn drive(handle: &SequencerHandle, print_events: bool) -> Result<()> {
    let mut observer = handle.subscribe().await?;
    handle.run().await?;

    loop {
        let event = match observer.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                eprintln!("Missed {} events", skipped);
                continue;
            }
            Err(RecvError::Closed) => bail!("Sequencer stopped unexpectedly"),
        };
        if print_events {
            println!("{}", serde_json::to_string(&event)?);
        }

        match event {
            SequencerEvent::SequenceFinished => return Ok(()),
            SequencerEvent::SequenceAborted => bail!("Sequence aborted"),
            SequencerEvent::SequencePaused { reason } => match reason {
                PauseReason::Requested | PauseReason::AfterAction { .. } => {
                    handle.resume().await?;
                }
                PauseReason::Error { .. } | PauseReason::TooManyWarnings { .. } => {
                    if let PauseReason::TooManyWarnings { summary, .. } = &reason {
                        eprintln!("{}", summary);
                    }
                    handle.abort().await?;
                    bail!("Sequence stopped: {}", reason);
                }
            },
            _ => {}
        }
    }
}

async fn run_sequence(config: &DaveConfig, path: PathBuf, test_mode: bool) -> Result<()> {
    let (handle, task) = start_engine(config, &path, test_mode || config.sequencer.test_mode)?;
    let outcome = drive(&handle, true).await;

    let status = handle.status().await?;
    println!(
        "{}: {} actions completed, {:.1} s, {:.1} kB, {} warnings",
        status.name,
        status.completed.actions,
        status.completed.duration_s,
        status.completed.disk_usage_kb,
        status.warnings
    );

    handle.shutdown().await?;
    task.await?;
    outcome
}

async fn estimate_sequence(config: &DaveConfig, path: PathBuf) -> Result<()> {
    let (handle, task) = start_engine(config, &path, true)?;
    drive(&handle, false).await?;

    let estimate = handle.estimate().await?;
    println!("Actions:       {}", estimate.actions);
    println!("Run length:    {:.1} s", estimate.duration_s);
    println!("Run size:      {:.1} kB", estimate.disk_usage_kb);

    handle.shutdown().await?;
    task.await?;
    Ok(())
}

async fn validate_sequence(config: &DaveConfig, path: PathBuf) -> Result<()> {
    let (handle, task) = start_engine(config, &path, true)?;
    drive(&handle, false).await?;

    let status = handle.status().await?;
    handle.shutdown().await?;
    task.await?;

    if status.invalid.is_empty() {
        println!("All {} actions are valid", status.total);
        return Ok(());
    }
    for index in &status.invalid {
        println!("Action {} is invalid", index);
    }
    bail!("{} of {} actions are invalid", status.invalid.len(), status.total)
}
