//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{
    CreateCommand, LogsCommand, RunRef, RunsCommand, ValidateCommand, WorkCommand,
};
use std::ffi::OsString;
use std::path::PathBuf;

/// Local-first, tick-driven workflow engine
#[derive(Debug, Parser, Clone)]
#[command(name = "tickflow")]
#[command(version)]
#[command(about = "A local-first workflow engine driven one tick at a time", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to a settings YAML file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding the run database
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Directory holding `<pipeline_id>.yaml` definitions
    #[arg(long, global = true)]
    pub pipelines_dir: Option<PathBuf>,

    /// Directory holding out-of-process step manifests
    #[arg(long, global = true)]
    pub steps_dir: Option<PathBuf>,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Create a run and seed its queue
    Create(CreateCommand),

    /// Process at most one queue item
    Tick,

    /// Keep ticking until idle or interrupted
    Work(WorkCommand),

    /// Show run metadata and per-step status
    Status(RunRef),

    /// List runs
    Runs(RunsCommand),

    /// Show step logs of a run
    Logs(LogsCommand),

    /// Re-enqueue runnable steps of a run from persisted state
    Resume(RunRef),

    /// Validate a pipeline definition
    Validate(ValidateCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}
