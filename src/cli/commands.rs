//! CLI command definitions

use crate::core::ValueMap;
use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use uuid::Uuid;

/// Create a run
#[derive(Debug, Args, Clone)]
pub struct CreateCommand {
    /// Pipeline id
    #[arg(short, long)]
    pub pipeline: String,

    /// Pipeline inputs (key=value); values that parse as JSON are kept typed
    #[arg(long, value_parser = parse_key_value)]
    pub input: Vec<(String, String)>,

    /// Pipeline inputs as a JSON object, merged before `--input`
    #[arg(long)]
    pub inputs_json: Option<String>,

    /// User that owns the run
    #[arg(long)]
    pub user: Option<String>,
}

impl CreateCommand {
    /// Build the pipeline input bag
    pub fn inputs(&self) -> Result<ValueMap> {
        let mut inputs = match &self.inputs_json {
            Some(raw) => serde_json::from_str::<ValueMap>(raw).context("--inputs-json must be a JSON object")?,
            None => ValueMap::new(),
        };
        for (key, value) in &self.input {
            inputs.insert(key.clone(), parse_input_value(value));
        }
        Ok(inputs)
    }
}

/// Polling worker loop
#[derive(Debug, Args, Clone)]
pub struct WorkCommand {
    /// Stop after this many processed items
    #[arg(long)]
    pub max_ticks: Option<usize>,

    /// Sleep between polls of an empty queue (defaults to the settings value)
    #[arg(long)]
    pub interval_ms: Option<u64>,

    /// Exit as soon as the queue is empty
    #[arg(long)]
    pub until_idle: bool,
}

/// Identifies one run
#[derive(Debug, Args, Clone)]
pub struct RunRef {
    /// Pipeline id
    #[arg(short, long)]
    pub pipeline: String,

    /// Run id
    #[arg(short, long)]
    pub run: Uuid,
}

/// List runs
#[derive(Debug, Args, Clone)]
pub struct RunsCommand {
    /// Pipeline id to filter by
    #[arg(short, long)]
    pub pipeline: Option<String>,
}

/// Show logs
#[derive(Debug, Args, Clone)]
pub struct LogsCommand {
    #[command(flatten)]
    pub run: RunRef,

    /// Only this step's stream
    #[arg(long)]
    pub step: Option<String>,
}

/// Validate a pipeline definition
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: PathBuf,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let parts: Vec<&str> = s.splitn(2, '=').collect();
    if parts.len() != 2 || parts[0].is_empty() {
        return Err(format!("Invalid key=value pair: {}", s));
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}

/// JSON when it parses, plain string otherwise
pub fn parse_input_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}
