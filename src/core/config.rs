//! Pipeline definitions loaded from YAML

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;

/// Top-level pipeline definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline identifier (also the file stem when loaded from a directory)
    pub id: String,

    /// Human-readable name
    #[serde(default)]
    pub name: Option<String>,

    /// Steps, in definition order
    pub steps: Vec<StepConfig>,
}

/// A step as declared inside a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    /// Step implementation identifier
    pub step_id: String,

    /// Step implementation version
    pub version: String,

    /// Execution name override (defaults to `step_id`)
    #[serde(default)]
    pub alias: Option<String>,

    /// Local input name -> where its value comes from
    #[serde(default)]
    pub inputs: BTreeMap<String, InputBinding>,
}

/// Where a single step input gets its value from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum InputBinding {
    /// Value from the run's pipeline input bag
    Pipeline { key: String },
    /// Value from another step's output bag
    Step {
        /// Execution name of the producing step
        step_id: String,
        /// Output key; defaults to the local input name
        #[serde(default, alias = "key")]
        output: Option<String>,
    },
}

impl InputBinding {
    /// The output key a step binding reads, given the local input name
    pub fn output_key<'a>(&'a self, local_name: &'a str) -> Option<&'a str> {
        match self {
            InputBinding::Pipeline { .. } => None,
            InputBinding::Step { output, .. } => Some(output.as_deref().unwrap_or(local_name)),
        }
    }
}

impl StepConfig {
    /// The name used for dependency tracking within the pipeline
    pub fn execution_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.step_id)
    }
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.-]+$").expect("identifier regex is valid"))
}

fn check_identifier(kind: &str, value: &str) -> Result<()> {
    if !identifier_pattern().is_match(value) {
        anyhow::bail!("Invalid {} '{}': only letters, digits, '_', '.' and '-' are allowed", kind, value);
    }
    Ok(())
}

impl PipelineDefinition {
    /// Load a pipeline definition from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Parse a pipeline definition from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let definition: PipelineDefinition = serde_yaml::from_str(yaml)?;
        definition.validate()?;
        Ok(definition)
    }

    /// Validate the definition.
    ///
    /// Cycles are deliberately not rejected: eligibility is evaluated lazily
    /// against available data, so a cyclic graph just never becomes runnable.
    pub fn validate(&self) -> Result<()> {
        check_identifier("pipeline id", &self.id)?;

        let mut seen = HashSet::new();
        for step in &self.steps {
            check_identifier("step id", &step.step_id)?;
            check_identifier("execution name", step.execution_name())?;
            if !seen.insert(step.execution_name()) {
                anyhow::bail!("Duplicate execution name: {}", step.execution_name());
            }
        }

        for step in &self.steps {
            for (input, binding) in &step.inputs {
                if let InputBinding::Step { step_id, .. } = binding {
                    if !seen.contains(step_id.as_str()) {
                        anyhow::bail!(
                            "Step '{}' input '{}' references non-existent step '{}'",
                            step.execution_name(),
                            input,
                            step_id
                        );
                    }
                }
            }
        }

        Ok(())
    }
}
