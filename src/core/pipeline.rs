//! Pipeline domain helpers

use crate::core::config::{InputBinding, PipelineDefinition, StepConfig};

impl PipelineDefinition {
    /// Display name, falling back to the identifier
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Get a step by its execution name
    pub fn step(&self, execution_name: &str) -> Option<&StepConfig> {
        self.steps
            .iter()
            .find(|s| s.execution_name() == execution_name)
    }

    /// All execution names, in definition order
    pub fn execution_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.execution_name()).collect()
    }
}

impl StepConfig {
    /// Execution names this step reads outputs from (deduplicated, in input order)
    pub fn dependencies(&self) -> Vec<&str> {
        let mut deps: Vec<&str> = Vec::new();
        for binding in self.inputs.values() {
            if let InputBinding::Step { step_id, .. } = binding {
                if !deps.contains(&step_id.as_str()) {
                    deps.push(step_id);
                }
            }
        }
        deps
    }
}
