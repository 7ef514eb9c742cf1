//! Dependency resolver - determines which steps are eligible to run

use crate::core::{InputBinding, PipelineDefinition, StepConfig, ValueMap};
use std::collections::{BTreeMap, HashSet};

/// Everything the resolver needs to know about a run at one point in time
#[derive(Debug, Clone, Copy)]
pub struct RunSnapshot<'a> {
    /// Execution names with an output record
    pub completed_steps: &'a HashSet<String>,
    /// Execution names currently sitting in the queue for this run
    pub enqueued_steps: &'a HashSet<String>,
    /// Output bags of completed steps
    pub available_outputs: &'a BTreeMap<String, ValueMap>,
    /// The run's pipeline input bag
    pub pipeline_inputs: &'a ValueMap,
}

/// Return the execution names that are newly eligible, in definition order.
///
/// Pure: calling it repeatedly with the same snapshot gives the same answer.
pub fn compute_runnable_steps(pipeline: &PipelineDefinition, snapshot: &RunSnapshot<'_>) -> Vec<String> {
    pipeline
        .steps
        .iter()
        .filter(|step| {
            let name = step.execution_name();
            !snapshot.completed_steps.contains(name)
                && !snapshot.enqueued_steps.contains(name)
                && bindings_satisfied(step, snapshot)
        })
        .map(|step| step.execution_name().to_string())
        .collect()
}

fn bindings_satisfied(step: &StepConfig, snapshot: &RunSnapshot<'_>) -> bool {
    step.inputs.iter().all(|(local_name, binding)| match binding {
        InputBinding::Pipeline { key } => snapshot.pipeline_inputs.contains_key(key),
        InputBinding::Step { step_id, .. } => {
            let output_key = binding.output_key(local_name).unwrap_or(local_name);
            snapshot
                .available_outputs
                .get(step_id)
                .is_some_and(|outputs| outputs.contains_key(output_key))
        }
    })
}
