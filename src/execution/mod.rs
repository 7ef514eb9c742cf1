//! Run execution - resolution, step executors and the tick-driven runner

pub mod command;
pub mod executor;
pub mod registry;
pub mod resolver;
pub mod runner;

pub use command::CommandStepExecutor;
pub use executor::{BufferedLogSink, ExecutorError, LogSink, StepExecutor, StepManifest};
pub use registry::{FnHandler, StepHandler, StepRegistry};
pub use resolver::{compute_runnable_steps, RunSnapshot};
pub use runner::{Runner, RunnerConfig, RunnerError, StepOutcome, TickReport};
