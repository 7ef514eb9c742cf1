use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tickflow::cli::commands::{CreateCommand, LogsCommand, RunRef, RunsCommand, ValidateCommand, WorkCommand};
use tickflow::cli::output::*;
use tickflow::cli::{Cli, Command};
use tickflow::core::{DirectoryPipelineLoader, PipelineDefinition, Settings};
use tickflow::execution::{CommandStepExecutor, Runner, RunnerConfig, StepExecutor, StepRegistry};
use tickflow::persistence::RunStore;
use tracing::error;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging; stdout is reserved for command output
    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set logging subscriber")?;

    let command = match &cli.command {
        Command::Validate(cmd) => return validate_pipeline(cmd),
        command => command,
    };

    let settings = load_settings(&cli)?;
    let runner = build_runner(&settings).await?;

    match command {
        Command::Create(cmd) => create_run(&runner, cmd, cli.json).await?,
        Command::Tick => tick_once(&runner, cli.json).await?,
        Command::Work(cmd) => work(&runner, cmd, &settings, cli.json).await?,
        Command::Status(run) => show_status(&runner, run, cli.json).await?,
        Command::Runs(cmd) => list_runs(runner.store().as_ref(), cmd, cli.json).await?,
        Command::Logs(cmd) => show_logs(runner.store().as_ref(), cmd, cli.json).await?,
        Command::Resume(run) => resume_run(&runner, run, cli.json).await?,
        Command::Validate(_) => unreachable!("validate is handled before loading settings"),
    }

    Ok(())
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = match &cli.config {
        Some(path) => Settings::from_file(path)?,
        None => Settings::default(),
    };
    if let Some(dir) = &cli.data_dir {
        settings.data_dir = dir.clone();
    }
    if let Some(dir) = &cli.pipelines_dir {
        settings.pipelines_dir = dir.clone();
    }
    if let Some(dir) = &cli.steps_dir {
        settings.steps_dir = Some(dir.clone());
    }
    Ok(settings)
}

#[cfg(feature = "sqlite")]
async fn open_store(settings: &Settings) -> Result<Arc<dyn RunStore>> {
    let path = settings.database_path();
    let store = tickflow::persistence::SqliteRunStore::new(&path)
        .await
        .with_context(|| format!("Failed to open run database {}", path.display()))?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
async fn open_store(_settings: &Settings) -> Result<Arc<dyn RunStore>> {
    tracing::warn!("Built without the sqlite feature; run state will not outlive this process");
    Ok(Arc::new(tickflow::persistence::InMemoryRunStore::new()))
}

async fn build_runner(settings: &Settings) -> Result<Runner> {
    let store = open_store(settings).await?;
    let executor: Arc<dyn StepExecutor> = match &settings.steps_dir {
        Some(dir) => Arc::new(CommandStepExecutor::new(dir)),
        None => Arc::new(StepRegistry::with_builtins()),
    };
    let loader = Arc::new(DirectoryPipelineLoader::new(&settings.pipelines_dir));

    Ok(Runner::new(store, executor, loader).with_config(RunnerConfig::from_settings(settings)))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn create_run(runner: &Runner, cmd: &CreateCommand, json: bool) -> Result<()> {
    let inputs = cmd.inputs()?;
    let metadata = runner
        .create_run(&cmd.pipeline, inputs, cmd.user.clone())
        .await
        .with_context(|| format!("Failed to create run of {}", cmd.pipeline))?;

    if json {
        return print_json(&metadata);
    }
    println!(
        "{} Created run {} of {}",
        ROCKET,
        style(metadata.run_id).cyan(),
        style(&metadata.pipeline_id).bold()
    );
    Ok(())
}

async fn tick_once(runner: &Runner, json: bool) -> Result<()> {
    let report = runner.tick().await.context("Tick failed")?;
    match (report, json) {
        (Some(report), true) => print_json(&report),
        (None, true) => print_json(&serde_json::Value::Null),
        (Some(report), false) => {
            println!("{}", format_tick_report(&report));
            Ok(())
        }
        (None, false) => {
            println!("{} Queue is empty", INFO);
            Ok(())
        }
    }
}

async fn work(runner: &Runner, cmd: &WorkCommand, settings: &Settings, json: bool) -> Result<()> {
    let interval = Duration::from_millis(cmd.interval_ms.unwrap_or(settings.poll_interval_ms));
    let mut processed = 0usize;
    let mut failures = 0usize;
    let mut idle_spinner: Option<indicatif::ProgressBar> = None;

    loop {
        if cmd.max_ticks.is_some_and(|max| processed >= max) {
            break;
        }

        match runner.tick().await {
            Ok(Some(report)) => {
                if let Some(spinner) = idle_spinner.take() {
                    spinner.finish_and_clear();
                }
                processed += 1;
                if json {
                    println!("{}", serde_json::to_string(&report)?);
                } else {
                    println!("{}", format_tick_report(&report));
                }
            }
            Ok(None) => {
                if cmd.until_idle {
                    break;
                }
                if idle_spinner.is_none() && !json {
                    idle_spinner = Some(create_spinner("Waiting for work..."));
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            Err(e) => {
                // The offending run has been marked failed; keep serving others
                processed += 1;
                failures += 1;
                error!("{:#}", e);
                let backoff = !e.is_definition_error();
                if !json {
                    println!("{} {}", CROSS, style(e).red());
                }
                if backoff {
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }

    if let Some(spinner) = idle_spinner {
        spinner.finish_and_clear();
    }
    if !json {
        println!(
            "{} Processed {} item(s){}",
            INFO,
            style(processed).cyan(),
            if failures > 0 {
                format!(", {} aborted", style(failures).red())
            } else {
                String::new()
            }
        );
    }
    Ok(())
}

async fn show_status(runner: &Runner, run: &RunRef, json: bool) -> Result<()> {
    let summary = runner
        .run_summary(&run.pipeline, run.run)
        .await
        .with_context(|| format!("Failed to load run {}", run.run))?;
    if json {
        return print_json(&summary);
    }
    println!("{}", format_run_summary(&summary));
    Ok(())
}

async fn list_runs(store: &dyn RunStore, cmd: &RunsCommand, json: bool) -> Result<()> {
    let runs = store.list_runs(cmd.pipeline.as_deref()).await?;
    if json {
        return print_json(&runs);
    }
    if runs.is_empty() {
        println!("{} No runs found", INFO);
        return Ok(());
    }
    for metadata in &runs {
        println!("  {}", format_run_line(metadata));
    }
    Ok(())
}

async fn show_logs(store: &dyn RunStore, cmd: &LogsCommand, json: bool) -> Result<()> {
    let entries = store
        .read_logs(&cmd.run.pipeline, cmd.run.run, cmd.step.as_deref())
        .await
        .with_context(|| format!("Failed to read logs of run {}", cmd.run.run))?;
    if json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        println!("{} No log entries", INFO);
    }
    for entry in &entries {
        println!("{}", format_log_entry(entry));
    }
    Ok(())
}

async fn resume_run(runner: &Runner, run: &RunRef, json: bool) -> Result<()> {
    let enqueued = runner
        .resume_run(&run.pipeline, run.run)
        .await
        .with_context(|| format!("Failed to resume run {}", run.run))?;
    if json {
        return print_json(&enqueued);
    }
    if enqueued.is_empty() {
        println!("{} Nothing to resume", WARN);
    } else {
        println!(
            "{} Re-enqueued {}",
            CHECK,
            style(enqueued.join(", ")).cyan()
        );
    }
    Ok(())
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating pipeline...", INFO);

    match PipelineDefinition::from_file(&cmd.file) {
        Ok(definition) => {
            println!("{} Pipeline definition is valid!", CHECK);
            println!("  Id: {}", style(&definition.id).bold());
            println!("  Name: {}", style(definition.display_name()).bold());
            println!("  Steps: {}", style(definition.steps.len()).cyan());
            for step in &definition.steps {
                let deps = step.dependencies();
                println!(
                    "    {} ({}@{}){}",
                    style(step.execution_name()).cyan(),
                    step.step_id,
                    step.version,
                    if deps.is_empty() {
                        String::new()
                    } else {
                        format!(" after {}", style(deps.join(", ")).dim())
                    }
                );
            }
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            std::process::exit(1);
        }
    }
}
