//! Project setup, image builds, and batch workloads

use anyhow::{Context, Result};
use colored::Colorize;
use harbor_lib::{Orchestrator, Project, WorkloadOptions, WorkloadOutcome};
use serde::Serialize;
use std::path::Path;
use std::time::Instant;

use crate::output::{format_elapsed, print_info, print_json, print_success, print_warning, OutputFormat};

#[derive(Serialize)]
struct WorkloadResult<'a> {
    workflow: &'a str,
    output_dir: String,
    container: Option<String>,
    elapsed_secs: f64,
}

/// Create the project layout in `dir`
pub fn init(dir: &Path, format: OutputFormat) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let project = Project::init(dir).context("Failed to initialize project")?;

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "root": project.root().display().to_string(),
            "project_id": project.id(),
        })),
        OutputFormat::Table => {
            print_success(&format!("Initialized harbor project in {}", project.root().display()));
            println!("Project ID: {}", project.id().cyan());
        }
    }
    Ok(())
}

/// Build `containers/<name>.dockerfile`
pub async fn build(orchestrator: &Orchestrator, container: &str, format: OutputFormat) -> Result<()> {
    print_info(&format!("Building container {}", container.cyan()));
    let started = Instant::now();
    let tag = orchestrator
        .build_container(container)
        .await
        .with_context(|| format!("Failed to build container {}", container))?;

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({ "tag": tag })),
        OutputFormat::Table => print_success(&format!(
            "Built {} in {}",
            tag.bold(),
            format_elapsed(started.elapsed().as_secs_f64())
        )),
    }
    Ok(())
}

/// Run a training script
pub async fn train(
    orchestrator: &Orchestrator,
    container: &str,
    script: &Path,
    options: WorkloadOptions,
    format: OutputFormat,
) -> Result<()> {
    print_info(&format!("Training {} in {}", script.display(), container.cyan()));
    let started = Instant::now();
    let outcome = orchestrator
        .train(container, script, options)
        .await
        .with_context(|| format!("Training with {} failed", script.display()))?;
    report("train", &outcome, started, format);
    Ok(())
}

/// Run a data refresh script
pub async fn refresh_data(
    orchestrator: &Orchestrator,
    container: &str,
    script: &Path,
    options: WorkloadOptions,
    format: OutputFormat,
) -> Result<()> {
    print_info(&format!("Refreshing data with {} in {}", script.display(), container.cyan()));
    let started = Instant::now();
    let outcome = orchestrator
        .refresh_data(container, script, options)
        .await
        .with_context(|| format!("Data refresh with {} failed", script.display()))?;
    report("refresh_data", &outcome, started, format);
    Ok(())
}

fn report(workflow: &str, outcome: &WorkloadOutcome, started: Instant, format: OutputFormat) {
    let elapsed = started.elapsed().as_secs_f64();
    let container = match outcome {
        WorkloadOutcome::KeptAlive { container, .. } => Some(container.name.clone()),
        WorkloadOutcome::Completed { .. } => None,
    };

    match format {
        OutputFormat::Json => print_json(&WorkloadResult {
            workflow,
            output_dir: outcome.output_dir().display().to_string(),
            container,
            elapsed_secs: elapsed,
        }),
        OutputFormat::Table => {
            print_success(&format!(
                "Output written to {} ({})",
                outcome.output_dir().display(),
                format_elapsed(elapsed)
            ));
            if let Some(name) = container {
                print_warning(&format!(
                    "Container {} is still running; stop it with `docker stop {}`",
                    name.cyan(),
                    name
                ));
            }
        }
    }
}
