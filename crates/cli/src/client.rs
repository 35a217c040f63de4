//! Connects the CLI to a project and the local container daemon

use anyhow::{Context, Result};
use harbor_lib::{DockerRuntime, Orchestrator, Project};
use std::path::Path;
use std::sync::Arc;

/// Open the project at `dir` and check the daemon answers
pub async fn connect(dir: &Path) -> Result<Orchestrator> {
    let project = Project::open(dir)
        .with_context(|| format!("No harbor project at {} (run `harbor init`)", dir.display()))?;

    let runtime = DockerRuntime::connect().context("Failed to connect to the Docker daemon")?;
    runtime
        .ping()
        .await
        .context("Docker daemon is not responding")?;

    tracing::debug!(project_id = %project.id(), root = %dir.display(), "Opened project");
    Ok(Orchestrator::new(Arc::new(runtime), project))
}
