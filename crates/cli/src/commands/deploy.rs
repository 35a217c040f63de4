//! Deployment, undeployment, and status commands

use anyhow::{Context, Result};
use colored::Colorize;
use harbor_lib::{DeployOptions, HarborMetrics, Orchestrator};
use serde::Serialize;
use std::path::Path;
use tabled::Tabled;

use crate::output::{
    color_status, format_timestamp, print_info, print_json, print_success, print_table,
    print_warning, OutputFormat,
};

/// Row for the deployments table
#[derive(Tabled, Serialize)]
struct DeploymentRow {
    #[tabled(rename = "Model")]
    model: String,
    #[tabled(rename = "Version")]
    version: u32,
    #[tabled(rename = "Container")]
    container: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Current")]
    current: String,
}

/// Row for the routes table
#[derive(Tabled, Serialize)]
struct RouteRow {
    #[tabled(rename = "Path")]
    path: String,
    #[tabled(rename = "Upstream")]
    upstream: String,
}

/// Deploy a model behind the project's reverse proxy
pub async fn deploy(
    orchestrator: &Orchestrator,
    container: &str,
    script: &Path,
    options: DeployOptions,
    format: OutputFormat,
) -> Result<()> {
    print_info(&format!("Deploying {} in {}", script.display(), container.cyan()));
    let report = orchestrator
        .deploy(container, script, options)
        .await
        .with_context(|| format!("Deploying {} failed", script.display()))?;

    match format {
        OutputFormat::Json => print_json(&report),
        OutputFormat::Table => {
            print_success(&format!(
                "{} version {} is live at {}",
                report.model_name.bold(),
                report.version,
                format!(
                    "http://localhost:{}{}",
                    orchestrator.project().config().proxy_listen_port,
                    report.route
                )
                .cyan()
            ));
            println!("Container: {}", report.container.name);
            println!("Upstream:  {}", report.address);
            println!("Deployed:  {}", format_timestamp(&report.deployed_at));
            if !report.retired.is_empty() {
                println!("Retired:   {}", report.retired.join(", ").dimmed());
            }
        }
    }
    Ok(())
}

/// Undeploy one model, or every model with `all`
pub async fn undeploy(
    orchestrator: &Orchestrator,
    model: Option<&str>,
    all: bool,
    format: OutputFormat,
) -> Result<()> {
    match (model, all) {
        (_, true) => {
            let stopped = orchestrator
                .undeploy_all()
                .await
                .context("Failed to undeploy models")?;
            match format {
                OutputFormat::Json => print_json(&serde_json::json!({ "stopped": stopped })),
                OutputFormat::Table => {
                    print_success(&format!("Stopped {} deployment container(s)", stopped));
                    print_info("The reverse proxy is still running");
                }
            }
        }
        (Some(model), false) => {
            let version = orchestrator
                .undeploy_single(model)
                .await
                .with_context(|| format!("Failed to undeploy {}", model))?;
            match (format, version) {
                (OutputFormat::Json, version) => {
                    print_json(&serde_json::json!({ "model": model, "version": version }))
                }
                (OutputFormat::Table, Some(version)) => {
                    print_success(&format!("Undeployed {} version {}", model.bold(), version))
                }
                (OutputFormat::Table, None) => {
                    print_warning(&format!("Nothing deployed for {}", model))
                }
            }
        }
        (None, false) => anyhow::bail!("Specify a model name or --all"),
    }
    Ok(())
}

/// Show deployments, the reverse proxy, and live routes
pub async fn status(orchestrator: &Orchestrator, format: OutputFormat) -> Result<()> {
    let status = orchestrator
        .status()
        .await
        .context("Failed to read project status")?;

    let deployments: Vec<DeploymentRow> = status
        .deployments
        .iter()
        .map(|d| DeploymentRow {
            model: d.model_name.clone(),
            version: d.version,
            container: d.container_name.clone(),
            state: match format {
                OutputFormat::Table => color_status(d.state.as_str()),
                OutputFormat::Json => d.state.as_str().to_string(),
            },
            current: if d.current { "yes".into() } else { String::new() },
        })
        .collect();
    let routes: Vec<RouteRow> = status
        .routes
        .iter()
        .map(|r| RouteRow {
            path: r.path.clone(),
            upstream: r.upstream.clone().unwrap_or_else(|| "-".into()),
        })
        .collect();

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "project_id": orchestrator.project().id(),
            "deployments": deployments,
            "proxy": status.proxy,
            "routes": routes,
        })),
        OutputFormat::Table => {
            println!("{}", "Project Status".bold());
            println!("{}", "=".repeat(60));
            println!("Project ID: {}", orchestrator.project().id().cyan());
            match &status.proxy {
                Some(proxy) => println!(
                    "Proxy:      {} ({})",
                    proxy.container.name,
                    color_status(proxy.state.as_str())
                ),
                None => println!("Proxy:      {}", "not started".dimmed()),
            }
            println!();

            print_table(&deployments, format, "No deployments found");
            println!();
            print_table(&routes, format, "No routes configured");
        }
    }
    Ok(())
}

/// Dump this process's metrics in Prometheus text format
pub fn print_metrics() {
    eprintln!("{}", HarborMetrics::new().render());
}
