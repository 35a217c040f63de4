//! HarborML CLI
//!
//! Builds project containers, runs training and data refresh scripts in
//! them, and deploys models behind a per-project reverse proxy.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{deploy, workload};
use harbor_lib::{DeployOptions, WorkloadOptions};
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// HarborML CLI
#[derive(Parser)]
#[command(name = "harbor")]
#[command(author, version, about = "Train and deploy ML models in containers", long_about = None)]
pub struct Cli {
    /// Project directory (can also be set via HARBOR_PROJECT_DIR env var)
    #[arg(long, short = 'C', env = "HARBOR_PROJECT_DIR", default_value = ".")]
    pub dir: PathBuf,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    /// Enable verbose output
    #[arg(long, short)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,

    /// Print Prometheus metrics to stderr when the command finishes
    #[arg(long)]
    pub metrics: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the project layout and identity file
    Init,

    /// Build a project container image
    Build {
        /// Container name (containers/<name>.dockerfile)
        container: String,
    },

    /// Train a model; output is written to model/<name>/
    Train {
        /// Container name (containers/<name>.dockerfile)
        container: String,

        /// Training script under src/, e.g. train_iris.py
        script: PathBuf,

        /// Model name (derived from the script name if not specified)
        #[arg(long)]
        name: Option<String>,

        /// Leave the container running afterwards
        #[arg(long)]
        keep_alive: bool,
    },

    /// Refresh a dataset; output is written to data/<name>/
    RefreshData {
        /// Container name (containers/<name>.dockerfile)
        container: String,

        /// Data script under src/, e.g. refresh_sales.py
        script: PathBuf,

        /// Dataset name (derived from the script name if not specified)
        #[arg(long)]
        name: Option<String>,

        /// Leave the container running afterwards
        #[arg(long)]
        keep_alive: bool,
    },

    /// Deploy a model as a new version behind the reverse proxy
    Deploy {
        /// Container name (containers/<name>.dockerfile)
        container: String,

        /// API script under src/ defining api_predict, e.g. deploy_iris.py
        script: PathBuf,

        /// Model name (derived from the script name if not specified)
        #[arg(long)]
        model_name: Option<String>,

        /// Also copy data/ into the serving container
        #[arg(long)]
        include_data: bool,
    },

    /// Stop a deployed model and remove its route
    Undeploy {
        /// Model name
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        model: Option<String>,

        /// Undeploy every model in the project; the proxy keeps running
        #[arg(long)]
        all: bool,
    },

    /// Show deployments, the reverse proxy, and routes
    Status,
}

fn init_tracing(verbose: bool, json: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let result = run(&cli).await;
    if cli.metrics {
        deploy::print_metrics();
    }
    if let Err(err) = &result {
        output::print_error(&format!("{:#}", err));
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: &Cli) -> Result<()> {
    if let Commands::Init = cli.command {
        return workload::init(&cli.dir, cli.format);
    }

    let orchestrator = client::connect(&cli.dir).await?;

    match &cli.command {
        Commands::Init => {}
        Commands::Build { container } => {
            workload::build(&orchestrator, container, cli.format).await?;
        }
        Commands::Train {
            container,
            script,
            name,
            keep_alive,
        } => {
            let options = WorkloadOptions {
                name: name.clone(),
                keep_alive: *keep_alive,
            };
            workload::train(&orchestrator, container, script, options, cli.format).await?;
        }
        Commands::RefreshData {
            container,
            script,
            name,
            keep_alive,
        } => {
            let options = WorkloadOptions {
                name: name.clone(),
                keep_alive: *keep_alive,
            };
            workload::refresh_data(&orchestrator, container, script, options, cli.format).await?;
        }
        Commands::Deploy {
            container,
            script,
            model_name,
            include_data,
        } => {
            let options = DeployOptions {
                model_name: model_name.clone(),
                include_data: *include_data,
            };
            deploy::deploy(&orchestrator, container, script, options, cli.format).await?;
        }
        Commands::Undeploy { model, all } => {
            deploy::undeploy(&orchestrator, model.as_deref(), *all, cli.format).await?;
        }
        Commands::Status => {
            deploy::status(&orchestrator, cli.format).await?;
        }
    }

    Ok(())
}
