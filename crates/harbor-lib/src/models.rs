//! Core data models shared across the orchestration core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Reference to a container known to the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRef {
    /// Runtime identifier
    pub id: String,
    /// Container name without the runtime's leading slash
    pub name: String,
}

/// Runtime state of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Unknown,
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Restarting => "restarting",
            ContainerState::Exited => "exited",
            ContainerState::Dead => "dead",
            ContainerState::Unknown => "unknown",
        }
    }
}

/// A container returned by a name-filtered listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub container: ContainerRef,
    pub state: ContainerState,
}

/// Inspection result for a single container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerDetails {
    pub container: ContainerRef,
    pub state: ContainerState,
    pub hostname: Option<String>,
    /// Address on the runtime's internal network
    pub ip_address: Option<String>,
}

/// Everything needed to launch a container
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub image: String,
    pub command: Vec<String>,
    pub name: Option<String>,
    pub hostname: Option<String>,
    /// container port -> host port
    pub ports: HashMap<u16, u16>,
}

/// Result of an exec inside a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// `None` for detached execs
    pub exit_code: Option<i64>,
    /// Combined stdout and stderr
    pub output: String,
}

impl ExecOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            output: output.into(),
        }
    }

    pub fn failure(exit_code: i64, output: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            output: output.into(),
        }
    }

    pub fn detached() -> Self {
        Self::default()
    }

    pub fn is_success(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }
}

/// Lifecycle of an ephemeral workload container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadState {
    Starting,
    Running,
    Succeeded,
    Failed,
    Stopped,
}

/// Kind of workload run by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadKind {
    Train,
    RefreshData,
    Deploy,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Train => "train",
            WorkloadKind::RefreshData => "refresh_data",
            WorkloadKind::Deploy => "deploy",
        }
    }
}

/// Result of a train or refresh-data run
#[derive(Debug, Clone)]
pub enum WorkloadOutcome {
    /// Output retrieved and the container stopped
    Completed { output_dir: PathBuf },
    /// Output retrieved and the container left running for debugging
    KeptAlive {
        output_dir: PathBuf,
        container: ContainerRef,
    },
}

impl WorkloadOutcome {
    pub fn output_dir(&self) -> &PathBuf {
        match self {
            WorkloadOutcome::Completed { output_dir } => output_dir,
            WorkloadOutcome::KeptAlive { output_dir, .. } => output_dir,
        }
    }
}

/// Result of a successful deploy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentReport {
    pub model_name: String,
    pub version: u32,
    pub container: ContainerRef,
    /// Upstream address routed by the proxy
    pub address: String,
    /// URL path served by the proxy
    pub route: String,
    /// Container names of the versions stopped by this deploy
    pub retired: Vec<String>,
    pub deployed_at: DateTime<Utc>,
}

/// One deployment slot as seen by `status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentSummary {
    pub model_name: String,
    pub version: u32,
    pub container_name: String,
    pub state: ContainerState,
    /// True for the highest version of the model
    pub current: bool,
}
