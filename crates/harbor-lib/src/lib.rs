//! Harbor library for containerized ML workloads
//!
//! This crate provides the core functionality for:
//! - Building project images and running training and data refresh jobs
//! - Moving project files in and out of containers as tar archives
//! - Versioned, blue/green model deployments behind a shared nginx proxy
//! - Observability for every workflow

pub mod archive;
pub mod command;
pub mod config;
pub mod container;
pub mod error;
pub mod image;
pub mod models;
pub mod naming;
pub mod observability;
pub mod orchestrator;
pub mod project;
pub mod proxy;
pub mod runtime;
pub mod shim;
pub mod versioner;

pub use config::HarborConfig;
pub use error::{HarborError, HarborResult};
pub use models::*;
pub use observability::{HarborMetrics, StructuredLogger};
pub use orchestrator::{DeployOptions, Orchestrator, ProjectStatus, WorkloadOptions};
pub use project::Project;
pub use runtime::{ContainerRuntime, DockerRuntime, MemoryRuntime};
