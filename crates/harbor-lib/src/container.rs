//! Container lifecycle
//!
//! Every container harbor starts runs a long-lived no-op command so that all
//! interaction happens through exec, and gets the working and output
//! directories provisioned before it is handed back.

use crate::config::HarborConfig;
use crate::error::{HarborError, HarborResult};
use crate::models::{ContainerDetails, ContainerRef, ContainerSummary, ExecOutput, RunSpec};
use crate::runtime::ContainerRuntime;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Foreground command keeping containers alive between execs
pub const KEEP_ALIVE_COMMAND: [&str; 3] = ["tail", "-f", "/dev/null"];

/// Options for [`ContainerLifecycleManager::start`]
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// container port -> host port
    pub ports: HashMap<u16, u16>,
    pub hostname: Option<String>,
    pub name: Option<String>,
}

#[derive(Clone)]
pub struct ContainerLifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    config: HarborConfig,
}

impl ContainerLifecycleManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: HarborConfig) -> Self {
        Self { runtime, config }
    }

    /// Start a detached container from `image_tag` and provision its
    /// working and output directories
    pub async fn start(&self, image_tag: &str, options: StartOptions) -> HarborResult<ContainerRef> {
        let container = self
            .runtime
            .run(RunSpec {
                image: image_tag.to_string(),
                command: KEEP_ALIVE_COMMAND.iter().map(|s| s.to_string()).collect(),
                name: options.name,
                hostname: options.hostname,
                ports: options.ports,
            })
            .await?;

        // Leave nothing half-provisioned behind
        if let Err(err) = self.provision(&container).await {
            if let Err(stop_err) = self.stop(&container.id).await {
                warn!(container = %container.name, error = %stop_err, "Failed to stop container");
            }
            return Err(err);
        }

        info!(container = %container.name, image = %image_tag, "Started container");
        Ok(container)
    }

    async fn provision(&self, container: &ContainerRef) -> HarborResult<()> {
        for dir in [
            self.config.container_workdir.clone(),
            self.config.container_output_dir(),
        ] {
            let out = self
                .runtime
                .exec(&container.id, vec!["mkdir".into(), "-p".into(), dir.clone()], false)
                .await?;
            if matches!(out.exit_code, Some(code) if code != 0) {
                return Err(HarborError::runtime(
                    "mkdir",
                    format!("{}: {}", dir, out.output.trim()),
                ));
            }
        }
        Ok(())
    }

    pub async fn rename(&self, container: &ContainerRef, new_name: &str) -> HarborResult<ContainerRef> {
        self.runtime.rename(&container.id, new_name).await?;
        debug!(from = %container.name, to = %new_name, "Renamed container");
        Ok(ContainerRef {
            id: container.id.clone(),
            name: new_name.to_string(),
        })
    }

    /// Stop a container. Absent or already stopped containers are a no-op.
    pub async fn stop(&self, container: &str) -> HarborResult<()> {
        self.runtime.stop(container, self.config.stop_timeout()).await?;
        debug!(container = %container, "Stopped container");
        Ok(())
    }

    /// Containers, running or not, whose name starts with `prefix`
    pub async fn list_by_name_prefix(&self, prefix: &str) -> HarborResult<Vec<ContainerSummary>> {
        let mut containers = self.runtime.list(prefix).await?;
        containers.retain(|c| c.container.name.trim_start_matches('/').starts_with(prefix));
        containers.sort_by(|a, b| a.container.name.cmp(&b.container.name));
        Ok(containers)
    }

    /// Remove a container unless it is running. Returns whether it was removed.
    pub async fn remove_if_stopped(&self, container: &str) -> HarborResult<bool> {
        match self.runtime.inspect(container).await? {
            Some(details) if !details.state.is_running() => {
                self.runtime.remove(container).await?;
                info!(container = %container, state = details.state.as_str(), "Removed container");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub async fn inspect(&self, container: &str) -> HarborResult<Option<ContainerDetails>> {
        self.runtime.inspect(container).await
    }

    /// Address of a running container on the runtime's internal network
    pub async fn network_address(&self, container: &str) -> HarborResult<String> {
        self.inspect(container)
            .await?
            .and_then(|details| details.ip_address)
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| {
                HarborError::runtime("inspect", format!("{} has no network address", container))
            })
    }

    pub async fn exec(&self, container: &str, argv: Vec<String>) -> HarborResult<ExecOutput> {
        self.runtime.exec(container, argv, false).await
    }

    pub async fn exec_detached(&self, container: &str, argv: Vec<String>) -> HarborResult<()> {
        self.runtime.exec(container, argv, true).await.map(|_| ())
    }
}
