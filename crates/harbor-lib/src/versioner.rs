//! Deployment versions, derived from container names
//!
//! There is no persisted version counter. The live version of a model is the
//! highest `-<n>` suffix among containers named under its prefix, so a fresh
//! [`ProjectRoutingState`] is fetched at the start of every deploy and
//! undeploy and never cached across calls.

use crate::container::ContainerLifecycleManager;
use crate::error::HarborResult;
use crate::models::{ContainerSummary, DeploymentSummary};
use crate::naming::{self, DeploymentName};

/// A deployment container whose name decoded cleanly
#[derive(Debug, Clone)]
pub struct DeployedSlot {
    pub name: DeploymentName,
    pub container: ContainerSummary,
}

/// Deployment containers and proxy of one project at a point in time
#[derive(Debug, Clone)]
pub struct ProjectRoutingState {
    pub project_id: String,
    pub slots: Vec<DeployedSlot>,
    pub proxy: Option<ContainerSummary>,
}

impl ProjectRoutingState {
    pub async fn fetch(lifecycle: &ContainerLifecycleManager, project_id: &str) -> HarborResult<Self> {
        let mut slots: Vec<DeployedSlot> = lifecycle
            .list_by_name_prefix(&naming::namespace_prefix(project_id))
            .await?
            .into_iter()
            .filter_map(|container| {
                let name = DeploymentName::decode(&container.container.name)?;
                (name.project_id == project_id).then_some(DeployedSlot { name, container })
            })
            .collect();
        slots.sort_by(|a, b| {
            (a.name.model_name.as_str(), a.name.version)
                .cmp(&(b.name.model_name.as_str(), b.name.version))
        });

        let proxy_name = naming::proxy_container_name(project_id);
        let proxy = lifecycle
            .list_by_name_prefix(&proxy_name)
            .await?
            .into_iter()
            .find(|c| c.container.name.trim_start_matches('/') == proxy_name);

        Ok(Self {
            project_id: project_id.to_string(),
            slots,
            proxy,
        })
    }

    /// Every version of `model_name`, oldest first
    pub fn versions<'a>(&'a self, model_name: &'a str) -> impl Iterator<Item = &'a DeployedSlot> + 'a {
        self.slots
            .iter()
            .filter(move |slot| slot.name.model_name == model_name)
    }

    /// Highest deployed version of `model_name`; `None` when never deployed
    pub fn current_version(&self, model_name: &str) -> Option<u32> {
        self.versions(model_name).map(|slot| slot.name.version).max()
    }

    /// Versions of `model_name` whose containers are still running
    pub fn running_versions<'a>(
        &'a self,
        model_name: &'a str,
    ) -> impl Iterator<Item = &'a DeployedSlot> + 'a {
        self.versions(model_name)
            .filter(|slot| slot.container.state.is_running())
    }

    /// Version the next deploy of `model_name` will use
    pub fn next_version(&self, model_name: &str) -> u32 {
        self.current_version(model_name).map_or(0, |v| v + 1)
    }

    pub fn running(&self) -> impl Iterator<Item = &DeployedSlot> {
        self.slots
            .iter()
            .filter(|slot| slot.container.state.is_running())
    }

    pub fn summaries(&self) -> Vec<DeploymentSummary> {
        self.slots
            .iter()
            .map(|slot| DeploymentSummary {
                model_name: slot.name.model_name.clone(),
                version: slot.name.version,
                container_name: slot.container.container.name.clone(),
                state: slot.container.state,
                current: self.current_version(&slot.name.model_name) == Some(slot.name.version),
            })
            .collect()
    }
}

/// Version lookups for one project's deployments
#[derive(Clone)]
pub struct DeploymentVersioner {
    lifecycle: ContainerLifecycleManager,
    project_id: String,
}

impl DeploymentVersioner {
    pub fn new(lifecycle: ContainerLifecycleManager, project_id: impl Into<String>) -> Self {
        Self {
            lifecycle,
            project_id: project_id.into(),
        }
    }

    /// Fresh view of the project's deployment containers and proxy
    pub async fn snapshot(&self) -> HarborResult<ProjectRoutingState> {
        ProjectRoutingState::fetch(&self.lifecycle, &self.project_id).await
    }

    /// Highest deployed version, `None` meaning no deployment exists
    pub async fn current_version(&self, model_name: &str) -> HarborResult<Option<u32>> {
        Ok(self.snapshot().await?.current_version(model_name))
    }
}
