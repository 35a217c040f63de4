//! Workflows: train, refresh data, deploy, undeploy
//!
//! Every workflow runs sequentially and aborts on the first error. Containers
//! a workflow starts are stopped on the way out unless the caller asked to
//! keep them, and deploys and undeploys of one project are serialized.

use crate::archive::ArchiveTransport;
use crate::command::CommandComposer;
use crate::container::{ContainerLifecycleManager, StartOptions};
use crate::error::{HarborError, HarborResult};
use crate::image::ImageBuilder;
use crate::models::{
    ContainerRef, ContainerSummary, DeploymentReport, DeploymentSummary, WorkloadKind,
    WorkloadOutcome,
};
use crate::naming::{self, DeploymentName};
use crate::observability::{HarborMetrics, StructuredLogger};
use crate::project::Project;
use crate::proxy::{ReverseProxyRouter, Route, RouteUpdate};
use crate::runtime::ContainerRuntime;
use crate::shim::ServingShim;
use crate::versioner::{DeployedSlot, DeploymentVersioner};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Options for train and refresh-data runs
#[derive(Debug, Clone, Default)]
pub struct WorkloadOptions {
    /// Model or dataset name; derived from the script name when absent
    pub name: Option<String>,
    /// Leave the container running after the run
    pub keep_alive: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    /// Derived from the script name when absent
    pub model_name: Option<String>,
    /// Also copy the project's `data/` into the serving container
    pub include_data: bool,
}

/// Deployments, proxy, and live routes of a project
#[derive(Debug, Clone)]
pub struct ProjectStatus {
    pub deployments: Vec<DeploymentSummary>,
    pub proxy: Option<ContainerSummary>,
    pub routes: Vec<Route>,
}

/// Runs harbor workflows against one project
#[derive(Clone)]
pub struct Orchestrator {
    project: Project,
    lifecycle: ContainerLifecycleManager,
    images: ImageBuilder,
    transport: ArchiveTransport,
    router: ReverseProxyRouter,
    versioner: DeploymentVersioner,
    composer: CommandComposer,
    metrics: HarborMetrics,
    logger: StructuredLogger,
    deploy_lock: Arc<Mutex<()>>,
}

impl Orchestrator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, project: Project) -> Self {
        let config = project.config().clone();
        let lifecycle = ContainerLifecycleManager::new(runtime.clone(), config.clone());
        let images = ImageBuilder::new(runtime.clone());
        let transport = ArchiveTransport::new(runtime, config.clone(), project.scratch_dir());
        let router = ReverseProxyRouter::new(
            project.clone(),
            lifecycle.clone(),
            images.clone(),
            transport.clone(),
        );

        Self {
            versioner: DeploymentVersioner::new(lifecycle.clone(), project.id()),
            logger: StructuredLogger::new(project.id()),
            composer: CommandComposer::new(config),
            metrics: HarborMetrics::new(),
            deploy_lock: Arc::new(Mutex::new(())),
            project,
            lifecycle,
            images,
            transport,
            router,
        }
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn router(&self) -> &ReverseProxyRouter {
        &self.router
    }

    /// Build one container image without running anything
    pub async fn build_container(&self, container_name: &str) -> HarborResult<String> {
        self.images.build(&self.project, container_name).await
    }

    /// Train a model; output lands in `model/<name>/`
    pub async fn train(
        &self,
        container_name: &str,
        script: &Path,
        options: WorkloadOptions,
    ) -> HarborResult<WorkloadOutcome> {
        self.run_workload(WorkloadKind::Train, container_name, script, options)
            .await
    }

    /// Refresh a dataset; output lands in `data/<name>/`
    pub async fn refresh_data(
        &self,
        container_name: &str,
        script: &Path,
        options: WorkloadOptions,
    ) -> HarborResult<WorkloadOutcome> {
        self.run_workload(WorkloadKind::RefreshData, container_name, script, options)
            .await
    }

    /// Path of `script` relative to `src/`, checked to exist
    fn source_script(&self, script: &Path) -> HarborResult<PathBuf> {
        let relative = script.strip_prefix(crate::project::SRC_DIR).unwrap_or(script);
        let full = self.project.src_dir().join(relative);
        if !full.is_file() {
            return Err(HarborError::NotFound(full.display().to_string()));
        }
        Ok(relative.to_path_buf())
    }

    async fn run_workload(
        &self,
        kind: WorkloadKind,
        container_name: &str,
        script: &Path,
        options: WorkloadOptions,
    ) -> HarborResult<WorkloadOutcome> {
        let name = match options.name {
            Some(name) => name,
            None => naming::extract_name(kind, script)?,
        };
        let script = self.source_script(script)?;
        let command = self.composer.training_command(&script)?;
        let destination = match kind {
            WorkloadKind::RefreshData => self.project.dataset_dir(&name),
            _ => self.project.model_dir(&name),
        };

        let started = Instant::now();
        let tag = self.images.build(&self.project, container_name).await?;
        let container = self.lifecycle.start(&tag, StartOptions::default()).await?;
        self.logger.log_workflow_started(kind, &name, &container.name);

        let result = async {
            self.push_project(&container, true, None).await?;

            info!(container = %container.name, command = %command.to_shell_line(), "Running workload");
            let out = self.lifecycle.exec(&container.id, command.to_argv()).await?;
            match out.exit_code {
                Some(0) => {}
                Some(exit_code) => {
                    return Err(HarborError::WorkloadFailed {
                        exit_code,
                        output: out.output,
                    })
                }
                None => return Err(HarborError::runtime("exec", "workload returned no exit code")),
            }

            self.transport
                .pull(&container.id, &self.project.config().container_output_dir(), &destination)
                .await
        }
        .await;

        let elapsed = started.elapsed().as_secs_f64();
        match result {
            Ok(output_dir) => {
                self.metrics.observe_workflow(kind, elapsed);
                self.logger.log_workflow_finished(kind, &name, elapsed);
                info!(output = %output_dir.display(), "Run output written");
                if options.keep_alive {
                    info!(container = %container.name, "Container still running");
                    return Ok(WorkloadOutcome::KeptAlive { output_dir, container });
                }
                self.stop_container(&container).await?;
                Ok(WorkloadOutcome::Completed { output_dir })
            }
            Err(err) => {
                self.metrics.inc_workload_failures(kind);
                self.logger.log_workflow_failed(kind, &name, &err.to_string());
                if options.keep_alive {
                    warn!(container = %container.name, "Keeping failed container for inspection");
                } else if let Err(stop_err) = self.stop_container(&container).await {
                    warn!(container = %container.name, error = %stop_err, "Failed to stop container");
                }
                Err(err)
            }
        }
    }

    /// Copy `src/`, optionally `data/`, and optionally one model's artifacts
    async fn push_project(
        &self,
        container: &ContainerRef,
        include_data: bool,
        include_model: Option<&str>,
    ) -> HarborResult<()> {
        let config = self.project.config();
        self.transport
            .push(&container.id, &self.project.src_dir(), &config.container_path("src"))
            .await?;

        let data = self.project.data_dir();
        if include_data && data.is_dir() {
            self.transport
                .push(&container.id, &data, &config.container_path("data"))
                .await?;
        }

        if let Some(model) = include_model {
            let artifacts = self.project.model_dir(model);
            if artifacts.is_dir() {
                self.transport
                    .push(
                        &container.id,
                        &artifacts,
                        &config.container_path(&format!("model/{}", model)),
                    )
                    .await?;
            } else {
                debug!(model = %model, "No trained artifacts to copy");
            }
        }
        Ok(())
    }

    async fn stop_container(&self, container: &ContainerRef) -> HarborResult<()> {
        self.lifecycle.stop(&container.id).await?;
        self.metrics.inc_containers_stopped();
        Ok(())
    }

    /// Blue/green deploy of a model behind the project's reverse proxy.
    ///
    /// The new version is started, wired into the proxy, and only then are
    /// the model's other running versions stopped.
    pub async fn deploy(
        &self,
        container_name: &str,
        api_script: &Path,
        options: DeployOptions,
    ) -> HarborResult<DeploymentReport> {
        let model_name = match options.model_name {
            Some(name) => name,
            None => naming::extract_name(WorkloadKind::Deploy, api_script)?,
        };
        let api_script = self.source_script(api_script)?;
        let shim = ServingShim::for_script(&api_script, self.project.config())?;

        let _guard = self.deploy_lock.lock().await;
        let started = Instant::now();

        let tag = self.images.build(&self.project, container_name).await?;
        let state = self.versioner.snapshot().await?;
        let previous = state.running_versions(&model_name).last().cloned();
        let retiring: Vec<ContainerRef> = state
            .running_versions(&model_name)
            .map(|slot| slot.container.container.clone())
            .collect();
        let name = DeploymentName::new(self.project.id(), &model_name, state.next_version(&model_name));
        info!(model = %model_name, version = name.version, "Deployment version");

        let container = self
            .lifecycle
            .start(
                &tag,
                StartOptions {
                    hostname: Some(name.encode()),
                    name: Some(name.encode()),
                    ..Default::default()
                },
            )
            .await?;
        self.logger
            .log_workflow_started(WorkloadKind::Deploy, &model_name, &container.name);

        let address = match self
            .wire_deployment(&container, &name, &shim, options.include_data, previous.as_ref())
            .await
        {
            Ok(address) => address,
            Err(err) => {
                self.metrics.inc_workload_failures(WorkloadKind::Deploy);
                self.logger
                    .log_workflow_failed(WorkloadKind::Deploy, &model_name, &err.to_string());
                if let Err(stop_err) = self.stop_container(&container).await {
                    warn!(container = %container.name, error = %stop_err, "Failed to stop container");
                }
                return Err(err);
            }
        };

        // The new version is routed; retiring old ones must not undo that
        for old in &retiring {
            match self.stop_container(old).await {
                Ok(()) => debug!(container = %old.name, "Retired previous version"),
                Err(err) => warn!(container = %old.name, error = %err, "Failed to stop previous version"),
            }
        }

        let elapsed = started.elapsed().as_secs_f64();
        self.metrics.inc_deploys();
        self.metrics.observe_workflow(WorkloadKind::Deploy, elapsed);
        self.logger
            .log_workflow_finished(WorkloadKind::Deploy, &model_name, elapsed);

        Ok(DeploymentReport {
            route: naming::route_path(&model_name),
            version: name.version,
            model_name,
            container,
            address,
            retired: retiring.into_iter().map(|old| old.name).collect(),
            deployed_at: Utc::now(),
        })
    }

    async fn wire_deployment(
        &self,
        container: &ContainerRef,
        name: &DeploymentName,
        shim: &ServingShim,
        include_data: bool,
        previous: Option<&DeployedSlot>,
    ) -> HarborResult<String> {
        let config = self.project.config();
        self.push_project(container, include_data, Some(&name.model_name))
            .await?;

        let staged = shim.stage(&self.project.scratch_dir())?;
        self.transport
            .push(&container.id, staged.path(), &config.container_path(shim.dir))
            .await?;
        drop(staged);

        let command = self
            .composer
            .serving_command(shim.runtime, &shim.entry_path());
        info!(container = %container.name, command = %command.to_shell_line(), "Starting serving shim");
        self.lifecycle
            .exec_detached(&container.id, command.to_argv())
            .await?;

        let proxy = self.router.ensure_proxy().await?;
        let address = format!(
            "{}:{}",
            self.lifecycle.network_address(&container.id).await?,
            config.serving_port
        );

        let evict = previous.map(|slot| slot.name.encode());
        self.router
            .add_or_replace(
                &proxy.id,
                &RouteUpdate {
                    model_name: name.model_name.clone(),
                    upstream: name.encode(),
                    address: address.clone(),
                    evict: evict.clone(),
                },
            )
            .await?;
        self.metrics.inc_route_swaps();
        self.logger
            .log_route_swap(&name.model_name, evict.as_deref(), &name.encode(), &address);
        Ok(address)
    }

    /// Stop the serving containers of one model and drop its route.
    /// Returns the version that was live, `None` when nothing was deployed.
    pub async fn undeploy_single(&self, model_name: &str) -> HarborResult<Option<u32>> {
        let _guard = self.deploy_lock.lock().await;
        let started = Instant::now();

        let state = self.versioner.snapshot().await?;
        let Some(current) = state.current_version(model_name) else {
            self.logger.log_nothing_deployed(model_name);
            return Ok(None);
        };

        if let Some(proxy) = self.router.running_proxy().await? {
            self.router.remove_route(&proxy.id, model_name).await?;
        }

        let running: Vec<&DeployedSlot> = state.running_versions(model_name).collect();
        if running.is_empty() {
            self.logger.log_nothing_deployed(model_name);
            return Ok(None);
        }
        for slot in &running {
            self.stop_container(&slot.container.container).await?;
        }

        self.metrics.inc_undeploys(running.len() as u64);
        self.metrics.observe_undeploy(started.elapsed().as_secs_f64());
        self.logger.log_undeploy(model_name, current);
        Ok(Some(current))
    }

    /// Stop every deployment of the project and clear its routes.
    /// The reverse proxy keeps running. Returns how many containers were stopped.
    pub async fn undeploy_all(&self) -> HarborResult<usize> {
        let _guard = self.deploy_lock.lock().await;
        let started = Instant::now();
        info!(project_id = %self.project.id(), "Undeploying all models in project");

        let state = self.versioner.snapshot().await?;
        if let Some(proxy) = self.router.running_proxy().await? {
            self.router.prune_all(&proxy.id).await?;
        }

        let mut stopped = 0;
        for slot in state.running() {
            self.stop_container(&slot.container.container).await?;
            self.logger.log_undeploy(&slot.name.model_name, slot.name.version);
            stopped += 1;
        }

        self.metrics.inc_undeploys(stopped as u64);
        self.metrics.observe_undeploy(started.elapsed().as_secs_f64());
        Ok(stopped)
    }

    /// Highest deployed version of a model, `None` meaning never deployed
    pub async fn current_version(&self, model_name: &str) -> HarborResult<Option<u32>> {
        self.versioner.current_version(model_name).await
    }

    pub async fn status(&self) -> HarborResult<ProjectStatus> {
        let state = self.versioner.snapshot().await?;
        let routes = match state.proxy.as_ref().filter(|p| p.state.is_running()) {
            Some(proxy) => self.router.read_config(&proxy.container.id).await?.0.routes()?,
            None => Vec::new(),
        };
        Ok(ProjectStatus {
            deployments: state.summaries(),
            proxy: state.proxy,
            routes,
        })
    }
}
