//! Docker-backed container runtime

use super::ContainerRuntime;
use crate::error::{HarborError, HarborResult};
use crate::models::{
    ContainerDetails, ContainerRef, ContainerState, ContainerSummary, ExecOutput, RunSpec,
};
use async_trait::async_trait;
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, ContainerStateStatusEnum, HostConfig, PortBinding};
use bollard::query_parameters::{
    BuildImageOptionsBuilder, CreateContainerOptionsBuilder, DownloadFromContainerOptionsBuilder,
    InspectContainerOptions, ListContainersOptionsBuilder, RemoveContainerOptionsBuilder,
    RenameContainerOptionsBuilder, StartContainerOptions, StopContainerOptionsBuilder,
    UploadToContainerOptionsBuilder,
};
use bollard::Docker;
use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::{Either, Full};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Container runtime backed by the local Docker daemon
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

fn status_code(err: &DockerError) -> Option<u16> {
    match err {
        DockerError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

fn map_state(status: Option<ContainerStateStatusEnum>) -> ContainerState {
    match status.unwrap_or(ContainerStateStatusEnum::EMPTY) {
        ContainerStateStatusEnum::CREATED => ContainerState::Created,
        ContainerStateStatusEnum::RUNNING => ContainerState::Running,
        ContainerStateStatusEnum::PAUSED => ContainerState::Paused,
        ContainerStateStatusEnum::RESTARTING => ContainerState::Restarting,
        ContainerStateStatusEnum::EXITED => ContainerState::Exited,
        ContainerStateStatusEnum::DEAD | ContainerStateStatusEnum::REMOVING => {
            ContainerState::Dead
        }
        _ => ContainerState::Unknown,
    }
}

impl DockerRuntime {
    /// Connect using the platform's default socket and environment
    pub fn connect() -> HarborResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|err| HarborError::runtime("connect", err))?;
        Ok(Self { docker })
    }

    /// Check that the daemon answers
    pub async fn ping(&self) -> HarborResult<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|err| HarborError::runtime("ping", err))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn build_image(
        &self,
        context: Vec<u8>,
        build_file: &str,
        tag: &str,
    ) -> HarborResult<String> {
        let options = BuildImageOptionsBuilder::default()
            .dockerfile(build_file)
            .t(tag)
            .rm(true)
            .build();
        let body = Either::Left(Full::new(Bytes::from(context)));

        let mut image_id = tag.to_string();
        let mut stream = self.docker.build_image(options, None, Some(body));
        while let Some(chunk) = stream.next().await {
            let info = chunk.map_err(|err| HarborError::runtime("build_image", err))?;
            if let Some(line) = info.stream {
                debug!(tag = %tag, "{}", line.trim_end());
            }
            if let Some(err) = info.error {
                return Err(HarborError::runtime("build_image", err));
            }
            if let Some(id) = info.aux.and_then(|aux| aux.id) {
                image_id = id;
            }
        }

        info!(tag = %tag, image_id = %image_id, "Image built");
        Ok(image_id)
    }

    async fn run(&self, spec: RunSpec) -> HarborResult<ContainerRef> {
        let mut port_bindings = HashMap::new();
        let mut exposed_ports = HashMap::new();
        for (container_port, host_port) in &spec.ports {
            let key = format!("{}/tcp", container_port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(host_port.to_string()),
                }]),
            );
        }

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            hostname: spec.hostname.clone(),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };
        let options = spec
            .name
            .as_deref()
            .map(|name| CreateContainerOptionsBuilder::default().name(name).build());

        let created = self
            .docker
            .create_container(options, body)
            .await
            .map_err(|err| HarborError::runtime("create_container", err))?;

        if let Err(err) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
        {
            let _ = self.remove(&created.id).await;
            return Err(HarborError::runtime("start_container", err));
        }

        let name = match spec.name {
            Some(name) => name,
            None => self
                .inspect(&created.id)
                .await?
                .map(|details| details.container.name)
                .unwrap_or_default(),
        };

        Ok(ContainerRef {
            id: created.id,
            name,
        })
    }

    async fn exec(
        &self,
        container: &str,
        argv: Vec<String>,
        detach: bool,
    ) -> HarborResult<ExecOutput> {
        let exec = self
            .docker
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(argv),
                    attach_stdout: Some(!detach),
                    attach_stderr: Some(!detach),
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| HarborError::runtime("create_exec", err))?;

        let started = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|err| HarborError::runtime("start_exec", err))?;

        let mut output = String::new();
        match started {
            StartExecResults::Attached { output: mut stream, .. } => {
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|err| HarborError::runtime("exec_output", err))?;
                    output.push_str(&chunk.to_string());
                }
            }
            StartExecResults::Detached => return Ok(ExecOutput::detached()),
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|err| HarborError::runtime("inspect_exec", err))?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code,
            output,
        })
    }

    async fn put_archive(&self, container: &str, path: &str, archive: Vec<u8>) -> HarborResult<()> {
        let options = UploadToContainerOptionsBuilder::default().path(path).build();
        self.docker
            .upload_to_container(
                container,
                Some(options),
                Either::Left(Full::new(Bytes::from(archive))),
            )
            .await
            .map_err(|err| match status_code(&err) {
                Some(404) => HarborError::NotFound(format!("{}:{}", container, path)),
                _ => HarborError::runtime("put_archive", err),
            })
    }

    async fn get_archive(&self, container: &str, path: &str) -> HarborResult<Vec<u8>> {
        let options = DownloadFromContainerOptionsBuilder::default().path(path).build();
        let mut stream = self.docker.download_from_container(container, Some(options));

        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => archive.extend_from_slice(&bytes),
                Err(err) if status_code(&err) == Some(404) => {
                    return Err(HarborError::NotFound(format!("{}:{}", container, path)));
                }
                Err(err) => return Err(HarborError::runtime("get_archive", err)),
            }
        }
        Ok(archive)
    }

    async fn list(&self, name_filter: &str) -> HarborResult<Vec<ContainerSummary>> {
        let filters = HashMap::from([("name", vec![name_filter.to_string()])]);
        let options = ListContainersOptionsBuilder::default()
            .all(true)
            .filters(&filters)
            .build();

        let listed = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|err| HarborError::runtime("list_containers", err))?;

        let mut summaries = Vec::with_capacity(listed.len());
        for summary in listed {
            let Some(id) = summary.id else { continue };
            // The listing may race with removal; skip what is already gone
            if let Some(details) = self.inspect(&id).await? {
                summaries.push(ContainerSummary {
                    container: details.container,
                    state: details.state,
                });
            }
        }
        Ok(summaries)
    }

    async fn inspect(&self, container: &str) -> HarborResult<Option<ContainerDetails>> {
        let inspect = match self
            .docker
            .inspect_container(container, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect,
            Err(err) if status_code(&err) == Some(404) => return Ok(None),
            Err(err) => return Err(HarborError::runtime("inspect_container", err)),
        };

        let ip_address = inspect
            .network_settings
            .and_then(|settings| settings.networks)
            .and_then(|networks| {
                networks
                    .into_values()
                    .filter_map(|endpoint| endpoint.ip_address)
                    .find(|ip| !ip.is_empty())
            });

        Ok(Some(ContainerDetails {
            container: ContainerRef {
                id: inspect.id.unwrap_or_else(|| container.to_string()),
                name: inspect
                    .name
                    .map(|name| name.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
            },
            state: map_state(inspect.state.and_then(|state| state.status)),
            hostname: inspect.config.and_then(|config| config.hostname),
            ip_address,
        }))
    }

    async fn rename(&self, container: &str, new_name: &str) -> HarborResult<()> {
        let options = RenameContainerOptionsBuilder::default().name(new_name).build();
        self.docker
            .rename_container(container, options)
            .await
            .map_err(|err| HarborError::runtime("rename_container", err))
    }

    async fn stop(&self, container: &str, timeout: Duration) -> HarborResult<()> {
        let options = StopContainerOptionsBuilder::default()
            .t(timeout.as_secs().min(3600).try_into().unwrap_or_default())
            .build();
        match self.docker.stop_container(container, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped, 404: no such container
            Err(err) if matches!(status_code(&err), Some(304) | Some(404)) => {
                debug!(container = %container, "Stop skipped, container not running");
                Ok(())
            }
            Err(err) => Err(HarborError::runtime("stop_container", err)),
        }
    }

    async fn remove(&self, container: &str) -> HarborResult<()> {
        let options = RemoveContainerOptionsBuilder::default().force(true).build();
        match self.docker.remove_container(container, Some(options)).await {
            Ok(()) => Ok(()),
            Err(err) if status_code(&err) == Some(404) => Ok(()),
            Err(err) => Err(HarborError::runtime("remove_container", err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    async fn docker_available() -> Option<DockerRuntime> {
        if env::var("HARBOR_DOCKER_TESTS").ok().as_deref() != Some("1") {
            return None;
        }
        let runtime = DockerRuntime::connect().ok()?;
        runtime.ping().await.ok()?;
        Some(runtime)
    }

    #[test]
    fn test_map_state() {
        assert_eq!(
            map_state(Some(ContainerStateStatusEnum::RUNNING)),
            ContainerState::Running
        );
        assert_eq!(
            map_state(Some(ContainerStateStatusEnum::EXITED)),
            ContainerState::Exited
        );
        assert_eq!(map_state(None), ContainerState::Unknown);
    }

    #[tokio::test]
    async fn test_stop_missing_container_is_noop() {
        let Some(runtime) = docker_available().await else {
            return;
        };
        runtime
            .stop("harbor-test-does-not-exist", Duration::ZERO)
            .await
            .expect("stop of a missing container should be a no-op");
        assert!(runtime
            .inspect("harbor-test-does-not-exist")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_run_exec_stop() {
        let Some(runtime) = docker_available().await else {
            return;
        };
        let container = runtime
            .run(RunSpec {
                image: "alpine:latest".to_string(),
                command: vec!["tail".into(), "-f".into(), "/dev/null".into()],
                name: Some("harbor-test-run-exec".to_string()),
                ..Default::default()
            })
            .await
            .expect("Failed to start container");

        let out = runtime
            .exec(&container.id, vec!["echo".into(), "hello".into()], false)
            .await
            .unwrap();
        assert!(out.is_success());
        assert!(out.output.contains("hello"));

        runtime.stop(&container.id, Duration::ZERO).await.unwrap();
        runtime.stop(&container.id, Duration::ZERO).await.unwrap();
        runtime.remove(&container.id).await.unwrap();
    }
}
