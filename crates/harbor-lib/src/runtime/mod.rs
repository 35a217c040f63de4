//! Container runtime boundary
//!
//! Everything the orchestration core asks of a container runtime goes through
//! [`ContainerRuntime`]. [`DockerRuntime`] talks to a local Docker daemon;
//! [`MemoryRuntime`] keeps containers in-process for tests and dry runs.

mod docker;
mod memory;

pub use docker::DockerRuntime;
pub use memory::{ExecHandler, MemoryRuntime, MemoryContainer};

use crate::error::HarborResult;
use crate::models::{ContainerDetails, ContainerRef, ContainerSummary, ExecOutput, RunSpec};
use std::time::Duration;

pub use async_trait::async_trait;

/// Operations harbor needs from a container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Build an image from a tar'd context, returning the image id
    async fn build_image(&self, context: Vec<u8>, build_file: &str, tag: &str)
        -> HarborResult<String>;

    /// Create and start a detached container
    async fn run(&self, spec: RunSpec) -> HarborResult<ContainerRef>;

    /// Run a command inside a running container.
    /// Detached execs return without an exit code.
    async fn exec(&self, container: &str, argv: Vec<String>, detach: bool)
        -> HarborResult<ExecOutput>;

    /// Extract a tar archive into `path` inside the container
    async fn put_archive(&self, container: &str, path: &str, archive: Vec<u8>) -> HarborResult<()>;

    /// Fetch `path` from the container as a tar archive
    async fn get_archive(&self, container: &str, path: &str) -> HarborResult<Vec<u8>>;

    /// List containers, running or not, whose name contains `name_filter`
    async fn list(&self, name_filter: &str) -> HarborResult<Vec<ContainerSummary>>;

    /// Inspect a container, `None` if it does not exist
    async fn inspect(&self, container: &str) -> HarborResult<Option<ContainerDetails>>;

    async fn rename(&self, container: &str, new_name: &str) -> HarborResult<()>;

    /// Stop a container; absent or already stopped containers are not an error
    async fn stop(&self, container: &str, timeout: Duration) -> HarborResult<()>;

    async fn remove(&self, container: &str) -> HarborResult<()>;
}
