//! Image builds from project build specs

use crate::archive::pack_to_vec;
use crate::error::{HarborError, HarborResult};
use crate::naming;
use crate::project::Project;
use crate::runtime::ContainerRuntime;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Builds `harborml_<name>:latest` images from `containers/<name>.<ext>`
#[derive(Clone)]
pub struct ImageBuilder {
    runtime: Arc<dyn ContainerRuntime>,
}

impl ImageBuilder {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Build the image for `container_name` and return its tag.
    ///
    /// The build context is a staging directory holding the build spec and a
    /// copy of `containers/includes/`; it is removed whether or not the build
    /// succeeds.
    pub async fn build(&self, project: &Project, container_name: &str) -> HarborResult<String> {
        let spec_path = project.build_spec_path(container_name);
        if !spec_path.is_file() {
            return Err(HarborError::NotFound(spec_path.display().to_string()));
        }

        let build_file = project.build_spec_file_name(container_name);
        let tag = naming::image_tag(&project.config().image_tag_prefix, container_name);

        let scratch = project.scratch_dir();
        fs::create_dir_all(&scratch)?;
        let staging = tempfile::Builder::new()
            .prefix(&format!("{}-", container_name))
            .tempdir_in(&scratch)?;

        fs::copy(&spec_path, staging.path().join(&build_file))?;
        let includes = project.includes_dir();
        if includes.is_dir() {
            copy_dir_all(&includes, &staging.path().join("includes"))?;
        } else {
            fs::create_dir_all(staging.path().join("includes"))?;
        }

        let context = pack_to_vec(staging.path())?;
        debug!(tag = %tag, context_bytes = context.len(), "Build context staged");

        let image_id = self.runtime.build_image(context, &build_file, &tag).await?;
        info!(tag = %tag, image_id = %image_id, "Built image");
        Ok(tag)
    }
}

fn copy_dir_all(from: &Path, to: &Path) -> HarborResult<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}
