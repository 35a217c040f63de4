//! Archive-based file exchange between the host and containers
//!
//! Directories travel as tar archives. Every archive is staged in a uniquely
//! named scratch file under the project's `tmp/` so concurrent transfers for
//! the same project never collide, and the scratch file is removed on every
//! exit path.

use crate::config::HarborConfig;
use crate::error::{HarborError, HarborResult};
use crate::runtime::ContainerRuntime;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Random lower-case alphanumeric name of a fixed length
pub fn random_name(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

/// Scratch archive file, removed when dropped
struct ScratchArchive {
    path: PathBuf,
}

impl ScratchArchive {
    fn create(scratch_dir: &Path, name_len: usize) -> HarborResult<(Self, File)> {
        fs::create_dir_all(scratch_dir).map_err(|err| {
            HarborError::transport(format!("create {}", scratch_dir.display()), err)
        })?;
        let path = scratch_dir.join(format!("{}.tar", random_name(name_len)));
        let file = File::options()
            .write(true)
            .read(true)
            .create_new(true)
            .open(&path)
            .map_err(|err| HarborError::transport(format!("create {}", path.display()), err))?;
        Ok((Self { path }, file))
    }
}

impl Drop for ScratchArchive {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "Failed to remove scratch archive");
            }
        }
    }
}

/// Moves directories into and out of containers
#[derive(Clone)]
pub struct ArchiveTransport {
    runtime: Arc<dyn ContainerRuntime>,
    config: HarborConfig,
    scratch_dir: PathBuf,
}

impl ArchiveTransport {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        config: HarborConfig,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runtime,
            config,
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Copy the contents of `local_dir` (not the directory itself) to
    /// `remote_path` inside the container, creating it if needed
    pub async fn push(&self, container: &str, local_dir: &Path, remote_path: &str) -> HarborResult<()> {
        if !local_dir.is_dir() {
            return Err(HarborError::NotFound(local_dir.display().to_string()));
        }

        let (scratch, file) = ScratchArchive::create(&self.scratch_dir, self.config.temp_name_len)?;
        let archive = pack_dir(local_dir, file, &scratch.path)?;

        self.ensure_remote_dir(container, remote_path).await?;
        self.runtime.put_archive(container, remote_path, archive).await?;

        debug!(
            container = %container,
            local = %local_dir.display(),
            remote = %remote_path,
            "Pushed directory"
        );
        Ok(())
    }

    /// Copy `remote_path` out of the container into `local_dir`.
    /// A remote directory's contents land directly in `local_dir`.
    pub async fn pull(&self, container: &str, remote_path: &str, local_dir: &Path) -> HarborResult<PathBuf> {
        let archive = self.runtime.get_archive(container, remote_path).await?;

        let (scratch, mut file) = ScratchArchive::create(&self.scratch_dir, self.config.temp_name_len)?;
        file.write_all(&archive)
            .and_then(|_| file.sync_all())
            .map_err(|err| HarborError::transport(format!("write {}", scratch.path.display()), err))?;
        drop(file);

        fs::create_dir_all(local_dir)
            .map_err(|err| HarborError::transport(format!("create {}", local_dir.display()), err))?;
        let reader = File::open(&scratch.path)
            .map_err(|err| HarborError::transport(format!("open {}", scratch.path.display()), err))?;
        unpack_stripped(reader, local_dir)?;

        debug!(
            container = %container,
            remote = %remote_path,
            local = %local_dir.display(),
            "Pulled directory"
        );
        Ok(local_dir.to_path_buf())
    }

    /// Create `remote_path` and wait until the container reports it present.
    ///
    /// The runtime's exec can return before the directory is visible to the
    /// archive endpoint, so readiness is polled a bounded number of times.
    pub async fn ensure_remote_dir(&self, container: &str, remote_path: &str) -> HarborResult<()> {
        let created = self
            .runtime
            .exec(
                container,
                vec!["mkdir".into(), "-p".into(), remote_path.to_string()],
                false,
            )
            .await?;
        if matches!(created.exit_code, Some(code) if code != 0) {
            return Err(HarborError::runtime(
                "mkdir",
                format!("{}: {}", remote_path, created.output.trim()),
            ));
        }

        let attempts = self.config.dir_ready_attempts.max(1);
        for attempt in 1..=attempts {
            let ready = self
                .runtime
                .exec(
                    container,
                    vec!["test".into(), "-d".into(), remote_path.to_string()],
                    false,
                )
                .await?;
            if ready.is_success() {
                return Ok(());
            }
            debug!(container = %container, path = %remote_path, attempt, "Remote directory not ready");
            tokio::time::sleep(self.config.dir_ready_interval()).await;
        }

        Err(HarborError::runtime(
            "mkdir",
            format!("{} not present after {} checks", remote_path, attempts),
        ))
    }
}

fn pack_dir(local_dir: &Path, file: File, scratch_path: &Path) -> HarborResult<Vec<u8>> {
    let context = || format!("pack {}", local_dir.display());

    let mut builder = tar::Builder::new(file);
    builder
        .append_dir_all(".", local_dir)
        .map_err(|err| HarborError::transport(context(), err))?;
    let mut file = builder
        .into_inner()
        .map_err(|err| HarborError::transport(context(), err))?;
    file.flush()
        .map_err(|err| HarborError::transport(context(), err))?;
    drop(file);

    let mut archive = Vec::new();
    File::open(scratch_path)
        .and_then(|mut f| f.read_to_end(&mut archive))
        .map_err(|err| HarborError::transport(context(), err))?;
    Ok(archive)
}

/// Pack a directory's contents into an in-memory tar archive
pub fn pack_to_vec(local_dir: &Path) -> HarborResult<Vec<u8>> {
    let context = || format!("pack {}", local_dir.display());
    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_dir_all(".", local_dir)
        .map_err(|err| HarborError::transport(context(), err))?;
    builder
        .into_inner()
        .map_err(|err| HarborError::transport(context(), err))
}

/// Unpack an archive, dropping the first path component of every entry
fn unpack_stripped<R: Read>(reader: R, local_dir: &Path) -> HarborResult<()> {
    let context = || format!("unpack into {}", local_dir.display());
    let mut archive = tar::Archive::new(reader);

    for entry in archive
        .entries()
        .map_err(|err| HarborError::transport(context(), err))?
    {
        let mut entry = entry.map_err(|err| HarborError::transport(context(), err))?;
        let path = entry
            .path()
            .map_err(|err| HarborError::transport(context(), err))?
            .into_owned();

        let stripped: PathBuf = path
            .components()
            .filter(|c| !matches!(c, Component::CurDir))
            .skip(1)
            .collect();

        if stripped.as_os_str().is_empty() {
            // Single-file archives carry the file itself at the top level
            if entry.header().entry_type().is_file() {
                entry
                    .unpack_in(local_dir)
                    .map_err(|err| HarborError::transport(context(), err))?;
            }
            continue;
        }

        if !stripped.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(HarborError::transport(
                context(),
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("entry escapes target: {}", path.display()),
                ),
            ));
        }
        let destination = local_dir.join(&stripped);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|err| HarborError::transport(context(), err))?;
        }
        entry
            .unpack(&destination)
            .map_err(|err| HarborError::transport(context(), err))?;
    }
    Ok(())
}
