//! Project layout and identity
//!
//! A project is a directory with a fixed layout and a `harbor.toml` holding a
//! random hex identifier. The identifier namespaces every container and route
//! the project creates, so it is generated once and never rewritten.

use crate::config::{HarborConfig, PROJECT_FILE};
use crate::error::{HarborError, HarborResult};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const DATA_DIR: &str = "data";
pub const MODEL_DIR: &str = "model";
pub const SRC_DIR: &str = "src";
pub const CONTAINERS_DIR: &str = "containers";
pub const INCLUDES_DIR: &str = "containers/includes";
pub const TMP_DIR: &str = "tmp";

/// Bytes of entropy in a project identifier (32 hex digits)
const PROJECT_ID_BYTES: usize = 16;

const DEFAULT_DOCKERFILE: &str = "\
FROM python
RUN pip install scikit-learn pandas flask
";

const DEFAULT_PROXY_DOCKERFILE: &str = "\
FROM nginx:alpine
RUN apk update && apk add bash
COPY includes/nginx.conf /etc/nginx/nginx.conf
";

/// Proxy config installed into new projects and used when a project has none
pub const DEFAULT_PROXY_CONF: &str = "\
# harbor-revision 0
worker_processes 1;

events {
    worker_connections 1024;
}

http {
    sendfile on;
    keepalive_timeout 65;
}
";

#[derive(Debug, Serialize, Deserialize)]
struct ProjectFile {
    project_id: String,
}

/// An initialized harbor project
#[derive(Debug, Clone)]
pub struct Project {
    root: PathBuf,
    id: String,
    config: HarborConfig,
}

impl Project {
    /// Create the project layout under `root`.
    ///
    /// Existing files are left alone, so re-running on an initialized project
    /// keeps its identifier.
    pub fn init(root: impl AsRef<Path>) -> HarborResult<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(HarborError::NotFound(root.display().to_string()));
        }

        for dir in [TMP_DIR, DATA_DIR, CONTAINERS_DIR, INCLUDES_DIR, MODEL_DIR, SRC_DIR] {
            fs::create_dir_all(root.join(dir))?;
        }

        let config = HarborConfig::load(root)?;
        write_if_missing(
            &root.join(CONTAINERS_DIR).join(format!("default.{}", config.build_file_extension)),
            DEFAULT_DOCKERFILE,
        )?;
        write_if_missing(
            &root
                .join(CONTAINERS_DIR)
                .join(format!("{}.{}", config.proxy_container, config.build_file_extension)),
            DEFAULT_PROXY_DOCKERFILE,
        )?;
        write_if_missing(&root.join(INCLUDES_DIR).join("nginx.conf"), DEFAULT_PROXY_CONF)?;

        let identity = root.join(PROJECT_FILE);
        if !identity.exists() {
            let file = ProjectFile {
                project_id: generate_project_id(),
            };
            let contents = toml::to_string(&file)
                .map_err(|err| config::ConfigError::Message(err.to_string()))?;
            fs::write(&identity, contents)?;
            info!(root = %root.display(), project_id = %file.project_id, "Initialized project");
        }

        Self::open(root)
    }

    /// Open an existing project
    pub fn open(root: impl AsRef<Path>) -> HarborResult<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(HarborError::NotFound(root.display().to_string()));
        }
        let identity = root.join(PROJECT_FILE);
        if !identity.is_file() {
            return Err(HarborError::NotFound(identity.display().to_string()));
        }

        let raw = fs::read_to_string(&identity)?;
        let file: ProjectFile = toml::from_str(&raw).map_err(|err| {
            config::ConfigError::Message(format!("{}: {}", identity.display(), err))
        })?;
        validate_project_id(&file.project_id)?;

        Ok(Self {
            root: root.to_path_buf(),
            id: file.project_id,
            config: HarborConfig::load(root)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &HarborConfig {
        &self.config
    }

    pub fn src_dir(&self) -> PathBuf {
        self.root.join(SRC_DIR)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join(DATA_DIR)
    }

    /// Destination of a training run's output
    pub fn model_dir(&self, model_name: &str) -> PathBuf {
        self.root.join(MODEL_DIR).join(model_name)
    }

    /// Destination of a data refresh run's output
    pub fn dataset_dir(&self, dataset_name: &str) -> PathBuf {
        self.root.join(DATA_DIR).join(dataset_name)
    }

    pub fn includes_dir(&self) -> PathBuf {
        self.root.join(INCLUDES_DIR)
    }

    /// Scratch space for staging directories and archives
    pub fn scratch_dir(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }

    /// File name of a build spec, e.g. `default.dockerfile`
    pub fn build_spec_file_name(&self, container_name: &str) -> String {
        format!("{}.{}", container_name, self.config.build_file_extension)
    }

    pub fn build_spec_path(&self, container_name: &str) -> PathBuf {
        self.root
            .join(CONTAINERS_DIR)
            .join(self.build_spec_file_name(container_name))
    }

    /// Proxy config shipped with the project, or the built-in default
    pub fn proxy_conf(&self) -> HarborResult<String> {
        let path = self.includes_dir().join("nginx.conf");
        if path.is_file() {
            Ok(fs::read_to_string(path)?)
        } else {
            Ok(DEFAULT_PROXY_CONF.to_string())
        }
    }
}

fn write_if_missing(path: &Path, contents: &str) -> HarborResult<()> {
    if !path.exists() {
        fs::write(path, contents)?;
    }
    Ok(())
}

fn generate_project_id() -> String {
    let mut bytes = [0u8; PROJECT_ID_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn validate_project_id(id: &str) -> HarborResult<()> {
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(config::ConfigError::Message(format!(
            "project_id must be a non-empty hex string, got `{}`",
            id
        ))
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_creates_layout() {
        let dir = TempDir::new().unwrap();
        let project = Project::init(dir.path()).unwrap();

        for sub in [DATA_DIR, MODEL_DIR, SRC_DIR, CONTAINERS_DIR, INCLUDES_DIR, TMP_DIR] {
            assert!(dir.path().join(sub).is_dir(), "{} missing", sub);
        }
        assert!(project.build_spec_path("default").is_file());
        assert!(project.build_spec_path("nginx").is_file());
        assert!(project.includes_dir().join("nginx.conf").is_file());

        assert_eq!(project.id().len(), 32);
        assert!(hex::decode(project.id()).is_ok());
    }

    #[test]
    fn test_init_keeps_identifier() {
        let dir = TempDir::new().unwrap();
        let first = Project::init(dir.path()).unwrap();
        let second = Project::init(dir.path()).unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(Project::open(dir.path()).unwrap().id(), first.id());
    }

    #[test]
    fn test_open_missing() {
        let dir = TempDir::new().unwrap();
        assert!(Project::open(dir.path()).unwrap_err().is_not_found());
        assert!(Project::open(dir.path().join("absent")).unwrap_err().is_not_found());
    }

    #[test]
    fn test_open_rejects_bad_identifier() {
        let dir = TempDir::new().unwrap();
        for id in ["ab-cd", "zz42", ""] {
            fs::write(dir.path().join(PROJECT_FILE), format!("project_id = \"{}\"\n", id)).unwrap();
            assert!(
                matches!(Project::open(dir.path()), Err(HarborError::Config(_))),
                "`{}` should be rejected",
                id
            );
        }
        fs::write(dir.path().join(PROJECT_FILE), "project_id = \"0fA9\"\n").unwrap();
        assert_eq!(Project::open(dir.path()).unwrap().id(), "0fA9");
    }

    #[test]
    fn test_paths() {
        let dir = TempDir::new().unwrap();
        let project = Project::init(dir.path()).unwrap();
        assert_eq!(project.model_dir("iris"), dir.path().join("model/iris"));
        assert_eq!(project.dataset_dir("sales"), dir.path().join("data/sales"));
        assert_eq!(project.build_spec_file_name("default"), "default.dockerfile");
        assert!(project.proxy_conf().unwrap().contains("harbor-revision 0"));
    }
}
