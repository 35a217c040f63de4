//! Harbor configuration
//!
//! Settings are layered: built-in defaults, then the project's `harbor.toml`,
//! then `HARBOR_*` environment variables.

use crate::error::HarborResult;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Name of the per-project settings and identity file
pub const PROJECT_FILE: &str = "harbor.toml";

/// Harbor configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HarborConfig {
    /// Working directory provisioned inside every container
    #[serde(default = "default_container_workdir")]
    pub container_workdir: String,

    /// Output subdirectory under the working directory
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Prefix for every image tag built by harbor
    #[serde(default = "default_image_tag_prefix")]
    pub image_tag_prefix: String,

    /// Extension of build-spec files under `containers/`
    #[serde(default = "default_build_file_extension")]
    pub build_file_extension: String,

    /// Build spec used for the reverse proxy
    #[serde(default = "default_proxy_container")]
    pub proxy_container: String,

    /// Port the proxy listens on, published on the host
    #[serde(default = "default_proxy_listen_port")]
    pub proxy_listen_port: u16,

    /// Port the serving shim listens on inside each deployment
    #[serde(default = "default_serving_port")]
    pub serving_port: u16,

    /// Location of the proxy config inside the proxy container
    #[serde(default = "default_proxy_conf_path")]
    pub proxy_conf_path: String,

    /// Grace period given to containers on stop
    #[serde(default)]
    pub stop_timeout_secs: u64,

    /// Attempts made while waiting for a remote directory to appear
    #[serde(default = "default_dir_ready_attempts")]
    pub dir_ready_attempts: u32,

    /// Delay between remote directory readiness checks
    #[serde(default = "default_dir_ready_interval_ms")]
    pub dir_ready_interval_ms: u64,

    /// Length of random scratch-file names
    #[serde(default = "default_temp_name_len")]
    pub temp_name_len: usize,
}

fn default_container_workdir() -> String {
    "/var/harborml".to_string()
}

fn default_output_dir() -> String {
    "output".to_string()
}

fn default_image_tag_prefix() -> String {
    "harborml_".to_string()
}

fn default_build_file_extension() -> String {
    "dockerfile".to_string()
}

fn default_proxy_container() -> String {
    "nginx".to_string()
}

fn default_proxy_listen_port() -> u16 {
    5000
}

fn default_serving_port() -> u16 {
    5000
}

fn default_proxy_conf_path() -> String {
    "/etc/nginx/nginx.conf".to_string()
}

fn default_dir_ready_attempts() -> u32 {
    20
}

fn default_dir_ready_interval_ms() -> u64 {
    50
}

fn default_temp_name_len() -> usize {
    16
}

impl Default for HarborConfig {
    fn default() -> Self {
        Self {
            container_workdir: default_container_workdir(),
            output_dir: default_output_dir(),
            image_tag_prefix: default_image_tag_prefix(),
            build_file_extension: default_build_file_extension(),
            proxy_container: default_proxy_container(),
            proxy_listen_port: default_proxy_listen_port(),
            serving_port: default_serving_port(),
            proxy_conf_path: default_proxy_conf_path(),
            stop_timeout_secs: 0,
            dir_ready_attempts: default_dir_ready_attempts(),
            dir_ready_interval_ms: default_dir_ready_interval_ms(),
            temp_name_len: default_temp_name_len(),
        }
    }
}

impl HarborConfig {
    /// Load configuration for the project rooted at `project_root`
    pub fn load(project_root: &Path) -> HarborResult<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(project_root.join(PROJECT_FILE)).required(false))
            .add_source(config::Environment::with_prefix("HARBOR"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Output directory inside containers
    pub fn container_output_dir(&self) -> String {
        format!(
            "{}/{}",
            self.container_workdir.trim_end_matches('/'),
            self.output_dir
        )
    }

    /// Path under the container working directory
    pub fn container_path(&self, relative: &str) -> String {
        format!(
            "{}/{}",
            self.container_workdir.trim_end_matches('/'),
            relative.trim_start_matches('/')
        )
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn dir_ready_interval(&self) -> Duration {
        Duration::from_millis(self.dir_ready_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = HarborConfig::default();
        assert_eq!(config.container_workdir, "/var/harborml");
        assert_eq!(config.container_output_dir(), "/var/harborml/output");
        assert_eq!(config.container_path("src"), "/var/harborml/src");
        assert_eq!(config.proxy_listen_port, 5000);
        assert_eq!(config.stop_timeout(), Duration::ZERO);
    }

    #[test]
    fn test_load_from_project_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(PROJECT_FILE),
            "project_id = \"abc\"\nproxy_listen_port = 8080\n",
        )
        .unwrap();

        let config = HarborConfig::load(dir.path()).unwrap();
        assert_eq!(config.proxy_listen_port, 8080);
        assert_eq!(config.serving_port, 5000);
    }

    #[test]
    fn test_load_without_project_file() {
        let dir = TempDir::new().unwrap();
        let config = HarborConfig::load(dir.path()).unwrap();
        assert_eq!(config.image_tag_prefix, "harborml_");
    }
}
