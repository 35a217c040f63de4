//! Naming grammar for everything harbor creates in the container runtime
//!
//! Deployment containers are named `deploy-<project-id>-<model>-<version>`,
//! the shared proxy `reverse_proxy-deploy-<project-id>-`, and images
//! `<prefix><container>:latest`. All encoding and decoding of these names
//! lives here.

use crate::error::{HarborError, HarborResult};
use crate::models::WorkloadKind;
use std::fmt;
use std::path::Path;

const DEPLOY_PREFIX: &str = "deploy";
const PROXY_PREFIX: &str = "reverse_proxy";

/// Filename prefixes accepted for training scripts
pub const TRAIN_FILE_PREFIXES: &[&str] = &["train"];
/// Filename prefixes accepted for data refresh scripts
pub const REFRESH_FILE_PREFIXES: &[&str] = &["refresh", "data"];
/// Filename prefixes accepted for serving API scripts
pub const DEPLOY_FILE_PREFIXES: &[&str] = &["deploy", "api"];

/// Versioned identity of a model-serving container
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeploymentName {
    pub project_id: String,
    pub model_name: String,
    pub version: u32,
}

impl DeploymentName {
    pub fn new(project_id: impl Into<String>, model_name: impl Into<String>, version: u32) -> Self {
        Self {
            project_id: project_id.into(),
            model_name: model_name.into(),
            version,
        }
    }

    /// Encode as a container name
    pub fn encode(&self) -> String {
        format!("{}{}", model_prefix(&self.project_id, &self.model_name), self.version)
    }

    /// Decode a container name produced by [`DeploymentName::encode`]
    pub fn decode(name: &str) -> Option<Self> {
        let name = name.trim_start_matches('/');
        let rest = name.strip_prefix(DEPLOY_PREFIX)?.strip_prefix('-')?;
        let (project_id, rest) = rest.split_once('-')?;
        let (model_name, version) = rest.rsplit_once('-')?;

        if project_id.is_empty() || model_name.is_empty() {
            return None;
        }
        if !version.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        Some(Self {
            project_id: project_id.to_string(),
            model_name: model_name.to_string(),
            version: version.parse().ok()?,
        })
    }
}

impl fmt::Display for DeploymentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Prefix shared by every deployment container of a project
pub fn namespace_prefix(project_id: &str) -> String {
    format!("{}-{}-", DEPLOY_PREFIX, project_id)
}

/// Prefix shared by every version of one model
pub fn model_prefix(project_id: &str, model_name: &str) -> String {
    format!("{}{}-", namespace_prefix(project_id), model_name)
}

/// Canonical name of the project's reverse proxy container
pub fn proxy_container_name(project_id: &str) -> String {
    format!("{}-{}", PROXY_PREFIX, namespace_prefix(project_id))
}

/// URL path served for a model behind the proxy
pub fn route_path(model_name: &str) -> String {
    format!("/{}/", model_name)
}

/// Image tag for a build spec; rebuilding the same container overwrites it
pub fn image_tag(tag_prefix: &str, container_name: &str) -> String {
    format!("{}{}:latest", tag_prefix, container_name)
}

/// Derive a model or dataset name from a `<kind>_<name>.<ext>` file name
pub fn extract_name(kind: WorkloadKind, script: &Path) -> HarborResult<String> {
    let (prefixes, label) = match kind {
        WorkloadKind::Train => (TRAIN_FILE_PREFIXES, "model"),
        WorkloadKind::RefreshData => (REFRESH_FILE_PREFIXES, "dataset"),
        WorkloadKind::Deploy => (DEPLOY_FILE_PREFIXES, "model"),
    };
    let failed = || HarborError::NamingExtractionFailed {
        kind: label,
        file: script.display().to_string(),
    };

    let file_name = script
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(failed)?;
    let stem = file_name.split('.').next().unwrap_or_default();
    let parts: Vec<&str> = stem.split('_').collect();

    if parts.len() <= 1 || !prefixes.contains(&parts[0].to_lowercase().as_str()) {
        return Err(failed());
    }

    let name = parts[1..].join("_").to_lowercase();
    if name.is_empty() {
        return Err(failed());
    }
    Ok(name)
}
