//! Serving shims
//!
//! A shim is a tiny HTTP app that loads the project's API script and answers
//! `POST /` with its prediction and `GET /debug` with a liveness string. Python
//! scripts are served with Flask, R scripts with plumber.

use crate::command::ScriptRuntime;
use crate::config::HarborConfig;
use crate::error::HarborResult;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const FLASK_APP: &str = r#"from flask import Flask, jsonify, request

from loader import model

app = Flask(__name__)
handler = getattr(model, "api_predict", None) or model.predict


@app.route("/", methods=["POST"])
def predict():
    return jsonify(handler(request.get_json(force=True)))


@app.route("/debug")
def debug():
    return "Hello!"
"#;

const PLUMBER_APP: &str = r#"#* @post /
function(req) {
  payload <- jsonlite::fromJSON(req$postBody)
  api_predict(payload)
}

#* @get /debug
function() {
  "Hello!"
}
"#;

/// Shim files for one API script, ready to stage and push
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServingShim {
    pub runtime: ScriptRuntime,
    /// Directory under the container working directory
    pub dir: &'static str,
    /// Entry file inside `dir`
    pub entry: &'static str,
    pub files: Vec<(&'static str, String)>,
}

impl ServingShim {
    /// Build the shim for `api_script`, a path relative to the project's `src/`
    pub fn for_script(api_script: &Path, config: &HarborConfig) -> HarborResult<Self> {
        let runtime = ScriptRuntime::from_path(api_script)?;
        let relative = api_script
            .to_string_lossy()
            .replace('\\', "/")
            .trim_start_matches("src/")
            .to_string();
        let src_dir = config.container_path("src");

        let shim = match runtime {
            ScriptRuntime::Python => {
                let module = relative
                    .rsplit_once('.')
                    .map(|(stem, _)| stem)
                    .unwrap_or(&relative)
                    .replace('/', ".");
                let loader = format!(
                    "import sys\nsys.path.append('{}')\nimport {} as model\n",
                    src_dir, module
                );
                Self {
                    runtime,
                    dir: "flask",
                    entry: "app.py",
                    files: vec![("app.py", FLASK_APP.to_string()), ("loader.py", loader)],
                }
            }
            ScriptRuntime::R => {
                let loader = format!("source('{}/{}')\n", src_dir, relative);
                let app = format!(
                    "source('{}')\n\n{}",
                    config.container_path("plumber/loader.R"),
                    PLUMBER_APP
                );
                Self {
                    runtime,
                    dir: "plumber",
                    entry: "plumber.R",
                    files: vec![("plumber.R", app), ("loader.R", loader)],
                }
            }
        };
        Ok(shim)
    }

    /// Entry point relative to the container working directory
    pub fn entry_path(&self) -> String {
        format!("{}/{}", self.dir, self.entry)
    }

    /// Write the shim files to a fresh directory under `scratch_dir`.
    /// The directory is removed when the returned guard drops.
    pub fn stage(&self, scratch_dir: &Path) -> HarborResult<TempDir> {
        fs::create_dir_all(scratch_dir)?;
        let staging = tempfile::Builder::new()
            .prefix(&format!("{}-", self.dir))
            .tempdir_in(scratch_dir)?;
        for (name, contents) in &self.files {
            fs::write(staging.path().join(name), contents)?;
        }
        Ok(staging)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HarborError;

    #[test]
    fn test_python_shim() {
        let shim = ServingShim::for_script(Path::new("deploy_iris.py"), &HarborConfig::default())
            .unwrap();
        assert_eq!(shim.runtime, ScriptRuntime::Python);
        assert_eq!(shim.entry_path(), "flask/app.py");

        let loader = &shim.files.iter().find(|(n, _)| *n == "loader.py").unwrap().1;
        assert!(loader.contains("sys.path.append('/var/harborml/src')"));
        assert!(loader.ends_with("import deploy_iris as model\n"));
    }

    #[test]
    fn test_python_shim_nested_module() {
        let shim = ServingShim::for_script(
            Path::new("src/api/deploy_iris.py"),
            &HarborConfig::default(),
        )
        .unwrap();
        let loader = &shim.files[1].1;
        assert!(loader.contains("import api.deploy_iris as model"));
    }

    #[test]
    fn test_r_shim() {
        let shim = ServingShim::for_script(Path::new("deploy_iris.R"), &HarborConfig::default())
            .unwrap();
        assert_eq!(shim.entry_path(), "plumber/plumber.R");
        let app = &shim.files[0].1;
        assert!(app.starts_with("source('/var/harborml/plumber/loader.R')"));
        assert!(app.contains("#* @post /"));
        assert_eq!(shim.files[1].1, "source('/var/harborml/src/deploy_iris.R')\n");
    }

    #[test]
    fn test_unsupported_script() {
        let err = ServingShim::for_script(Path::new("deploy_iris.jl"), &HarborConfig::default())
            .unwrap_err();
        assert!(matches!(err, HarborError::UnsupportedType(_)));
    }

    #[test]
    fn test_stage_is_removed_on_drop() {
        let scratch = TempDir::new().unwrap();
        let shim = ServingShim::for_script(Path::new("deploy_iris.py"), &HarborConfig::default())
            .unwrap();

        let staged = shim.stage(scratch.path()).unwrap();
        let path = staged.path().to_path_buf();
        assert!(path.join("app.py").is_file());
        assert!(path.join("loader.py").is_file());

        drop(staged);
        assert!(!path.exists());
    }
}
