//! Shell commands for workloads and serving processes
//!
//! Commands are built as [`CommandSpec`] values and only rendered to a shell
//! string at the exec boundary; [`shell_quote`] is the one place escaping
//! happens.

use crate::config::HarborConfig;
use crate::error::{HarborError, HarborResult};
use std::fmt;
use std::path::Path;

/// Script ecosystems harbor knows how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptRuntime {
    Python,
    R,
}

impl ScriptRuntime {
    /// Resolve the runtime from a script's extension
    pub fn from_path(script: &Path) -> HarborResult<Self> {
        let extension = script
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("py") => Ok(ScriptRuntime::Python),
            Some("r") => Ok(ScriptRuntime::R),
            _ => Err(HarborError::UnsupportedType(script.display().to_string())),
        }
    }

    /// Interpreter used for batch scripts
    pub fn interpreter(&self) -> &'static str {
        match self {
            ScriptRuntime::Python => "python",
            ScriptRuntime::R => "Rscript",
        }
    }
}

impl fmt::Display for ScriptRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptRuntime::Python => f.write_str("python"),
            ScriptRuntime::R => f.write_str("r"),
        }
    }
}

/// Quote a string for POSIX shells
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./=:@%+,".contains(&b))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r#"'\''"#))
}

/// A command to run inside a container, before shell rendering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub workdir: String,
    pub env: Vec<(String, String)>,
    pub program: String,
    pub args: Vec<String>,
    /// File receiving combined stdout and stderr, appended to
    pub log_file: Option<String>,
}

impl CommandSpec {
    pub fn new(workdir: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            workdir: workdir.into(),
            env: Vec::new(),
            program: program.into(),
            args: Vec::new(),
            log_file: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn log_to(mut self, log_file: impl Into<String>) -> Self {
        self.log_file = Some(log_file.into());
        self
    }

    /// Render as a bash script
    pub fn render(&self) -> String {
        let mut steps = vec![format!("cd {}", shell_quote(&self.workdir))];
        for (key, value) in &self.env {
            steps.push(format!("export {}={}", key, shell_quote(value)));
        }

        let mut invocation = shell_quote(&self.program);
        for arg in &self.args {
            invocation.push(' ');
            invocation.push_str(&shell_quote(arg));
        }
        if let Some(log_file) = &self.log_file {
            invocation.push_str(&format!(" 2>&1 | tee -a {}", shell_quote(log_file)));
        }
        steps.push(invocation);

        format!("set -o pipefail && {}", steps.join(" && "))
    }

    /// Argument vector handed to the runtime's exec
    pub fn to_argv(&self) -> Vec<String> {
        vec!["bash".to_string(), "-c".to_string(), self.render()]
    }

    /// Single-line form, safe to paste into a shell
    pub fn to_shell_line(&self) -> String {
        format!("bash -c {}", shell_quote(&self.render()))
    }
}

/// Builds workload and serving commands
#[derive(Debug, Clone)]
pub struct CommandComposer {
    config: HarborConfig,
}

impl CommandComposer {
    pub fn new(config: HarborConfig) -> Self {
        Self { config }
    }

    fn log_file(&self) -> String {
        format!("./{}/log.log", self.config.output_dir)
    }

    /// Command running a training or refresh script from the project's `src/`
    pub fn training_command(&self, script: &Path) -> HarborResult<CommandSpec> {
        let runtime = ScriptRuntime::from_path(script)?;
        let script_path = format!("src/{}", to_unix(script));

        Ok(CommandSpec::new(&self.config.container_workdir, runtime.interpreter())
            .arg(script_path)
            .log_to(self.log_file()))
    }

    /// Command launching the serving shim found at `shim_path`
    /// (relative to the container working directory)
    pub fn serving_command(&self, runtime: ScriptRuntime, shim_path: &str) -> CommandSpec {
        let shim = self.config.container_path(shim_path);
        let port = self.config.serving_port.to_string();

        match runtime {
            ScriptRuntime::Python => CommandSpec::new(&self.config.container_workdir, "flask")
                .env("FLASK_APP", shim)
                .env("FLASK_ENV", "development")
                .arg("run")
                .arg("--host=0.0.0.0")
                .arg(format!("--port={}", port))
                .log_to(self.log_file()),
            ScriptRuntime::R => CommandSpec::new(&self.config.container_workdir, "R")
                .arg("-e")
                .arg(format!(
                    "plumber::plumb(\"{}\")$run(host=\"0.0.0.0\", port={})",
                    shim, port
                ))
                .log_to(self.log_file()),
        }
    }
}

fn to_unix(path: &Path) -> String {
    path.to_string_lossy()
        .replace('\\', "/")
        .trim_start_matches("src/")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn composer() -> CommandComposer {
        CommandComposer::new(HarborConfig::default())
    }

    #[test]
    fn test_runtime_from_path() {
        assert_eq!(
            ScriptRuntime::from_path(Path::new("train_iris.py")).unwrap(),
            ScriptRuntime::Python
        );
        assert_eq!(
            ScriptRuntime::from_path(Path::new("train_iris.R")).unwrap(),
            ScriptRuntime::R
        );
        assert!(matches!(
            ScriptRuntime::from_path(Path::new("train_iris.jl")),
            Err(HarborError::UnsupportedType(_))
        ));
        assert!(ScriptRuntime::from_path(Path::new("Makefile")).is_err());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("src/train_iris.py"), "src/train_iris.py");
        assert_eq!(shell_quote("my file.py"), "'my file.py'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("it's"), r#"'it'\''s'"#);
        assert_eq!(shell_quote("say \"hi\""), "'say \"hi\"'");
    }

    #[test]
    fn test_training_command() {
        let cmd = composer()
            .training_command(Path::new("train_iris.py"))
            .unwrap();
        assert_eq!(
            cmd.render(),
            "set -o pipefail && cd /var/harborml && python src/train_iris.py 2>&1 | tee -a ./output/log.log"
        );

        let cmd = composer()
            .training_command(Path::new("src/train_iris.R"))
            .unwrap();
        assert_eq!(cmd.program, "Rscript");
        assert_eq!(cmd.args, vec!["src/train_iris.R".to_string()]);
    }

    #[test]
    fn test_training_command_unsupported() {
        let err = composer()
            .training_command(Path::new("train_iris.sh"))
            .unwrap_err();
        assert!(matches!(err, HarborError::UnsupportedType(_)));
    }

    #[test]
    fn test_python_serving_command() {
        let cmd = composer().serving_command(ScriptRuntime::Python, "flask/app.py");
        let rendered = cmd.render();
        assert!(rendered.contains("export FLASK_APP=/var/harborml/flask/app.py"));
        assert!(rendered.contains("flask run --host=0.0.0.0 --port=5000"));
        assert!(rendered.ends_with("tee -a ./output/log.log"));
    }

    #[test]
    fn test_r_serving_command_survives_outer_quoting() {
        let cmd = composer().serving_command(ScriptRuntime::R, "plumber/plumber.R");
        let argv = cmd.to_argv();
        assert_eq!(argv[0], "bash");
        assert_eq!(argv[1], "-c");
        assert!(argv[2].contains(
            r#"'plumber::plumb("/var/harborml/plumber/plumber.R")$run(host="0.0.0.0", port=5000)'"#
        ));

        // One more layer of quoting keeps the embedded quotes intact
        let line = cmd.to_shell_line();
        assert!(line.starts_with("bash -c '"));
        assert!(line.contains(r#"'\''plumber::plumb("#));
    }
}
