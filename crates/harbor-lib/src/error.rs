//! Error types for harbor operations.
//!
//! Every workflow aborts on the first error; cleanup of ephemeral containers,
//! staging directories and temporary archives happens on the way out
//! regardless of which variant fired.

use thiserror::Error;

/// Result type alias for harbor operations.
pub type HarborResult<T> = Result<T, HarborError>;

/// Errors raised by the orchestration core.
#[derive(Debug, Error)]
pub enum HarborError {
    /// Missing project directory, build spec, input file or remote path
    #[error("not found: {0}")]
    NotFound(String),

    /// No script runtime matches the file extension
    #[error("unsupported script type: {0}")]
    UnsupportedType(String),

    /// A training or refresh command exited non-zero
    #[error("workload command exited with code {exit_code}:\n{output}")]
    WorkloadFailed { exit_code: i64, output: String },

    /// No name was supplied and none could be derived from the file name
    #[error("cannot derive a {kind} name from `{file}`, provide one explicitly")]
    NamingExtractionFailed { kind: &'static str, file: String },

    /// Any container runtime call that failed
    #[error("container runtime operation `{operation}` failed: {message}")]
    RuntimeOperationFailed {
        operation: &'static str,
        message: String,
    },

    /// Archive creation, extraction or transfer failed
    #[error("archive transfer failed: {context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The proxy config changed between read and write
    #[error("routing table changed concurrently (expected revision {expected}, found {found})")]
    RouteConflict { expected: u64, found: u64 },

    /// The proxy config could not be parsed or failed validation
    #[error("invalid proxy configuration: {0}")]
    ProxyConfig(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HarborError {
    /// Build a runtime error for the named operation
    pub fn runtime(operation: &'static str, message: impl ToString) -> Self {
        Self::RuntimeOperationFailed {
            operation,
            message: message.to_string(),
        }
    }

    /// Build a transport error with context
    pub fn transport(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Transport {
            context: context.into(),
            source,
        }
    }

    /// Returns true for errors that mean "the thing is not there"
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HarborError::NotFound("containers/default.dockerfile".to_string());
        assert_eq!(err.to_string(), "not found: containers/default.dockerfile");

        let err = HarborError::WorkloadFailed {
            exit_code: 1,
            output: "Traceback (most recent call last)".to_string(),
        };
        assert!(err.to_string().contains("code 1"));
        assert!(err.to_string().contains("Traceback"));

        let err = HarborError::NamingExtractionFailed {
            kind: "model",
            file: "iris.py".to_string(),
        };
        assert!(err.to_string().contains("iris.py"));
    }

    #[test]
    fn test_runtime_helper() {
        let err = HarborError::runtime("exec", "connection refused");
        assert!(matches!(
            err,
            HarborError::RuntimeOperationFailed {
                operation: "exec",
                ..
            }
        ));
        assert!(!err.is_not_found());
        assert!(HarborError::NotFound("x".into()).is_not_found());
    }
}
