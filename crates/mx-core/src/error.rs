//! Unified error type for the mixdown orchestrator.
//!
//! All crates funnel their failures into [`Error`]. Every variant maps to a
//! stable [`ErrorKind`] that callers and the metrics collaborator use instead
//! of matching on message text.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ids::ArtifactId;

/// Structural problems with an effect graph, always detected before any
/// engine is launched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// The graph declares no stages.
    #[error("graph has no stages")]
    Empty,

    /// Two stages share an id.
    #[error("duplicate stage id '{0}'")]
    DuplicateStage(String),

    /// The stage dependencies contain a cycle.
    #[error("cycle detected among stages: {}", .stages.join(", "))]
    Cycle {
        /// Stages that could not be ordered.
        stages: Vec<String>,
    },

    /// A stage (or the preset binding) references a slot nobody produces.
    #[error("stage '{stage}' reads unbound input '{slot}'")]
    UnboundInput {
        /// The consuming stage (or `preset` for binding failures).
        stage: String,
        /// The unbound slot.
        slot: String,
    },

    /// A produced slot is never consumed and is not the terminal output.
    #[error("output '{slot}' is never consumed")]
    DanglingOutput {
        /// The dangling slot.
        slot: String,
    },

    /// More than one producer for a slot.
    #[error("slot '{slot}' has more than one producer")]
    DuplicateProducer {
        /// The contested slot.
        slot: String,
    },

    /// No stage produces the terminal output.
    #[error("terminal output '{slot}' is not produced by any stage")]
    MissingTerminal {
        /// The terminal slot.
        slot: String,
    },

    /// The caller supplied an input the preset does not declare.
    #[error("unexpected input '{slot}'")]
    UnexpectedInput {
        /// The undeclared slot.
        slot: String,
    },
}

/// Unified error type covering all failure modes of a pipeline run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The effect graph is malformed.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// A stage's parameters cannot be turned into an engine invocation.
    #[error("Invalid stage [{stage}]: {message}")]
    InvalidStageSpec {
        /// The offending stage.
        stage: String,
        /// What is wrong with it.
        message: String,
    },

    /// The engine binary is missing or cannot be spawned.
    #[error("Engine unavailable [{tool}]: {message}")]
    EngineUnavailable {
        /// Tool name (e.g. "ffmpeg").
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    /// The engine ran and reported failure.
    #[error("Engine failed [{stage}] with {}: {diagnostics}", exit_label(.code))]
    EngineExit {
        /// The failing stage.
        stage: String,
        /// Exit code, `None` when terminated by a signal.
        code: Option<i32>,
        /// Bounded tail of the engine's diagnostic output.
        diagnostics: String,
    },

    /// The stage exceeded its deadline and was killed.
    #[error("Timeout [{stage}]: exceeded {after:?}")]
    Timeout {
        /// The stage that ran out of time.
        stage: String,
        /// The budget that was exceeded.
        after: Duration,
    },

    /// The run was cancelled by the caller.
    #[error("Cancelled [{stage}]")]
    Cancelled {
        /// The stage (or `run`) that observed the cancellation.
        stage: String,
    },

    /// Writing an artifact failed.
    #[error("Write error [{artifact}]: {source}")]
    Write {
        /// Artifact being written.
        artifact: ArtifactId,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Reading an artifact failed.
    #[error("Read error [{artifact}]: {source}")]
    Read {
        /// Artifact being read.
        artifact: ArtifactId,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The artifact has not been finalized yet.
    #[error("{artifact} is not ready")]
    NotReady {
        /// The artifact.
        artifact: ArtifactId,
    },

    /// The artifact was released or never existed.
    #[error("{artifact} not found")]
    ArtifactNotFound {
        /// The artifact.
        artifact: ArtifactId,
    },

    /// No preset with this id.
    #[error("Unknown preset: {0}")]
    UnknownPreset(String),

    /// The upload was refused before any processing.
    #[error("Input rejected: {0}")]
    InputRejected(String),

    /// Request or configuration data failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An I/O operation outside artifact handling failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {c}"),
        None => "signal".to_string(),
    }
}

/// Stable classification of an [`Error`], reported to callers and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Graph,
    InvalidStageSpec,
    EngineUnavailable,
    EngineExit,
    Timeout,
    Cancelled,
    Write,
    Read,
    NotReady,
    ArtifactNotFound,
    UnknownPreset,
    InputRejected,
    Validation,
    Io,
    Internal,
}

impl ErrorKind {
    /// Snake-case name, identical to the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Graph => "graph",
            ErrorKind::InvalidStageSpec => "invalid_stage_spec",
            ErrorKind::EngineUnavailable => "engine_unavailable",
            ErrorKind::EngineExit => "engine_exit",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Write => "write",
            ErrorKind::Read => "read",
            ErrorKind::NotReady => "not_ready",
            ErrorKind::ArtifactNotFound => "artifact_not_found",
            ErrorKind::UnknownPreset => "unknown_preset",
            ErrorKind::InputRejected => "input_rejected",
            ErrorKind::Validation => "validation",
            ErrorKind::Io => "io",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Graph(_) => ErrorKind::Graph,
            Error::InvalidStageSpec { .. } => ErrorKind::InvalidStageSpec,
            Error::EngineUnavailable { .. } => ErrorKind::EngineUnavailable,
            Error::EngineExit { .. } => ErrorKind::EngineExit,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Cancelled { .. } => ErrorKind::Cancelled,
            Error::Write { .. } => ErrorKind::Write,
            Error::Read { .. } => ErrorKind::Read,
            Error::NotReady { .. } => ErrorKind::NotReady,
            Error::ArtifactNotFound { .. } => ErrorKind::ArtifactNotFound,
            Error::UnknownPreset(_) => ErrorKind::UnknownPreset,
            Error::InputRejected(_) => ErrorKind::InputRejected,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Io { .. } => ErrorKind::Io,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Map this error to an HTTP status code for the upload front end.
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::Graph
            | ErrorKind::InvalidStageSpec
            | ErrorKind::UnknownPreset
            | ErrorKind::Validation => 400,
            ErrorKind::InputRejected => 415,
            ErrorKind::EngineExit => 422,
            ErrorKind::Cancelled => 499,
            ErrorKind::EngineUnavailable => 503,
            ErrorKind::Timeout => 504,
            ErrorKind::Write
            | ErrorKind::Read
            | ErrorKind::NotReady
            | ErrorKind::ArtifactNotFound
            | ErrorKind::Io
            | ErrorKind::Internal => 500,
        }
    }

    /// Whether a caller may reasonably retry (with a larger budget or a
    /// smaller input). Engine failures are deterministic and never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Timeout)
    }

    /// Captured engine diagnostics, if any.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Error::EngineExit { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }

    /// Convenience constructor for [`Error::InvalidStageSpec`].
    pub fn invalid_stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Error::InvalidStageSpec {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::EngineUnavailable`].
    pub fn engine_unavailable(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::EngineUnavailable {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_error_display() {
        let err = Error::from(GraphError::Cycle {
            stages: vec!["a".into(), "b".into()],
        });
        assert_eq!(err.to_string(), "Graph error: cycle detected among stages: a, b");
        assert_eq!(err.kind(), ErrorKind::Graph);
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn engine_exit_display_with_code() {
        let err = Error::EngineExit {
            stage: "mix".into(),
            code: Some(1),
            diagnostics: "Invalid argument".into(),
        };
        assert_eq!(
            err.to_string(),
            "Engine failed [mix] with exit code 1: Invalid argument"
        );
        assert_eq!(err.diagnostics(), Some("Invalid argument"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn engine_exit_display_with_signal() {
        let err = Error::EngineExit {
            stage: "mix".into(),
            code: None,
            diagnostics: String::new(),
        };
        assert!(err.to_string().contains("with signal"));
    }

    #[test]
    fn timeout_is_retryable() {
        let err = Error::Timeout {
            stage: "stretch".into(),
            after: Duration::from_secs(1),
        };
        assert!(err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.http_status(), 504);
    }

    #[test]
    fn engine_unavailable_display() {
        let err = Error::engine_unavailable("sox", "not found");
        assert_eq!(err.to_string(), "Engine unavailable [sox]: not found");
        assert_eq!(err.http_status(), 503);
    }

    #[test]
    fn artifact_errors_name_the_artifact() {
        let err = Error::NotReady {
            artifact: ArtifactId::from_raw(3),
        };
        assert_eq!(err.to_string(), "artifact-0003 is not ready");
        assert_eq!(err.kind(), ErrorKind::NotReady);
    }

    #[test]
    fn io_from_std() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io { .. }));
        assert_eq!(err.http_status(), 500);
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::EngineExit).unwrap();
        assert_eq!(json, "\"engine_exit\"");
        assert_eq!(ErrorKind::InvalidStageSpec.to_string(), "invalid_stage_spec");
    }
}
