//! # mx-av
//!
//! External audio engine plumbing for the mixdown orchestrator.
//!
//! This crate provides:
//!
//! - **Tool discovery** ([`ToolRegistry`]) -- find and cache paths to
//!   ffmpeg and sox.
//! - **Command execution** ([`ToolCommand`]) -- async builder that runs one
//!   engine subprocess in its own process group, streams its output lines,
//!   and kills the whole group on deadline, cancellation or drop.
//! - **Progress parsing** ([`progress`]) -- `time=` and `out_time_us=` markers and a
//!   coarse-grained throttle.
//! - **Diagnostics** ([`DiagnosticRing`]) -- bounded capture of engine output.
//! - **Artifact storage** ([`ArtifactStore`]) -- run-partitioned scratch files
//!   with an allocate / finalize / open / release lifecycle.
//! - **Engine argument builders** ([`engines`]) -- one function per
//!   [`EngineKind`] turning stage parameters into an argument list.

pub mod artifacts;
pub mod command;
pub mod diagnostics;
pub mod engines;
pub mod progress;
pub mod tools;

// ---- Re-exports for convenience ----

pub use artifacts::{Artifact, ArtifactFormat, ArtifactStore, ByteSource};
pub use command::ToolCommand;
pub use diagnostics::DiagnosticRing;
pub use engines::{build_invocation, EngineInvocation, EngineKind, ParamValue, StageParams};
pub use progress::{is_progress_line, parse_time_marker, ProgressThrottle};
pub use tools::{ToolConfig, ToolInfo, ToolRegistry};
