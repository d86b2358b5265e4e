//! # mx-pipeline
//!
//! Effect graphs and the machinery that runs them.
//!
//! - [`graph`]: stages wired by named slots, with validation and
//!   topological ordering.
//! - [`preset`]: named graph templates with `{param}` substitution.
//! - [`runner`]: concurrent stage scheduling with deadlines, cancellation
//!   and early artifact release.
//! - [`invoker`]: the production [`StageExecutor`] over ffmpeg and sox.
//! - [`assembler`]: delivery of the final output and cleanup.
//! - [`orchestrator`]: request admission, metrics, and the end-to-end flow.

pub mod assembler;
pub mod context;
pub mod executor;
pub mod graph;
pub mod invoker;
pub mod orchestrator;
pub mod preset;
pub mod runner;

pub use assembler::{FinalOutput, OutputData, OutputSink, ResultAssembler};
pub use context::{ProgressSender, ProgressTracker, ProgressUpdate, RunContext};
pub use executor::{StageExecutor, StageJob, StageOutcome, StageProgress};
pub use graph::{EffectGraph, StageSpec};
pub use invoker::EngineInvoker;
pub use orchestrator::{load_catalog, Orchestrator, ProcessRequest};
pub use preset::{Preset, PresetCatalog};
pub use runner::{
    PipelineRun, PipelineRunner, RunInput, RunState, RunnerConfig, StageResult, StageStatus,
};
