//! Turns a finished run into the caller's deliverable, then releases every
//! artifact the run still holds.

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use mx_core::{Error, Result, RunId};

use crate::runner::{PipelineRun, StageResult};

/// Where the final output should end up.
#[derive(Debug, Clone, Default)]
pub enum OutputSink {
    /// Return the bytes.
    #[default]
    Memory,
    /// Copy the output to this path.
    File(PathBuf),
}

/// The delivered output.
#[derive(Debug, Clone)]
pub enum OutputData {
    Bytes(Bytes),
    File(PathBuf),
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct FinalOutput {
    pub run_id: RunId,
    pub data: OutputData,
    pub content_type: String,
    /// Suggested download name.
    pub file_name: String,
    pub size_bytes: u64,
    /// Duration of the output as reported by the last stage.
    pub media_duration: Option<Duration>,
    /// Media time processed across all stages.
    pub media_processed: Duration,
    pub processing_time: Duration,
    pub stages: Vec<StageResult>,
}

impl FinalOutput {
    /// The bytes, for in-memory outputs.
    pub fn bytes(&self) -> Option<&Bytes> {
        match &self.data {
            OutputData::Bytes(b) => Some(b),
            OutputData::File(_) => None,
        }
    }
}

/// Delivers run outputs.
pub struct ResultAssembler;

impl ResultAssembler {
    /// Deliver the terminal artifact of `run` into `sink`, or hand back the
    /// run's error. Every artifact is released either way; cleanup problems
    /// are logged and never mask the outcome.
    pub async fn assemble(mut run: PipelineRun, sink: &OutputSink) -> Result<FinalOutput> {
        let outcome = match run.error.take() {
            Some(err) => Err(err),
            None => deliver(&run, sink).await,
        };

        let released = run.store.release_remaining();
        debug!(run_id = %run.run_id.short(), "released {released} artifacts");
        let live = run.store.live_count();
        if live > 0 {
            warn!(run_id = %run.run_id.short(), "{live} artifacts still live after cleanup");
        }
        outcome
    }
}

async fn deliver(run: &PipelineRun, sink: &OutputSink) -> Result<FinalOutput> {
    let id = run
        .terminal()
        .ok_or_else(|| Error::Internal("run finished without a terminal artifact".into()))?;
    let artifact = run
        .store
        .get(id)
        .ok_or(Error::ArtifactNotFound { artifact: id })?;

    let (data, size_bytes) = match sink {
        OutputSink::Memory => {
            let bytes = run.store.read_bytes(id).await?;
            let size = bytes.len() as u64;
            (OutputData::Bytes(bytes), size)
        }
        OutputSink::File(dest) => {
            let size = run.store.copy_to(id, dest).await?;
            (OutputData::File(dest.clone()), size)
        }
    };

    let output = FinalOutput {
        run_id: run.run_id,
        data,
        content_type: artifact.format.content_type().to_string(),
        file_name: run.graph.output_file_name(),
        size_bytes,
        media_duration: run.media_duration(),
        media_processed: run.media_processed(),
        processing_time: run.elapsed,
        stages: run.stages.clone(),
    };
    info!(
        run_id = %run.run_id.short(),
        "delivered {} ({} bytes)",
        output.file_name,
        output.size_bytes
    );
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunContext;
    use crate::executor::{StageExecutor, StageJob, StageOutcome};
    use crate::graph::{EffectGraph, StageSpec};
    use crate::runner::{PipelineRunner, RunInput, RunnerConfig};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use mx_av::{ArtifactStore, EngineKind};
    use std::sync::Arc;

    struct Fixed(Option<&'static str>);

    #[async_trait]
    impl StageExecutor for Fixed {
        async fn execute(&self, job: StageJob) -> StageOutcome {
            match self.0 {
                Some(body) => {
                    tokio::fs::write(&job.output, body).await.unwrap();
                    StageOutcome::success(Some(Duration::from_secs(3)))
                }
                None => StageOutcome::failure(Error::EngineExit {
                    stage: job.stage.id,
                    code: Some(1),
                    diagnostics: "boom".into(),
                }),
            }
        }
    }

    async fn finished(body: Option<&'static str>) -> (tempfile::TempDir, Arc<ArtifactStore>, PipelineRun) {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(ArtifactStore::create(root.path(), RunId::new()).unwrap());
        let graph = EffectGraph::new("trim", ["audio_track"], "output")
            .with_file_name("trimmed.mp3")
            .stage(StageSpec::new("trim", EngineKind::TrimResample, ["audio_track"], "output"));
        let run = PipelineRunner::new(Arc::new(Fixed(body)), RunnerConfig::default())
            .run(
                graph,
                vec![RunInput::new("audio_track", "audio/mpeg", "ID3")],
                RunContext::new(store.clone()),
            )
            .await;
        (root, store, run)
    }

    #[tokio::test]
    async fn delivers_bytes_and_releases_everything() {
        let (_root, store, run) = finished(Some("mp3-data")).await;
        let out = ResultAssembler::assemble(run, &OutputSink::Memory).await.unwrap();

        assert_eq!(out.bytes().unwrap(), &Bytes::from_static(b"mp3-data"));
        assert_eq!(out.content_type, "audio/mpeg");
        assert_eq!(out.file_name, "trimmed.mp3");
        assert_eq!(out.size_bytes, 8);
        assert_eq!(out.media_duration, Some(Duration::from_secs(3)));
        assert_eq!(store.live_count(), 0);
    }

    #[tokio::test]
    async fn delivers_to_file() {
        let (root, store, run) = finished(Some("mp3-data")).await;
        let dest = root.path().join("final.mp3");
        let out = ResultAssembler::assemble(run, &OutputSink::File(dest.clone()))
            .await
            .unwrap();

        assert_matches!(out.data, OutputData::File(ref p) if *p == dest);
        assert_eq!(std::fs::read(&dest).unwrap(), b"mp3-data");
        assert_eq!(store.live_count(), 0);
    }

    #[tokio::test]
    async fn failed_run_returns_its_error_and_cleans_up() {
        let (_root, store, run) = finished(None).await;
        let err = ResultAssembler::assemble(run, &OutputSink::Memory).await.unwrap_err();

        assert_matches!(err, Error::EngineExit { ref stage, .. } if stage == "trim");
        assert_eq!(store.live_count(), 0);
    }

    #[tokio::test]
    async fn cleanup_failure_keeps_the_run_error() {
        let (_root, store, run) = finished(None).await;
        let upload = run.slot("audio_track").unwrap();
        let path = store.input_path(upload).unwrap();
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("held"), b"x").unwrap();

        let err = ResultAssembler::assemble(run, &OutputSink::Memory).await.unwrap_err();

        assert_matches!(err, Error::EngineExit { ref diagnostics, .. } if diagnostics == "boom");
        assert!(path.is_dir());
        assert_eq!(store.live_count(), 0);
    }
}
