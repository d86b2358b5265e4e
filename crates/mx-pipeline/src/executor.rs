//! The seam between the runner and whatever actually processes audio.
//!
//! The runner hands a [`StageExecutor`] one fully resolved [`StageJob`] at a
//! time: input paths are ready artifacts, the output path is reserved, the
//! budget is already capped by the run deadline. Production uses
//! [`EngineInvoker`](crate::EngineInvoker); tests plug in simulated engines.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use mx_av::ArtifactFormat;
use mx_core::{Result, RunId};

use crate::context::{ProgressSender, ProgressTracker};
use crate::graph::StageSpec;

/// Progress handle for one stage.
#[derive(Clone)]
pub struct StageProgress {
    stage: String,
    tracker: Arc<ProgressTracker>,
    sender: Arc<ProgressSender>,
}

impl StageProgress {
    pub fn new(stage: impl Into<String>, tracker: Arc<ProgressTracker>, sender: Arc<ProgressSender>) -> Self {
        Self {
            stage: stage.into(),
            tracker,
            sender,
        }
    }

    /// A handle that reports nowhere.
    pub fn detached(stage: impl Into<String>) -> Self {
        Self::new(
            stage,
            Arc::new(ProgressTracker::new()),
            Arc::new(ProgressSender::noop()),
        )
    }

    /// Report how much media this stage has processed.
    pub fn report(&self, media: Duration) {
        if let Some(update) = self.tracker.publish(&self.stage, media, &self.sender) {
            tracing::debug!(
                stage = %self.stage,
                "progress {:.1}s (run total {:.1}s)",
                media.as_secs_f64(),
                update.total_media.as_secs_f64()
            );
        }
    }
}

impl std::fmt::Debug for StageProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageProgress")
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}

/// One stage, ready to run.
#[derive(Debug, Clone)]
pub struct StageJob {
    pub run_id: RunId,
    pub stage: StageSpec,
    /// Ready input artifacts, in slot order.
    pub inputs: Vec<PathBuf>,
    /// Where the engine must write its result.
    pub output: PathBuf,
    pub output_format: ArtifactFormat,
    /// Time allowed from now.
    pub budget: Duration,
    pub cancel: CancellationToken,
    pub progress: StageProgress,
}

/// What came out of one stage.
#[derive(Debug)]
pub struct StageOutcome {
    pub result: Result<()>,
    /// Tail of the engine's output.
    pub diagnostics: Vec<String>,
    /// Last media time the engine reported.
    pub media_time: Option<Duration>,
}

impl StageOutcome {
    pub fn success(media_time: Option<Duration>) -> Self {
        Self {
            result: Ok(()),
            diagnostics: Vec::new(),
            media_time,
        }
    }

    pub fn failure(error: mx_core::Error) -> Self {
        Self {
            result: Err(error),
            diagnostics: Vec::new(),
            media_time: None,
        }
    }

    pub fn with_diagnostics(mut self, lines: Vec<String>) -> Self {
        self.diagnostics = lines;
        self
    }
}

/// Runs a single stage. Must never leave a process behind once the returned
/// future completes or is dropped.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(&self, job: StageJob) -> StageOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn stage_progress_publishes_advances_only() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let tracker = Arc::new(ProgressTracker::new());
        let sender = Arc::new(ProgressSender::new(move |u| sink.lock().push(u.total_media)));

        let a = StageProgress::new("a", tracker.clone(), sender.clone());
        let b = StageProgress::new("b", tracker, sender);
        a.report(Duration::from_secs(30));
        b.report(Duration::from_secs(5));
        a.report(Duration::from_secs(30));
        a.report(Duration::from_secs(40));

        assert_eq!(
            *seen.lock(),
            vec![
                Duration::from_secs(30),
                Duration::from_secs(35),
                Duration::from_secs(45)
            ]
        );
    }

    #[test]
    fn outcome_constructors() {
        let ok = StageOutcome::success(Some(Duration::from_secs(2)));
        assert!(ok.result.is_ok());
        let failed = StageOutcome::failure(mx_core::Error::Internal("x".into()))
            .with_diagnostics(vec!["line".into()]);
        assert!(failed.result.is_err());
        assert_eq!(failed.diagnostics, vec!["line".to_string()]);
    }
}
