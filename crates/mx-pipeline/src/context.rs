//! Per-run execution context and progress reporting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use mx_av::ArtifactStore;
use mx_core::RunId;

/// A progress report: which stage advanced, and the run's total.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub stage: String,
    /// Media time the stage has processed so far.
    pub stage_media: Duration,
    /// Sum over all stages; never decreases within a run.
    pub total_media: Duration,
}

/// Sender for reporting progress out of a run.
pub struct ProgressSender {
    callback: Box<dyn Fn(&ProgressUpdate) + Send + Sync>,
}

impl ProgressSender {
    /// Create a new sender from the given callback.
    pub fn new(callback: impl Fn(&ProgressUpdate) + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }

    /// Create a no-op sender that discards all progress reports.
    pub fn noop() -> Self {
        Self {
            callback: Box::new(|_| {}),
        }
    }

    pub fn send(&self, update: &ProgressUpdate) {
        (self.callback)(update);
    }
}

impl std::fmt::Debug for ProgressSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSender").finish_non_exhaustive()
    }
}

/// Aggregates per-stage media time into one non-decreasing counter.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    per_stage: Mutex<HashMap<String, Duration>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a marker for `stage`. Returns the update to publish, or `None`
    /// if the stage did not advance.
    pub fn observe(&self, stage: &str, media: Duration) -> Option<ProgressUpdate> {
        advance(&mut self.per_stage.lock(), stage, media)
    }

    /// Like [`observe`](Self::observe), but hands the update to `sender`
    /// before another stage can record, so published totals stay ordered.
    pub fn publish(&self, stage: &str, media: Duration, sender: &ProgressSender) -> Option<ProgressUpdate> {
        let mut per_stage = self.per_stage.lock();
        let update = advance(&mut per_stage, stage, media)?;
        sender.send(&update);
        Some(update)
    }

    pub fn stage_media(&self, stage: &str) -> Option<Duration> {
        self.per_stage.lock().get(stage).copied()
    }

    pub fn total(&self) -> Duration {
        self.per_stage.lock().values().sum()
    }
}

fn advance(per_stage: &mut HashMap<String, Duration>, stage: &str, media: Duration) -> Option<ProgressUpdate> {
    let entry = per_stage.entry(stage.to_string()).or_default();
    if media <= *entry {
        return None;
    }
    *entry = media;
    Some(ProgressUpdate {
        stage: stage.to_string(),
        stage_media: media,
        total_media: per_stage.values().sum(),
    })
}

/// Everything a run needs besides the graph and inputs.
pub struct RunContext {
    pub run_id: RunId,
    /// Scratch storage, exclusively owned by this run.
    pub store: Arc<ArtifactStore>,
    /// Caller-side cancellation; the run derives a child token from it.
    pub cancellation: CancellationToken,
    pub progress: Arc<ProgressSender>,
    /// Absolute run deadline.
    pub deadline: Option<Instant>,
}

impl RunContext {
    pub fn new(store: Arc<ArtifactStore>) -> Self {
        Self {
            run_id: store.run_id(),
            store,
            cancellation: CancellationToken::new(),
            progress: Arc::new(ProgressSender::noop()),
            deadline: None,
        }
    }

    /// Builder: attach a cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Builder: attach a progress sender.
    pub fn with_progress(mut self, progress: ProgressSender) -> Self {
        self.progress = Arc::new(progress);
        self
    }

    /// Builder: the whole run must finish within `timeout` from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}
