//! Runs a validated effect graph stage by stage.
//!
//! Stages start as soon as every slot they read is ready, with at most
//! `max_parallel` engines running at once. The first stage failure cancels
//! everything still in flight; stages that never started are recorded as
//! skipped. Intermediate artifacts are released as soon as every stage
//! reading them has succeeded.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mx_av::{ArtifactFormat, ArtifactStore, ByteSource};
use mx_core::config::PipelineConfig;
use mx_core::{ArtifactId, Error, ErrorKind, GraphError, Result, RunId};

use crate::context::{ProgressTracker, RunContext};
use crate::executor::{StageExecutor, StageJob, StageOutcome, StageProgress};
use crate::graph::EffectGraph;

/// Extra time an executor gets past its budget to enforce the deadline
/// itself (and reap its process) before the runner drops it.
const BUDGET_SLACK: Duration = Duration::from_millis(250);

/// Scheduling knobs.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub max_parallel: usize,
    /// Budget for stages that declare none.
    pub stage_timeout: Duration,
    /// How long in-flight stages get to stop after a failure.
    pub cancel_grace: Duration,
}

impl From<&PipelineConfig> for RunnerConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_parallel: config.max_parallel_stages.max(1),
            stage_timeout: config.stage_timeout(),
            cancel_grace: config.cancel_grace(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

/// One uploaded input, bound to an external slot of the graph.
#[derive(Debug, Clone)]
pub struct RunInput {
    pub role: String,
    pub content_type: String,
    pub data: Bytes,
}

impl RunInput {
    pub fn new(role: impl Into<String>, content_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            role: role.into(),
            content_type: content_type.into(),
            data: data.into(),
        }
    }
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Validating,
    Running,
    Succeeded,
    Failed,
}

/// How a single stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
    /// Never started because the run failed first.
    Skipped,
}

impl StageStatus {
    fn from_error(error: &Error) -> Self {
        match error.kind() {
            ErrorKind::Timeout => Self::TimedOut,
            ErrorKind::Cancelled => Self::Cancelled,
            _ => Self::Failed,
        }
    }
}

/// Record of one stage within a run.
#[derive(Debug, Clone)]
pub struct StageResult {
    pub stage: String,
    pub status: StageStatus,
    /// Wall time spent executing (zero for skipped stages).
    pub duration: Duration,
    pub media_time: Option<Duration>,
    pub diagnostics: Vec<String>,
    pub error: Option<String>,
    /// The artifact written, for succeeded stages.
    pub artifact: Option<ArtifactId>,
}

impl StageResult {
    fn unfinished(stage: &str, status: StageStatus) -> Self {
        Self {
            stage: stage.to_string(),
            status,
            duration: Duration::ZERO,
            media_time: None,
            diagnostics: Vec::new(),
            error: None,
            artifact: None,
        }
    }
}

/// Everything known about a run once [`PipelineRunner::run`] returns.
#[derive(Debug)]
pub struct PipelineRun {
    pub run_id: RunId,
    pub graph: EffectGraph,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    /// Stage records: finished stages in completion order, then the rest.
    pub stages: Vec<StageResult>,
    /// The first error, when the run failed.
    pub error: Option<Error>,
    pub store: Arc<ArtifactStore>,
    pub progress: Arc<ProgressTracker>,
    slots: HashMap<String, ArtifactId>,
}

impl PipelineRun {
    fn new(graph: EffectGraph, store: Arc<ArtifactStore>) -> Self {
        Self {
            run_id: store.run_id(),
            graph,
            state: RunState::Validating,
            started_at: Utc::now(),
            elapsed: Duration::ZERO,
            stages: Vec::new(),
            error: None,
            store,
            progress: Arc::new(ProgressTracker::new()),
            slots: HashMap::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == RunState::Succeeded
    }

    pub fn stage(&self, id: &str) -> Option<&StageResult> {
        self.stages.iter().find(|r| r.stage == id)
    }

    /// Artifact bound to `slot`, if it was produced (or uploaded).
    pub fn slot(&self, slot: &str) -> Option<ArtifactId> {
        self.slots.get(slot).copied()
    }

    /// The final output, only for succeeded runs.
    pub fn terminal(&self) -> Option<ArtifactId> {
        if self.succeeded() {
            self.slot(&self.graph.terminal)
        } else {
            None
        }
    }

    /// Media duration reported by the stage that wrote the final output.
    pub fn media_duration(&self) -> Option<Duration> {
        let producer = self.graph.producer_of(&self.graph.terminal)?;
        self.stage(&self.graph.stages[producer].id)?.media_time
    }

    /// Total media time processed across all stages.
    pub fn media_processed(&self) -> Duration {
        self.progress.total()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(Error::kind)
    }

    fn record(&mut self, result: StageResult) {
        self.stages.push(result);
    }
}

/// A stage task's report back to the scheduler.
struct Finished {
    index: usize,
    output: ArtifactId,
    outcome: StageOutcome,
    elapsed: Duration,
}

/// Executes effect graphs over a [`StageExecutor`].
#[derive(Clone)]
pub struct PipelineRunner {
    executor: Arc<dyn StageExecutor>,
    config: RunnerConfig,
}

impl PipelineRunner {
    pub fn new(executor: Arc<dyn StageExecutor>, config: RunnerConfig) -> Self {
        Self { executor, config }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run `graph` with `inputs` bound to its external slots.
    ///
    /// Never panics on stage failure; the outcome is in the returned
    /// [`PipelineRun`]. Nothing is spawned unless the graph validates and
    /// every input binds.
    pub async fn run(&self, graph: EffectGraph, inputs: Vec<RunInput>, ctx: RunContext) -> PipelineRun {
        let started = Instant::now();
        let mut run = PipelineRun::new(graph, ctx.store.clone());

        info!(
            run_id = %run.run_id.short(),
            graph = %run.graph.name,
            "running {} stages",
            run.graph.stages.len()
        );

        match self.drive(&mut run, inputs, &ctx).await {
            Ok(()) if run.slot(&run.graph.terminal).is_some() => run.state = RunState::Succeeded,
            Ok(()) => {
                run.state = RunState::Failed;
                run.error = Some(Error::Internal(format!(
                    "terminal slot '{}' was never produced",
                    run.graph.terminal
                )));
            }
            Err(e) => {
                run.state = RunState::Failed;
                run.error = Some(e);
            }
        }

        // Stages that never reported.
        let missing: Vec<String> = run
            .graph
            .stages
            .iter()
            .filter(|s| run.stage(&s.id).is_none())
            .map(|s| s.id.clone())
            .collect();
        for id in missing {
            run.record(StageResult::unfinished(&id, StageStatus::Skipped));
        }

        run.elapsed = started.elapsed();
        match &run.error {
            None => info!(
                run_id = %run.run_id.short(),
                "run succeeded in {:.2}s",
                run.elapsed.as_secs_f64()
            ),
            Some(e) => error!(
                run_id = %run.run_id.short(),
                kind = e.kind().as_str(),
                "run failed after {:.2}s: {e}",
                run.elapsed.as_secs_f64()
            ),
        }
        run
    }

    async fn drive(&self, run: &mut PipelineRun, inputs: Vec<RunInput>, ctx: &RunContext) -> Result<()> {
        run.graph.validate()?;
        check_bindings(&run.graph, &inputs)?;
        if ctx.cancellation.is_cancelled() {
            return Err(Error::Cancelled { stage: "run".into() });
        }

        for input in inputs {
            let artifact = run
                .store
                .allocate(&input.role, ArtifactFormat::from_content_type(&input.content_type));
            run.store.finalize(artifact.id, ByteSource::Bytes(input.data)).await?;
            run.slots.insert(input.role, artifact.id);
        }

        run.state = RunState::Running;
        self.schedule(run, ctx).await
    }

    async fn schedule(&self, run: &mut PipelineRun, ctx: &RunContext) -> Result<()> {
        let graph = run.graph.clone();
        let order = graph.topological_order()?;
        let deps = graph.dependencies();
        let mut waiting_on: Vec<usize> = deps.iter().map(Vec::len).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); graph.stages.len()];
        for (i, ds) in deps.iter().enumerate() {
            for &d in ds {
                dependents[d].push(i);
            }
        }
        let mut unread: HashMap<String, usize> = HashMap::new();

        let cancel = ctx.cancellation.child_token();
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let mut tasks: JoinSet<Finished> = JoinSet::new();
        let mut in_flight: BTreeSet<usize> = BTreeSet::new();
        let mut ready: VecDeque<usize> = order.into_iter().filter(|&i| waiting_on[i] == 0).collect();
        let mut failure: Option<Error> = None;

        loop {
            while failure.is_none() {
                let Some(index) = ready.pop_front() else {
                    break;
                };
                match self.launch(index, run, ctx, &cancel, &semaphore, &mut tasks) {
                    Ok(()) => {
                        in_flight.insert(index);
                    }
                    Err(e) => {
                        let mut result = StageResult::unfinished(&graph.stages[index].id, StageStatus::from_error(&e));
                        result.error = Some(e.to_string());
                        run.record(result);
                        failure = Some(e);
                    }
                }
            }
            if failure.is_some() || in_flight.is_empty() {
                break;
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let finished = match joined {
                Ok(finished) => finished,
                Err(e) => {
                    failure = Some(Error::Internal(format!("stage task failed: {e}")));
                    continue;
                }
            };
            in_flight.remove(&finished.index);
            let index = match self.complete(run, finished).await {
                Ok(index) => index,
                Err(e) => {
                    failure = Some(e);
                    continue;
                }
            };

            let stage = &graph.stages[index];
            let read: BTreeSet<&String> = stage.inputs.iter().collect();
            for slot in read {
                let left = unread
                    .entry(slot.clone())
                    .or_insert_with(|| graph.consumer_count(slot));
                *left = left.saturating_sub(1);
                if *left == 0 && slot.as_str() != graph.terminal {
                    if let Some(id) = run.slot(slot) {
                        run.store.release_all(&[id]);
                        debug!(run_id = %run.run_id.short(), "released {slot} ({id})");
                    }
                }
            }
            for &next in &dependents[index] {
                waiting_on[next] -= 1;
                if waiting_on[next] == 0 {
                    ready.push_back(next);
                }
            }
        }

        let Some(err) = failure else {
            return Ok(());
        };

        cancel.cancel();
        if !in_flight.is_empty() {
            debug!(
                run_id = %run.run_id.short(),
                "cancelling {} in-flight stages",
                in_flight.len()
            );
        }
        let drained = tokio::time::timeout(self.config.cancel_grace, async {
            while let Some(joined) = tasks.join_next().await {
                if let Ok(finished) = joined {
                    in_flight.remove(&finished.index);
                    let _ = self.complete(run, finished).await;
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                run_id = %run.run_id.short(),
                "{} stages ignored cancellation for {:?}; aborting",
                in_flight.len(),
                self.config.cancel_grace
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
            for index in std::mem::take(&mut in_flight) {
                run.record(StageResult::unfinished(&graph.stages[index].id, StageStatus::Cancelled));
            }
        }
        Err(err)
    }

    /// Resolve a stage's inputs, reserve its output and spawn it.
    fn launch(
        &self,
        index: usize,
        run: &PipelineRun,
        ctx: &RunContext,
        cancel: &CancellationToken,
        semaphore: &Arc<Semaphore>,
        tasks: &mut JoinSet<Finished>,
    ) -> Result<()> {
        let stage = run.graph.stages[index].clone();
        let inputs = stage
            .inputs
            .iter()
            .map(|slot| {
                let id = run
                    .slot(slot)
                    .ok_or_else(|| Error::Internal(format!("slot '{slot}' has no artifact")))?;
                run.store.input_path(id)
            })
            .collect::<Result<Vec<_>>>()?;

        let format = run.graph.output_format(&stage);
        let artifact = run.store.allocate(&stage.output, format);
        let output = run.store.output_path(artifact.id)?;
        let budget = stage.budget().unwrap_or(self.config.stage_timeout);
        let deadline = ctx.deadline;

        let mut job = StageJob {
            run_id: run.run_id,
            progress: StageProgress::new(stage.id.clone(), run.progress.clone(), ctx.progress.clone()),
            stage,
            inputs,
            output,
            output_format: format,
            budget,
            cancel: cancel.clone(),
        };
        let executor = self.executor.clone();
        let semaphore = semaphore.clone();
        let cancel = cancel.clone();

        tasks.spawn(async move {
            let finished = |outcome, elapsed| Finished {
                index,
                output: artifact.id,
                outcome,
                elapsed,
            };
            let stage_id = job.stage.id.clone();

            let _permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return finished(StageOutcome::failure(Error::Cancelled { stage: stage_id }), Duration::ZERO);
                }
                permit = semaphore.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        return finished(
                            StageOutcome::failure(Error::Internal("stage scheduler closed".into())),
                            Duration::ZERO,
                        );
                    }
                },
            };

            // The run deadline caps every stage, measured from when it starts.
            if let Some(deadline) = deadline {
                job.budget = job.budget.min(deadline.saturating_duration_since(tokio::time::Instant::now()));
            }
            if job.budget.is_zero() {
                return finished(
                    StageOutcome::failure(Error::Timeout {
                        stage: stage_id,
                        after: Duration::ZERO,
                    }),
                    Duration::ZERO,
                );
            }

            let budget = job.budget;
            let started = Instant::now();
            let outcome = match tokio::time::timeout(budget + BUDGET_SLACK, executor.execute(job)).await {
                Ok(outcome) => outcome,
                Err(_) => StageOutcome::failure(Error::Timeout {
                    stage: stage_id,
                    after: budget,
                }),
            };
            finished(outcome, started.elapsed())
        });
        Ok(())
    }

    /// Record a finished stage. Successful outputs are finalized and bound
    /// to their slot.
    async fn complete(&self, run: &mut PipelineRun, finished: Finished) -> Result<usize> {
        let Finished {
            index,
            output,
            outcome,
            elapsed,
        } = finished;
        let StageOutcome {
            result,
            diagnostics,
            media_time,
        } = outcome;
        let stage = run.graph.stages[index].clone();

        let result = match result {
            Ok(()) => run.store.finalize(output, ByteSource::InPlace).await.map(|_| ()),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                info!(
                    run_id = %run.run_id.short(),
                    stage = %stage.id,
                    "stage succeeded in {:.2}s",
                    elapsed.as_secs_f64()
                );
                run.slots.insert(stage.output.clone(), output);
                run.record(StageResult {
                    stage: stage.id,
                    status: StageStatus::Succeeded,
                    duration: elapsed,
                    media_time,
                    diagnostics,
                    error: None,
                    artifact: Some(output),
                });
                Ok(index)
            }
            Err(e) => {
                let status = StageStatus::from_error(&e);
                if status == StageStatus::Cancelled {
                    debug!(run_id = %run.run_id.short(), stage = %stage.id, "stage cancelled");
                } else {
                    warn!(run_id = %run.run_id.short(), stage = %stage.id, "stage failed: {e}");
                }
                run.record(StageResult {
                    stage: stage.id,
                    status,
                    duration: elapsed,
                    media_time,
                    diagnostics,
                    error: Some(e.to_string()),
                    artifact: None,
                });
                Err(e)
            }
        }
    }
}

/// Every external slot bound exactly once, nothing else.
fn check_bindings(graph: &EffectGraph, inputs: &[RunInput]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for input in inputs {
        if !graph.is_external(&input.role) {
            return Err(GraphError::UnexpectedInput {
                slot: input.role.clone(),
            }
            .into());
        }
        if !seen.insert(input.role.as_str()) {
            return Err(Error::Validation(format!("input '{}' supplied twice", input.role)));
        }
    }
    if let Some(slot) = graph.inputs.iter().find(|s| !seen.contains(s.as_str())) {
        return Err(GraphError::UnboundInput {
            stage: "run".into(),
            slot: slot.clone(),
        }
        .into());
    }
    Ok(())
}
