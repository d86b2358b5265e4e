//! Shared test harness for pipeline integration tests.
//!
//! [`SimulatedEngine`] stands in for ffmpeg and sox. Its "audio" is a text
//! file holding `duration=<secs>`, and each engine kind transforms that
//! duration the way the real filter would, so whole presets can be checked
//! end to end without any binaries installed.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use mx_av::EngineKind;
use mx_core::config::Config;
use mx_core::metrics::MetricsRing;
use mx_core::Error;
use mx_pipeline::{Orchestrator, PresetCatalog, StageExecutor, StageJob, StageOutcome};

/// When a stage ran, as seen by the simulated engine.
#[derive(Debug, Clone)]
pub struct Span {
    pub stage: String,
    pub started: Instant,
    pub finished: Instant,
}

#[derive(Default)]
pub struct SimulatedEngine {
    spans: Mutex<Vec<Span>>,
    fail_stage: Option<String>,
    delay: Duration,
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `stage` exit with an engine failure.
    pub fn failing(mut self, stage: &str) -> Self {
        self.fail_stage = Some(stage.to_string());
        self
    }

    /// Make every stage take at least `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn spans(&self) -> Vec<Span> {
        self.spans.lock().clone()
    }

    pub fn executed(&self) -> usize {
        self.spans.lock().len()
    }

    pub fn span(&self, stage: &str) -> Option<Span> {
        self.spans.lock().iter().find(|s| s.stage == stage).cloned()
    }

    async fn simulate(&self, job: &StageJob) -> mx_core::Result<f64> {
        let mut durations = Vec::with_capacity(job.inputs.len());
        for input in &job.inputs {
            durations.push(read_duration(input).await?);
        }
        let stage = job.stage.id.as_str();
        let params = &job.stage.params;
        let first = durations.first().copied().unwrap_or(0.0);

        let out = match job.stage.engine {
            EngineKind::TrimResample => {
                let start = params.number(stage, "start_secs")?.unwrap_or(0.0);
                let mut d = (first - start).max(0.0);
                if let Some(limit) = params.number(stage, "duration_secs")? {
                    d = d.min(limit);
                }
                d + params.number(stage, "delay_ms")?.unwrap_or(0.0) / 1000.0
                    + params.number(stage, "pad_end_ms")?.unwrap_or(0.0) / 1000.0
            }
            EngineKind::TimeStretch => first / params.number(stage, "tempo")?.unwrap_or(1.0),
            EngineKind::Mix => match params.text("duration").as_deref() {
                Some("shortest") => durations.iter().copied().fold(f64::INFINITY, f64::min),
                Some("first") => first,
                _ => durations.iter().copied().fold(0.0, f64::max),
            },
            EngineKind::Reverb | EngineKind::Echo | EngineKind::Limiter => first,
        };
        Ok(out)
    }
}

#[async_trait]
impl StageExecutor for SimulatedEngine {
    async fn execute(&self, job: StageJob) -> StageOutcome {
        let started = Instant::now();
        if !self.delay.is_zero() {
            tokio::select! {
                _ = job.cancel.cancelled() => {
                    return StageOutcome::failure(Error::Cancelled { stage: job.stage.id.clone() });
                }
                _ = tokio::time::sleep(self.delay) => {}
            }
        }

        let outcome = if self.fail_stage.as_deref() == Some(job.stage.id.as_str()) {
            StageOutcome::failure(Error::EngineExit {
                stage: job.stage.id.clone(),
                code: Some(1),
                diagnostics: "simulated failure".into(),
            })
            .with_diagnostics(vec!["simulated failure".into()])
        } else {
            match self.simulate(&job).await {
                Ok(secs) => {
                    let media = Duration::from_secs_f64(secs);
                    job.progress.report(media / 2);
                    job.progress.report(media);
                    match tokio::fs::write(&job.output, format!("duration={secs}")).await {
                        Ok(()) => StageOutcome::success(Some(media)),
                        Err(source) => StageOutcome::failure(Error::Io { source }),
                    }
                }
                Err(e) => StageOutcome::failure(e),
            }
        };

        self.spans.lock().push(Span {
            stage: job.stage.id.clone(),
            started,
            finished: Instant::now(),
        });
        outcome
    }
}

async fn read_duration(path: &Path) -> mx_core::Result<f64> {
    let text = tokio::fs::read_to_string(path).await?;
    text.trim()
        .strip_prefix("duration=")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| Error::Internal(format!("{} is not simulated audio", path.display())))
}

/// Simulated audio of the given length.
pub fn audio(secs: u32) -> String {
    format!("duration={secs}")
}

/// An orchestrator over a simulated engine, with its scratch space and
/// metrics exposed for inspection.
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub engine: Arc<SimulatedEngine>,
    pub metrics: Arc<MetricsRing>,
    pub scratch: tempfile::TempDir,
}

impl Harness {
    pub fn new(engine: SimulatedEngine) -> Self {
        Self::with_config(engine, Config::default())
    }

    pub fn with_config(engine: SimulatedEngine, mut config: Config) -> Self {
        let scratch = tempfile::tempdir().expect("scratch dir");
        config.pipeline.scratch_dir = Some(scratch.path().to_path_buf());
        let engine = Arc::new(engine);
        let metrics = Arc::new(MetricsRing::new(10));
        let catalog = PresetCatalog::builtin().expect("builtin presets");
        let orchestrator = Orchestrator::new(config, catalog, engine.clone(), metrics.clone());
        Self {
            orchestrator,
            engine,
            metrics,
            scratch,
        }
    }

    /// Whatever is left in the scratch root.
    pub fn scratch_entries(&self) -> Vec<PathBuf> {
        std::fs::read_dir(self.scratch.path())
            .expect("read scratch")
            .filter_map(|e| e.ok().map(|e| e.path()))
            .collect()
    }
}
