//! Request-level entry point: admission, preset lookup, run, delivery and
//! the metrics record.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use mx_av::{ParamValue, StageParams};
use mx_core::config::{Config, LimitsConfig};
use mx_core::metrics::{MetricsSink, RunRecord, RunStatus};
use mx_core::{Error, Result, RunId};

use crate::assembler::{FinalOutput, OutputSink, ResultAssembler};
use crate::context::{ProgressSender, RunContext};
use crate::executor::StageExecutor;
use crate::invoker::EngineInvoker;
use crate::preset::PresetCatalog;
use crate::runner::{PipelineRunner, RunInput, RunnerConfig};

/// One processing request.
#[derive(Debug)]
pub struct ProcessRequest {
    pub preset: String,
    pub inputs: Vec<RunInput>,
    pub overrides: StageParams,
    /// Whole-run deadline; the configured run timeout applies when unset.
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
    pub sink: OutputSink,
    pub progress: Option<ProgressSender>,
}

impl ProcessRequest {
    pub fn new(preset: impl Into<String>) -> Self {
        Self {
            preset: preset.into(),
            inputs: Vec::new(),
            overrides: StageParams::new(),
            timeout: None,
            cancel: CancellationToken::new(),
            sink: OutputSink::Memory,
            progress: None,
        }
    }

    /// Builder: attach an upload under `role`.
    pub fn input(mut self, role: impl Into<String>, content_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.inputs.push(RunInput::new(role, content_type, data));
        self
    }

    /// Builder: override a preset parameter.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.overrides.insert(key, value);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn sink(mut self, sink: OutputSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn progress(mut self, sender: ProgressSender) -> Self {
        self.progress = Some(sender);
        self
    }

    /// Content type of the first upload, for metrics.
    fn primary_type(&self) -> String {
        self.inputs
            .first()
            .map(|i| i.content_type.clone())
            .unwrap_or_default()
    }

    fn total_bytes(&self) -> u64 {
        self.inputs.iter().map(|i| i.data.len() as u64).sum()
    }
}

/// Ties presets, the runner, delivery and metrics together.
pub struct Orchestrator {
    config: Config,
    catalog: PresetCatalog,
    runner: PipelineRunner,
    metrics: Arc<dyn MetricsSink>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        catalog: PresetCatalog,
        executor: Arc<dyn StageExecutor>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let runner = PipelineRunner::new(executor, RunnerConfig::from(&config.pipeline));
        Self {
            config,
            catalog,
            runner,
            metrics,
        }
    }

    /// Production setup: built-in presets plus `pipeline.preset_dir`, and
    /// the ffmpeg/sox engines found on this machine.
    pub fn with_engines(config: Config, metrics: Arc<dyn MetricsSink>) -> Result<Self> {
        let catalog = load_catalog(&config)?;
        let executor = Arc::new(EngineInvoker::from_config(&config));
        Ok(Self::new(config, catalog, executor, metrics))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn catalog(&self) -> &PresetCatalog {
        &self.catalog
    }

    /// Process one request end to end. Exactly one metrics record is
    /// produced per call, success or not.
    pub async fn process(&self, request: ProcessRequest) -> Result<FinalOutput> {
        let started = Instant::now();
        let file_type = request.primary_type();
        let file_size_bytes = request.total_bytes();
        let preset = request.preset.clone();

        let result = self.execute(request).await;

        let record = RunRecord {
            status: if result.is_ok() {
                RunStatus::Success
            } else {
                RunStatus::Error
            },
            file_type,
            file_size_bytes,
            processing_time_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            error_kind: result.as_ref().err().map(Error::kind),
        };
        self.metrics.record(record);

        match &result {
            Ok(out) => info!(
                run_id = %out.run_id.short(),
                preset = %preset,
                "processed {} bytes in {:.2}s",
                out.size_bytes,
                out.processing_time.as_secs_f64()
            ),
            Err(e) => warn!(preset = %preset, kind = e.kind().as_str(), "request failed: {e}"),
        }
        result
    }

    async fn execute(&self, request: ProcessRequest) -> Result<FinalOutput> {
        admit(&self.config.limits, &request.inputs)?;

        let roles: Vec<String> = request.inputs.iter().map(|i| i.role.clone()).collect();
        let graph = self.catalog.build(&request.preset, &request.overrides, &roles)?;

        let store = mx_av::ArtifactStore::create(&self.config.pipeline.scratch_root(), RunId::new())?;
        let mut ctx = RunContext::new(Arc::new(store))
            .with_cancellation(request.cancel)
            .with_timeout(request.timeout.unwrap_or_else(|| self.config.pipeline.run_timeout()));
        if let Some(progress) = request.progress {
            ctx = ctx.with_progress(progress);
        }

        let run = self.runner.run(graph, request.inputs, ctx).await;
        ResultAssembler::assemble(run, &request.sink).await
    }
}

/// Built-in presets plus any found in the configured preset directory.
pub fn load_catalog(config: &Config) -> Result<PresetCatalog> {
    let mut catalog = PresetCatalog::builtin()?;
    if let Some(dir) = &config.pipeline.preset_dir {
        let added = catalog.load_dir(dir)?;
        info!("loaded {added} presets from {}", dir.display());
    }
    Ok(catalog)
}

/// Refuse uploads before anything is stored.
fn admit(limits: &LimitsConfig, inputs: &[RunInput]) -> Result<()> {
    if inputs.is_empty() {
        return Err(Error::InputRejected("no input file provided".into()));
    }
    for input in inputs {
        if !input.content_type.starts_with(&limits.allowed_content_prefix) {
            return Err(Error::InputRejected(format!(
                "'{}' has content type '{}', expected {}*",
                input.role, input.content_type, limits.allowed_content_prefix
            )));
        }
        if input.data.is_empty() {
            return Err(Error::InputRejected(format!("'{}' is empty", input.role)));
        }
        if input.data.len() as u64 > limits.max_input_bytes {
            return Err(Error::InputRejected(format!(
                "'{}' is {} bytes, limit is {}",
                input.role,
                input.data.len(),
                limits.max_input_bytes
            )));
        }
    }
    Ok(())
}
