//! Production [`StageExecutor`]: runs one ffmpeg or sox process per stage.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use mx_av::{build_invocation, parse_time_marker, DiagnosticRing, ProgressThrottle, ToolCommand, ToolRegistry};
use mx_core::config::{Config, EncodeConfig};
use mx_core::Result;

use crate::executor::{StageExecutor, StageJob, StageOutcome};

/// Turns a [`StageJob`] into an engine command line and runs it.
#[derive(Debug, Clone)]
pub struct EngineInvoker {
    tools: Arc<ToolRegistry>,
    encode: EncodeConfig,
    diagnostic_lines: usize,
    excerpt_bytes: usize,
    progress_step: Duration,
}

impl EngineInvoker {
    pub fn new(tools: Arc<ToolRegistry>, config: &Config) -> Self {
        Self {
            tools,
            encode: config.encode.clone(),
            diagnostic_lines: config.pipeline.diagnostic_lines,
            excerpt_bytes: config.pipeline.diagnostic_excerpt_bytes,
            progress_step: config.pipeline.progress_step(),
        }
    }

    /// Discover the engines named in `config` and build an invoker over them.
    pub fn from_config(config: &Config) -> Self {
        Self::new(Arc::new(ToolRegistry::discover(&config.tools)), config)
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    async fn invoke(&self, job: &StageJob, diagnostics: &mut DiagnosticRing) -> Result<Option<Duration>> {
        let invocation = build_invocation(
            &job.stage.id,
            job.stage.engine,
            &job.stage.params,
            &job.inputs,
            &job.output,
            job.output_format,
            &self.encode,
        )?;
        let tool = self.tools.require(invocation.tool)?;

        info!(
            run_id = %job.run_id.short(),
            stage = %job.stage.id,
            engine = %job.stage.engine,
            "starting {} (budget {:?})",
            invocation.tool,
            job.budget
        );

        let mut cmd = ToolCommand::new(tool.path.clone());
        cmd.args(invocation.args)
            .timeout(job.budget)
            .label(job.stage.id.clone())
            .excerpt_bytes(self.excerpt_bytes);

        let mut throttle = ProgressThrottle::new(self.progress_step);
        let progress = job.progress.clone();
        cmd.run(
            diagnostics,
            |line| {
                if let Some(reported) = parse_time_marker(line).and_then(|t| throttle.observe(t)) {
                    progress.report(reported);
                }
            },
            &job.cancel,
        )
        .await?;

        if let Some(last) = throttle.finish() {
            job.progress.report(last);
        }
        debug!(stage = %job.stage.id, media = ?throttle.latest(), "engine finished");
        Ok(throttle.latest())
    }
}

#[async_trait]
impl StageExecutor for EngineInvoker {
    async fn execute(&self, job: StageJob) -> StageOutcome {
        let mut diagnostics = DiagnosticRing::new(self.diagnostic_lines);
        match self.invoke(&job, &mut diagnostics).await {
            Ok(media) => StageOutcome::success(media).with_diagnostics(diagnostics.into_lines()),
            Err(e) => StageOutcome::failure(e).with_diagnostics(diagnostics.into_lines()),
        }
    }
}
