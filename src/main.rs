mod cli;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{split_pair, Cli, Commands};
use tokio_util::sync::CancellationToken;

use mx_av::{ArtifactFormat, ParamValue, ToolRegistry};
use mx_core::config::Config;
use mx_core::metrics::MetricsRing;
use mx_pipeline::{
    load_catalog, FinalOutput, Orchestrator, OutputSink, ProcessRequest, ProgressSender,
};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "mixdown=debug,mx_pipeline=debug,mx_av=debug,mx_core=debug".to_string()
        } else {
            "mixdown=info,mx_pipeline=info,mx_av=warn,mx_core=warn".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Process {
            preset,
            inputs,
            params,
            output,
            timeout,
            json,
        } => {
            let config = Config::load_or_default(cli.config.as_deref());
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(process_files(
                config,
                &preset,
                &inputs,
                &params,
                output,
                timeout.map(Duration::from_secs),
                json,
            ))
        }
        Commands::Presets { json } => list_presets(cli.config.as_deref(), json),
        Commands::CheckTools => check_tools(cli.config.as_deref()),
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("mixdown {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn process_files(
    config: Config,
    preset: &str,
    inputs: &[String],
    params: &[String],
    output: Option<PathBuf>,
    timeout: Option<Duration>,
    json: bool,
) -> Result<()> {
    let mut request = ProcessRequest::new(preset);

    for binding in inputs {
        let (role, path) =
            split_pair(binding).with_context(|| format!("expected ROLE=PATH, got '{binding}'"))?;
        let path = Path::new(path);
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let content_type = content_type_for(path);
        tracing::debug!("{role}: {} ({content_type}, {} bytes)", path.display(), data.len());
        request = request.input(role, content_type, data);
    }

    for pair in params {
        let (key, value) =
            split_pair(pair).with_context(|| format!("expected KEY=VALUE, got '{pair}'"))?;
        request = request.param(key, ParamValue::parse(value));
    }

    if let Some(timeout) = timeout {
        request = request.timeout(timeout);
    }

    let metrics = Arc::new(MetricsRing::new(config.metrics.capacity));
    let orchestrator = Orchestrator::with_engines(config, metrics.clone())?;

    let file_name = orchestrator
        .catalog()
        .get(preset)
        .and_then(|p| p.output_name.clone())
        .unwrap_or_else(|| format!("{preset}.mp3"));
    let dest = output.unwrap_or_else(|| PathBuf::from(file_name));

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; stopping engines");
            on_interrupt.cancel();
        }
    });

    let request = request
        .cancel(cancel)
        .sink(OutputSink::File(dest.clone()))
        .progress(ProgressSender::new(|update| {
            tracing::info!(
                "[{}] {:.1}s processed ({:.1}s total)",
                update.stage,
                update.stage_media.as_secs_f64(),
                update.total_media.as_secs_f64()
            );
        }));

    let result = orchestrator.process(request).await;
    let out = result.map_err(|e| match e.diagnostics() {
        Some(diag) if !diag.is_empty() => anyhow::anyhow!("{e}\n\nengine output:\n{diag}"),
        _ => anyhow::Error::new(e),
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary(&out, &dest))?);
    } else {
        print_summary(&out, &dest);
    }
    Ok(())
}

/// Content type for an upload, judged by its extension.
fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    ArtifactFormat::from_extension(ext).content_type()
}

fn summary(out: &FinalOutput, dest: &Path) -> serde_json::Value {
    let stages: Vec<serde_json::Value> = out
        .stages
        .iter()
        .map(|s| {
            serde_json::json!({
                "stage": s.stage,
                "status": format!("{:?}", s.status).to_lowercase(),
                "durationMs": s.duration.as_millis() as u64,
                "mediaSecs": s.media_time.map(|d| d.as_secs_f64()),
            })
        })
        .collect();
    serde_json::json!({
        "runId": out.run_id.to_string(),
        "output": dest.display().to_string(),
        "contentType": out.content_type,
        "sizeBytes": out.size_bytes,
        "mediaSecs": out.media_duration.map(|d| d.as_secs_f64()),
        "processingTimeMs": out.processing_time.as_millis() as u64,
        "stages": stages,
    })
}

fn print_summary(out: &FinalOutput, dest: &Path) {
    println!("Output: {}", dest.display());
    println!("Size: {} bytes", out.size_bytes);
    if let Some(media) = out.media_duration {
        let secs = media.as_secs();
        println!("Duration: {:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60);
    }
    println!("Processing time: {:.2}s", out.processing_time.as_secs_f64());
    println!("\nStages: {}", out.stages.len());
    for stage in &out.stages {
        println!(
            "  {} {:?} ({:.2}s)",
            stage.stage,
            stage.status,
            stage.duration.as_secs_f64()
        );
    }
}

fn list_presets(config_path: Option<&Path>, json: bool) -> Result<()> {
    let config = Config::load_or_default(config_path);
    let catalog = load_catalog(&config)?;

    if json {
        let presets: Vec<_> = catalog.list().collect();
        println!("{}", serde_json::to_string_pretty(&presets)?);
        return Ok(());
    }

    for preset in catalog.list() {
        println!("{}", preset.id);
        if !preset.description.is_empty() {
            println!("  {}", preset.description);
        }
        println!("  inputs: {}", preset.inputs.join(", "));
        let params: Vec<String> = preset
            .params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        if !params.is_empty() {
            println!("  params: {}", params.join(" "));
        }
    }
    Ok(())
}

fn check_tools(config_path: Option<&Path>) -> Result<()> {
    println!("Checking external tools...\n");

    let config = Config::load_or_default(config_path);
    let tools = ToolRegistry::discover(&config.tools).check_all();
    let mut all_ok = true;

    for tool in &tools {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);

        if let Some(ref version) = tool.version {
            print!(" ({})", version.lines().next().unwrap_or(""));
        }

        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }

        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
    } else {
        println!("Some tools are missing. Presets using them will fail with EngineUnavailable.");
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {}", p.display());
            let contents =
                std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
            Config::from_json(&contents)?
        }
        None => {
            println!("No config file specified, using defaults");
            Config::default()
        }
    };

    let warnings = config.validate();
    for warning in &warnings {
        println!("  ! {warning}");
    }
    let catalog = load_catalog(&config)?;

    println!("✓ Configuration is valid");
    println!(
        "  Stages: up to {} in parallel, {}s each, {}s per run",
        config.pipeline.max_parallel_stages,
        config.pipeline.stage_timeout_secs,
        config.pipeline.run_timeout_secs
    );
    println!(
        "  Encode: {} {} {} Hz {}ch",
        config.encode.codec, config.encode.bitrate, config.encode.sample_rate, config.encode.channels
    );
    println!("  Presets: {}", catalog.len());
    Ok(())
}
