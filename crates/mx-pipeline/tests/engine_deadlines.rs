//! Deadlines and cancellation against stub engine binaries.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;

use mx_av::{ArtifactStore, EngineKind, ToolRegistry};
use mx_core::config::Config;
use mx_core::{Error, RunId};
use mx_pipeline::{
    EffectGraph, EngineInvoker, PipelineRunner, RunContext, RunInput, RunnerConfig, StageSpec,
    StageStatus,
};

/// An executable shell script standing in for an engine.
fn stub_engine(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn process_gone(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .map(|rest| rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
    }
}

fn wait_gone(pid: u32) -> bool {
    let until = Instant::now() + Duration::from_secs(2);
    while !process_gone(pid) && Instant::now() < until {
        std::thread::sleep(Duration::from_millis(20));
    }
    process_gone(pid)
}

fn read_pid(path: &Path) -> u32 {
    std::fs::read_to_string(path)
        .expect("stub wrote its pid")
        .trim()
        .parse()
        .expect("pid")
}

struct Setup {
    dir: tempfile::TempDir,
    runner: PipelineRunner,
    pid_file: PathBuf,
}

/// A runner whose ffmpeg records its pid and then hangs.
fn hanging_ffmpeg() -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("engine.pid");
    let ffmpeg = stub_engine(
        dir.path(),
        "ffmpeg",
        &format!("echo $$ > {}\nexec sleep 30", pid_file.display()),
    );
    let tools = Arc::new(ToolRegistry::default().with_tool("ffmpeg", ffmpeg));
    let invoker = EngineInvoker::new(tools, &Config::default());
    let runner = PipelineRunner::new(Arc::new(invoker), RunnerConfig::default());
    Setup {
        dir,
        runner,
        pid_file,
    }
}

fn trim_graph(budget: Duration) -> EffectGraph {
    EffectGraph::new("trim", ["audio_track"], "output").stage(
        StageSpec::new("trim", EngineKind::TrimResample, ["audio_track"], "output")
            .with_param("duration_secs", 60.0)
            .with_budget(budget),
    )
}

fn context(dir: &Path) -> RunContext {
    let scratch = dir.join("scratch");
    RunContext::new(Arc::new(ArtifactStore::create(&scratch, RunId::new()).unwrap()))
}

#[tokio::test]
async fn stage_deadline_kills_the_engine() {
    let setup = hanging_ffmpeg();
    let ctx = context(setup.dir.path());

    let started = Instant::now();
    let run = setup
        .runner
        .run(
            trim_graph(Duration::from_secs(1)),
            vec![RunInput::new("audio_track", "audio/mpeg", "ID3")],
            ctx,
        )
        .await;
    let elapsed = started.elapsed();

    assert_matches!(run.error, Some(Error::Timeout { ref stage, .. }) if stage == "trim");
    assert_eq!(run.stage("trim").unwrap().status, StageStatus::TimedOut);
    assert!(elapsed < Duration::from_millis(1500), "took {elapsed:?}");
    assert!(wait_gone(read_pid(&setup.pid_file)), "engine survived its deadline");
}

#[tokio::test]
async fn cancellation_kills_the_engine() {
    let setup = hanging_ffmpeg();
    let token = tokio_util::sync::CancellationToken::new();
    let ctx = context(setup.dir.path()).with_cancellation(token.clone());
    let pid_file = setup.pid_file.clone();
    tokio::spawn(async move {
        // Wait for the engine to start before pulling the plug.
        while !pid_file.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });

    let run = setup
        .runner
        .run(
            trim_graph(Duration::from_secs(30)),
            vec![RunInput::new("audio_track", "audio/mpeg", "ID3")],
            ctx,
        )
        .await;

    assert_matches!(run.error, Some(Error::Cancelled { .. }));
    assert!(wait_gone(read_pid(&setup.pid_file)), "engine survived cancellation");
}

#[tokio::test]
async fn engine_exit_surfaces_diagnostics() {
    let dir = tempfile::tempdir().unwrap();
    let ffmpeg = stub_engine(
        dir.path(),
        "ffmpeg",
        "echo 'Invalid data found when processing input' >&2\nexit 183",
    );
    let tools = Arc::new(ToolRegistry::default().with_tool("ffmpeg", ffmpeg));
    let runner = PipelineRunner::new(
        Arc::new(EngineInvoker::new(tools, &Config::default())),
        RunnerConfig::default(),
    );

    let run = runner
        .run(
            trim_graph(Duration::from_secs(5)),
            vec![RunInput::new("audio_track", "audio/mpeg", "ID3")],
            context(dir.path()),
        )
        .await;

    let err = run.error.as_ref().unwrap();
    assert_matches!(err, Error::EngineExit { code: Some(183), .. });
    assert!(err.diagnostics().unwrap().contains("Invalid data found"));
    assert_eq!(
        run.stage("trim").unwrap().diagnostics,
        vec!["Invalid data found when processing input".to_string()]
    );
}

#[tokio::test]
async fn missing_engine_is_reported_without_spawning() {
    let dir = tempfile::tempdir().unwrap();
    let runner = PipelineRunner::new(
        Arc::new(EngineInvoker::new(Arc::new(ToolRegistry::default()), &Config::default())),
        RunnerConfig::default(),
    );
    let run = runner
        .run(
            trim_graph(Duration::from_secs(5)),
            vec![RunInput::new("audio_track", "audio/mpeg", "ID3")],
            context(dir.path()),
        )
        .await;
    assert_matches!(run.error, Some(Error::EngineUnavailable { ref tool, .. }) if tool == "ffmpeg");
}
