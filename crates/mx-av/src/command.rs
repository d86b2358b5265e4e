//! Builder for running one external engine invocation.
//!
//! Each invocation gets its own process group so that a deadline,
//! cancellation or drop kills the engine together with anything it spawned.
//! Output from both pipes is streamed line by line (ffmpeg terminates its
//! stats lines with `\r`, so both `\r` and `\n` end a line).

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::diagnostics::DiagnosticRing;
use crate::progress::is_progress_line;

/// Default command timeout: 5 minutes.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// How long to keep reading buffered output after the engine has exited.
const DRAIN_WINDOW: Duration = Duration::from_millis(250);

const DEFAULT_EXCERPT_BYTES: usize = 1024;

/// A builder for constructing and running an engine subprocess.
///
/// # Example
///
/// ```no_run
/// use mx_av::{DiagnosticRing, ToolCommand};
/// use std::path::PathBuf;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> mx_core::Result<()> {
/// let mut diagnostics = DiagnosticRing::new(32);
/// ToolCommand::new(PathBuf::from("sox"))
///     .args(["in.wav", "out.wav", "tempo", "1.25"])
///     .label("stretch")
///     .run(&mut diagnostics, |line| println!("{line}"), &CancellationToken::new())
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    label: Option<String>,
    excerpt_bytes: usize,
}

impl ToolCommand {
    /// Create a new command for the given program path.
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            label: None,
            excerpt_bytes: DEFAULT_EXCERPT_BYTES,
        }
    }

    /// Append a single argument.
    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    /// Append multiple arguments.
    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    /// Set the deadline measured from spawn.
    pub fn timeout(&mut self, d: Duration) -> &mut Self {
        self.timeout = d;
        self
    }

    /// Name used in errors and logs (usually the stage id). Defaults to the
    /// program's file name.
    pub fn label(&mut self, label: impl Into<String>) -> &mut Self {
        self.label = Some(label.into());
        self
    }

    /// Maximum size of the diagnostic excerpt attached to an exit error.
    pub fn excerpt_bytes(&mut self, n: usize) -> &mut Self {
        self.excerpt_bytes = n;
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }

    /// Run the command to completion.
    ///
    /// Every output line is passed to `on_line`; all but progress lines are
    /// also recorded in `diagnostics`.
    ///
    /// # Errors
    ///
    /// - [`mx_core::Error::EngineUnavailable`] if the process cannot be spawned.
    /// - [`mx_core::Error::Timeout`] if the deadline passes; the process group
    ///   is killed and reaped first.
    /// - [`mx_core::Error::Cancelled`] if `cancel` fires; same cleanup.
    /// - [`mx_core::Error::EngineExit`] on a non-zero exit, carrying the tail
    ///   of the captured output.
    pub async fn run(
        &self,
        diagnostics: &mut DiagnosticRing,
        mut on_line: impl FnMut(&str),
        cancel: &CancellationToken,
    ) -> mx_core::Result<ExitStatus> {
        let tool = self.program_name();
        let label = self.label.clone().unwrap_or_else(|| tool.clone());

        if cancel.is_cancelled() {
            return Err(mx_core::Error::Cancelled { stage: label });
        }

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        tracing::debug!(stage = %label, "spawning {tool} {}", self.args.join(" "));

        let mut child = cmd.spawn().map_err(|e| {
            mx_core::Error::engine_unavailable(&tool, format!("failed to spawn: {e}"))
        })?;
        let mut group = ProcessGroupGuard::new(child.id());

        let (tx, mut rx) = mpsc::channel::<String>(256);
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump_lines(stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump_lines(stderr, tx.clone())));
        }
        drop(tx);

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let waited = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    group.kill();
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    abort_all(&readers);
                    tracing::debug!(stage = %label, "{tool} cancelled");
                    return Err(mx_core::Error::Cancelled { stage: label });
                }
                _ = &mut deadline => {
                    group.kill();
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    abort_all(&readers);
                    tracing::warn!(stage = %label, "{tool} timed out after {:?}", self.timeout);
                    return Err(mx_core::Error::Timeout {
                        stage: label,
                        after: self.timeout,
                    });
                }
                Some(line) = rx.recv() => {
                    record(diagnostics, &line);
                    on_line(&line);
                }
                status = child.wait() => break status,
            }
        };

        // Pick up whatever the pipes still hold. A grandchild keeping a pipe
        // open must not stall us, hence the window.
        let drain_until = tokio::time::Instant::now() + DRAIN_WINDOW;
        while let Ok(Some(line)) = tokio::time::timeout_at(drain_until, rx.recv()).await {
            record(diagnostics, &line);
            on_line(&line);
        }
        abort_all(&readers);

        let status = match waited {
            Ok(status) => status,
            Err(e) => {
                return Err(mx_core::Error::Internal(format!(
                    "waiting for {tool} failed: {e}"
                )))
            }
        };

        if !status.success() {
            // Stragglers in the group die with the guard.
            return Err(mx_core::Error::EngineExit {
                stage: label,
                code: status.code(),
                diagnostics: diagnostics.excerpt(self.excerpt_bytes),
            });
        }

        group.disarm();
        Ok(status)
    }
}

fn record(diagnostics: &mut DiagnosticRing, line: &str) {
    if !is_progress_line(line) {
        diagnostics.push(line);
    }
}

fn abort_all(readers: &[tokio::task::JoinHandle<()>]) {
    for r in readers {
        r.abort();
    }
}

/// Forward `reader` to `tx` one line at a time, splitting on `\n` and `\r`.
async fn pump_lines<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<String>) {
    let mut buf = [0u8; 4096];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &b in &buf[..n] {
            if b == b'\n' || b == b'\r' {
                if !pending.is_empty() {
                    let line = String::from_utf8_lossy(&pending).into_owned();
                    pending.clear();
                    if tx.send(line).await.is_err() {
                        return;
                    }
                }
            } else {
                pending.push(b);
            }
        }
    }
    if !pending.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&pending).into_owned()).await;
    }
}

/// Kills the child's process group on drop unless disarmed.
struct ProcessGroupGuard {
    pgid: Option<i32>,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.and_then(|p| i32::try_from(p).ok()),
        }
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_group(pgid: i32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!("failed to kill process group {pgid}: {e}"),
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: i32) {}
