//! Bounded execution of the external renderer
//!
//! The renderer is an ordinary child process. Its stdout and stderr are
//! drained by background tasks that forward every line to the log, so a
//! chatty renderer can never stall on a full pipe. A watchdog kills the
//! child once its timeout elapses.

use crate::{format_duration, ScreenshotError};
use async_trait::async_trait;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// How long to wait for the output readers once the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// A single launch of an external program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: PathBuf,
    pub timeout: Duration,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>, working_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    /// The watchdog fired and the process was killed.
    TimedOut,
    /// Non-zero exit. `None` when the process was ended by a signal.
    ExitFailure(Option<i32>),
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Combined stdout/stderr lines, in arrival order.
    pub output: Vec<String>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn success() -> Self {
        Self {
            outcome: RunOutcome::Success,
            output: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Success
    }

    /// Turn a failed outcome into the error surfaced to callers.
    pub fn into_result(self, invocation: &Invocation) -> Result<Self, ScreenshotError> {
        match self.outcome {
            RunOutcome::Success => Ok(self),
            RunOutcome::TimedOut => Err(ScreenshotError::Timeout(invocation.timeout)),
            RunOutcome::ExitFailure(Some(code)) => Err(ScreenshotError::GenerationFailed(format!(
                "Exit code {code} returned from {invocation}"
            ))),
            RunOutcome::ExitFailure(None) => Err(ScreenshotError::GenerationFailed(format!(
                "{invocation} was terminated by a signal"
            ))),
        }
    }
}

/// Seam between the cache and the operating system.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run to completion or until `invocation.timeout` elapses.
    ///
    /// `Err` is reserved for failures to launch; everything the process
    /// itself does is reported through the returned outcome.
    async fn run(&self, invocation: &Invocation) -> Result<RunReport, ScreenshotError>;
}

/// Runs invocations as real child processes via `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct SubprocessRunner;

impl SubprocessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessRunner for SubprocessRunner {
    async fn run(&self, invocation: &Invocation) -> Result<RunReport, ScreenshotError> {
        let start = Instant::now();
        info!("Starting {}", invocation);

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .current_dir(&invocation.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ScreenshotError::GenerationFailed(format!("could not start {invocation}: {e}"))
            })?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut drains = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            drains.push(tokio::spawn(drain_lines(stdout, "stdout", tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(tokio::spawn(drain_lines(stderr, "stderr", tx.clone())));
        }
        drop(tx);

        let waited = timeout(invocation.timeout, child.wait()).await;
        let outcome = match waited {
            Ok(Ok(status)) if status.success() => RunOutcome::Success,
            Ok(Ok(status)) => RunOutcome::ExitFailure(status.code()),
            Ok(Err(e)) => {
                error!("Lost track of {}: {}", invocation, e);
                return Err(e.into());
            }
            Err(_) => {
                warn!(
                    "Killing {} after {}",
                    invocation,
                    format_duration(invocation.timeout)
                );
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill {}: {}", invocation, e);
                }
                RunOutcome::TimedOut
            }
        };

        if timeout(DRAIN_GRACE, futures::future::join_all(drains))
            .await
            .is_err()
        {
            debug!("Output of {} still open after exit", invocation);
        }

        let mut output = Vec::new();
        while let Ok(line) = rx.try_recv() {
            output.push(line);
        }

        let elapsed = start.elapsed();
        match outcome {
            RunOutcome::Success => info!(
                "Completed {} in {}",
                invocation.program.display(),
                format_duration(elapsed)
            ),
            _ => warn!(
                "{} finished with {:?} after {}",
                invocation.program.display(),
                outcome,
                format_duration(elapsed)
            ),
        }

        Ok(RunReport {
            outcome,
            output,
            elapsed,
        })
    }
}

async fn drain_lines<R>(reader: R, stream: &'static str, sink: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    // Bytes, not `lines()`: a stray non-UTF-8 byte must not stop the drain
    // and close the pipe under a still running renderer.
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                info!(target: "renderer", stream, "{}", line);
                let _ = sink.send(line);
            }
            Err(e) => {
                debug!("Stopped reading renderer {}: {}", stream, e);
                break;
            }
        }
    }
}

/// True when `path` exists and is a regular file (symlinks are followed).
pub fn is_regular_file(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}
