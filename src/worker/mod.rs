//! Extraction worker invocation.
//!
//! Each call spawns one worker process:
//!
//!   <program> [args..] <url> <output_dir>
//!
//! and races it against a deadline that also covers creating the output
//! directory. On expiry the worker gets SIGTERM and `kill_grace` to exit
//! before it is killed outright. The worker reports its counters on
//! stdout (`Markets processed: N`, `Events generated: N`); anything else it
//! prints is kept as raw output. Errors never escape `Worker::invoke`: they
//! are folded into a `Failure` or `Timeout` result.

use crate::config::MonitorConfig;
use crate::target::TargetId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

const MARKETS_LABEL: &str = "Markets processed:";
const EVENTS_LABEL: &str = "Events generated:";

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to spawn worker {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed waiting on worker: {0}")]
    Wait(#[source] std::io::Error),
    #[error("worker timed out after {0:?}")]
    Timeout(Duration),
    #[error("worker exited with {status}: {stderr}")]
    NonZeroExit { status: String, stderr: String },
    #[error("failed to create output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("worker executable not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerOutcome {
    Success,
    Failure,
    Timeout,
}

impl std::fmt::Display for WorkerOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerOutcome::Success => write!(f, "success"),
            WorkerOutcome::Failure => write!(f, "failure"),
            WorkerOutcome::Timeout => write!(f, "timeout"),
        }
    }
}

/// Everything one invocation produced.
#[derive(Debug, Clone)]
pub struct WorkerResult {
    pub outcome: WorkerOutcome,
    /// Events generated; the count the change detector compares.
    pub item_count: u64,
    pub markets_processed: u64,
    pub raw_output: String,
    /// Stderr or error text for failed runs.
    pub diagnostic: Option<String>,
    pub elapsed: Duration,
}

impl WorkerResult {
    pub fn success(
        item_count: u64,
        markets_processed: u64,
        raw_output: String,
        elapsed: Duration,
    ) -> Self {
        Self {
            outcome: WorkerOutcome::Success,
            item_count,
            markets_processed,
            raw_output,
            diagnostic: None,
            elapsed,
        }
    }

    pub fn failure(diagnostic: String, elapsed: Duration) -> Self {
        Self {
            outcome: WorkerOutcome::Failure,
            item_count: 0,
            markets_processed: 0,
            raw_output: String::new(),
            diagnostic: Some(diagnostic),
            elapsed,
        }
    }

    pub fn timeout(deadline: Duration, elapsed: Duration) -> Self {
        Self {
            outcome: WorkerOutcome::Timeout,
            item_count: 0,
            markets_processed: 0,
            raw_output: String::new(),
            diagnostic: Some(WorkerError::Timeout(deadline).to_string()),
            elapsed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == WorkerOutcome::Success
    }
}

/// One unit of work: run the worker for one target.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub target_id: TargetId,
    pub url: String,
    pub output_dir: PathBuf,
}

#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// Run once and resolve no later than `deadline` plus the kill grace.
    async fn invoke(&self, request: &WorkerRequest, deadline: Duration) -> WorkerResult;
}

/// Runs the worker as a child process.
#[derive(Debug, Clone)]
pub struct ProcessWorker {
    program: String,
    args: Vec<String>,
    /// How long a timed-out child gets to exit after SIGTERM, and again
    /// after SIGKILL.
    kill_grace: Duration,
}

impl ProcessWorker {
    pub fn new(program: impl Into<String>, args: Vec<String>, kill_grace: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            kill_grace,
        }
    }

    pub fn from_config(config: &MonitorConfig) -> Self {
        Self::new(
            config.worker_program.clone(),
            config.worker_args.clone(),
            Duration::from_millis(config.kill_grace_ms),
        )
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Check that the executable can be found before the daemon starts.
    pub fn preflight(&self) -> Result<PathBuf, WorkerError> {
        resolve_program(&self.program).ok_or_else(|| WorkerError::NotFound(self.program.clone()))
    }

    async fn run(
        &self,
        request: &WorkerRequest,
        deadline: Duration,
    ) -> Result<WorkerResult, WorkerError> {
        let started = Instant::now();
        let expires = tokio::time::Instant::now() + deadline;

        match tokio::time::timeout_at(expires, tokio::fs::create_dir_all(&request.output_dir)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(source)) => {
                return Err(WorkerError::OutputDir {
                    path: request.output_dir.clone(),
                    source,
                })
            }
            Err(_) => return Err(WorkerError::Timeout(deadline)),
        }

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(&request.url)
            .arg(&request.output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WorkerError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // Drain both pipes off-task so a chatty worker never blocks on a full pipe.
        let stdout = tokio::spawn(drain(child.stdout.take()));
        let stderr = tokio::spawn(drain(child.stderr.take()));

        let status = match tokio::time::timeout_at(expires, child.wait()).await {
            Ok(status) => status.map_err(WorkerError::Wait)?,
            Err(_) => {
                self.terminate(&mut child, &request.target_id).await;
                stdout.abort();
                stderr.abort();
                return Err(WorkerError::Timeout(deadline));
            }
        };

        // Grandchildren may still hold the pipes open; don't wait on them forever.
        let stdout = collect(stdout, self.kill_grace).await;
        let stderr = collect(stderr, self.kill_grace).await;

        if !status.success() {
            let stderr = stderr.trim();
            return Err(WorkerError::NonZeroExit {
                status: status.to_string(),
                stderr: if stderr.is_empty() {
                    "no diagnostic output".to_string()
                } else {
                    stderr.to_string()
                },
            });
        }

        let counters = parse_counters(&stdout);
        debug!(
            target_id = %request.target_id,
            markets = counters.markets_processed,
            events = counters.events_generated,
            "worker output parsed"
        );
        Ok(WorkerResult::success(
            counters.events_generated,
            counters.markets_processed,
            stdout,
            started.elapsed(),
        ))
    }
}

impl ProcessWorker {
    /// SIGTERM, wait `kill_grace`, then SIGKILL if the child is still there.
    async fn terminate(&self, child: &mut Child, target_id: &TargetId) {
        if let Some(pid) = child.id() {
            match send_sigterm(pid) {
                Ok(()) => {
                    if tokio::time::timeout(self.kill_grace, child.wait()).await.is_ok() {
                        debug!(target_id = %target_id, "timed-out worker exited on SIGTERM");
                        return;
                    }
                    warn!(target_id = %target_id, "worker ignored SIGTERM, killing");
                }
                Err(e) => warn!(target_id = %target_id, error = %e, "failed to send SIGTERM"),
            }
        }

        if let Err(e) = child.start_kill() {
            warn!(target_id = %target_id, error = %e, "failed to kill timed-out worker");
        }
        if tokio::time::timeout(self.kill_grace, child.wait()).await.is_err() {
            warn!(target_id = %target_id, "timed-out worker not reaped within grace period");
        }
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> std::io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = i32::try_from(pid).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(std::io::Error::from)
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "SIGTERM is unix-only",
    ))
}

#[async_trait]
impl Worker for ProcessWorker {
    async fn invoke(&self, request: &WorkerRequest, deadline: Duration) -> WorkerResult {
        let started = Instant::now();
        match self.run(request, deadline).await {
            Ok(result) => result,
            Err(WorkerError::Timeout(d)) => WorkerResult::timeout(d, started.elapsed()),
            Err(e) => WorkerResult::failure(e.to_string(), started.elapsed()),
        }
    }
}

async fn drain<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        if let Err(e) = reader.read_to_end(&mut buf).await {
            debug!(error = %e, "worker pipe read ended early");
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn collect(handle: tokio::task::JoinHandle<String>, grace: Duration) -> String {
    match tokio::time::timeout(grace, handle).await {
        Ok(Ok(text)) => text,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            debug!("worker pipe still open after exit, dropping remaining output");
            String::new()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputCounters {
    pub markets_processed: u64,
    pub events_generated: u64,
}

/// Pull both counters out of worker stdout. Missing counters are 0.
pub fn parse_counters(output: &str) -> OutputCounters {
    OutputCounters {
        markets_processed: find_counter(output, MARKETS_LABEL).unwrap_or(0),
        events_generated: find_counter(output, EVENTS_LABEL).unwrap_or(0),
    }
}

/// First `<label> <digits>` occurrence anywhere in the output.
fn find_counter(output: &str, label: &str) -> Option<u64> {
    output.lines().find_map(|line| {
        let start = line.find(label)? + label.len();
        let rest = line[start..].trim_start();
        let end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        rest[..end].parse().ok()
    })
}

/// Per-target output directory: sanitized host plus a short id suffix, so two
/// targets on the same site never share a directory.
pub fn output_dir_for(root: &Path, url: &str, id: &TargetId) -> PathBuf {
    let host = reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| "target".to_string());
    let sanitized: String = host
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    root.join(format!("{}_{}", sanitized, id.short()))
}

fn resolve_program(program: &str) -> Option<PathBuf> {
    let path = Path::new(program);
    if path.components().count() > 1 || path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}
