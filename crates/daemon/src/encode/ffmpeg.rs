//! ffmpeg process supervision
//!
//! Launches encoder subprocesses, turns their stderr into progress ticks and
//! reports how they exited. A kill token cancels the process forcefully.

use super::progress::{ProgressParser, ProgressTick};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

static NEXT_PROCESS_ID: AtomicU64 = AtomicU64::new(1);

/// Error type for encoder operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The encoder could not be started
    #[error("Failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    /// Encoder exited with non-zero status
    #[error("Encoder failed with exit code: {0}")]
    Exit(i32),

    /// Encoder was terminated by a signal it did not get from us
    #[error("Encoder process was terminated by signal")]
    Terminated,

    /// The duration probe produced something unusable
    #[error("Probe failed: {0}")]
    Probe(String),

    /// IO error while supervising the encoder
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identifies one launched encoder process
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    /// Process-unique identifier, never reused
    pub id: u64,
    /// OS process id, when known
    pub pid: Option<u32>,
}

impl ProcessHandle {
    /// Allocate a handle with a fresh identifier
    pub fn allocate(pid: Option<u32>) -> Self {
        Self {
            id: NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed),
            pid,
        }
    }
}

/// How a supervised process ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderExit {
    /// Exited with status 0
    Completed,
    /// Killed through its kill token
    Killed,
}

/// A launched encoder: its handle, its progress stream and its eventual exit
pub struct RunningEncoder {
    handle: ProcessHandle,
    progress: mpsc::UnboundedReceiver<ProgressTick>,
    exit: oneshot::Receiver<Result<EncoderExit, EncodeError>>,
}

impl RunningEncoder {
    /// Assemble from channels. The progress sender closing marks end of output.
    pub fn from_parts(
        handle: ProcessHandle,
        progress: mpsc::UnboundedReceiver<ProgressTick>,
        exit: oneshot::Receiver<Result<EncoderExit, EncodeError>>,
    ) -> Self {
        Self {
            handle,
            progress,
            exit,
        }
    }

    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    /// Next progress tick; `None` once the encoder's output has closed
    pub async fn next_progress(&mut self) -> Option<ProgressTick> {
        self.progress.recv().await
    }

    /// Wait for the process to exit
    pub async fn wait(self) -> Result<EncoderExit, EncodeError> {
        wait_exit(self.exit).await
    }

    /// Split for callers that need to select over progress and exit together
    pub fn into_parts(self) -> (ProcessHandle, mpsc::UnboundedReceiver<ProgressTick>, ExitFuture) {
        (self.handle, self.progress, ExitFuture(self.exit))
    }
}

/// Exit notification of a split [`RunningEncoder`]
pub struct ExitFuture(oneshot::Receiver<Result<EncoderExit, EncodeError>>);

impl ExitFuture {
    pub async fn wait(self) -> Result<EncoderExit, EncodeError> {
        wait_exit(self.0).await
    }
}

async fn wait_exit(
    exit: oneshot::Receiver<Result<EncoderExit, EncodeError>>,
) -> Result<EncoderExit, EncodeError> {
    match exit.await {
        Ok(result) => result,
        // supervisor went away without reporting
        Err(_) => Err(EncodeError::Terminated),
    }
}

/// Seam between the orchestration logic and the real encoder binaries
#[async_trait]
pub trait EncoderBackend: Send + Sync + 'static {
    /// Start an encoder with the given arguments. Cancelling `kill`
    /// terminates it.
    fn launch(
        &self,
        args: Vec<String>,
        kill: CancellationToken,
    ) -> Result<RunningEncoder, EncodeError>;

    /// Media duration of a file in seconds
    async fn probe_duration(&self, path: &Path) -> Result<f64, EncodeError>;
}

/// Run an encoder to completion, discarding progress.
pub async fn run_to_exit(
    backend: &dyn EncoderBackend,
    args: Vec<String>,
    kill: CancellationToken,
) -> Result<EncoderExit, EncodeError> {
    let mut encoder = backend.launch(args, kill)?;
    while encoder.next_progress().await.is_some() {}
    encoder.wait().await
}

/// Backend driving the `ffmpeg` and `ffprobe` binaries
#[derive(Debug, Clone)]
pub struct FfmpegBackend {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegBackend {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    /// Global options placed ahead of every invocation
    fn global_args() -> [&'static str; 2] {
        ["-hide_banner", "-y"]
    }
}

/// Split raw stderr on both `\r` (status updates) and `\n`
fn stderr_lines(chunk: &[u8]) -> impl Iterator<Item = String> + '_ {
    chunk
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| String::from_utf8_lossy(line).into_owned())
}

/// Parse `ffprobe -of json -show_entries format=duration` output.
pub fn parse_probe_duration(json: &[u8]) -> Result<f64, EncodeError> {
    let value: serde_json::Value =
        serde_json::from_slice(json).map_err(|e| EncodeError::Probe(e.to_string()))?;
    let duration = value["format"]["duration"]
        .as_str()
        .ok_or_else(|| EncodeError::Probe("no duration found".to_string()))?;
    duration
        .parse::<f64>()
        .map_err(|e| EncodeError::Probe(format!("invalid duration '{}': {}", duration, e)))
}

#[async_trait]
impl EncoderBackend for FfmpegBackend {
    fn launch(
        &self,
        args: Vec<String>,
        kill: CancellationToken,
    ) -> Result<RunningEncoder, EncodeError> {
        debug!(binary = %self.ffmpeg.display(), ?args, "Launching encoder");

        let mut child = Command::new(&self.ffmpeg)
            .args(Self::global_args())
            .args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EncodeError::Spawn {
                binary: self.ffmpeg.display().to_string(),
                source,
            })?;

        let handle = ProcessHandle::allocate(child.id());
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        if let Some(stderr) = child.stderr.take() {
            let pid = handle.pid;
            tokio::spawn(async move {
                let mut parser = ProgressParser::new();
                let mut chunks = BufReader::new(stderr).split(b'\r');
                loop {
                    match chunks.next_segment().await {
                        Ok(Some(chunk)) => {
                            for line in stderr_lines(&chunk) {
                                if let Some(tick) = parser.feed(&line) {
                                    // keep draining even when nobody listens
                                    let _ = progress_tx.send(tick);
                                } else if line.contains("Error") || line.contains("error") {
                                    warn!(?pid, "Encoder: {}", line.trim());
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(?pid, "Error reading encoder output: {}", e);
                            break;
                        }
                    }
                }
            });
        }

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = kill.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill encoder: {}", e);
                    }
                    Ok(EncoderExit::Killed)
                }
                status = child.wait() => match status {
                    Ok(status) if status.success() => Ok(EncoderExit::Completed),
                    Ok(status) => match status.code() {
                        Some(code) => Err(EncodeError::Exit(code)),
                        None => Err(EncodeError::Terminated),
                    },
                    Err(e) => Err(EncodeError::Io(e)),
                },
            };
            let _ = exit_tx.send(result);
        });

        Ok(RunningEncoder::from_parts(handle, progress_rx, exit_rx))
    }

    async fn probe_duration(&self, path: &Path) -> Result<f64, EncodeError> {
        let output = Command::new(&self.ffprobe)
            .args(["-v", "error", "-show_entries", "format=duration", "-of", "json"])
            .arg(path)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| EncodeError::Spawn {
                binary: self.ffprobe.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            return match output.status.code() {
                Some(code) => Err(EncodeError::Exit(code)),
                None => Err(EncodeError::Terminated),
            };
        }

        parse_probe_duration(&output.stdout)
    }
}
