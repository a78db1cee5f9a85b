//! Fakes for the encoder and Node seams.

use crate::bus::{BusMessage, StatusBus, VideoEvent};
use crate::config::ProcessingAgent;
use crate::context::Context;
use crate::encode::{
    EncodeError, EncoderBackend, EncoderExit, ProcessHandle, ProgressTick, RunningEncoder,
    OutputFormat, Resolution, StillKind,
};
use crate::layout::VideoLayout;
use crate::node::{NodeClient, NodeError, VideoDetails, VideoStatus};
use crate::settings::AgentStore;
use crate::tracker::Trackers;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;

enum Control {
    Progress(ProgressTick),
    Finish(Result<EncoderExit, EncodeError>),
}

/// One recorded launch
pub struct Launch {
    pub args: Vec<String>,
    pub kill: CancellationToken,
    control: mpsc::UnboundedSender<Control>,
}

/// Encoder backend whose processes are driven by the test
pub struct FakeBackend {
    launches: Mutex<Vec<Launch>>,
    auto_complete: bool,
    fail_spawn: AtomicBool,
    duration: f64,
}

impl FakeBackend {
    /// Processes run until the test finishes or kills them
    pub fn manual() -> Arc<Self> {
        Arc::new(Self {
            launches: Mutex::new(Vec::new()),
            auto_complete: false,
            fail_spawn: AtomicBool::new(false),
            duration: 42.0,
        })
    }

    /// Processes complete successfully right away
    pub fn auto() -> Arc<Self> {
        Arc::new(Self {
            launches: Mutex::new(Vec::new()),
            auto_complete: true,
            fail_spawn: AtomicBool::new(false),
            duration: 42.0,
        })
    }

    pub fn fail_spawns(&self, fail: bool) {
        self.fail_spawn.store(fail, Ordering::SeqCst);
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().len()
    }

    pub fn args(&self, index: usize) -> Vec<String> {
        self.launches.lock()[index].args.clone()
    }

    pub fn is_killed(&self, index: usize) -> bool {
        self.launches.lock()[index].kill.is_cancelled()
    }

    pub fn progress(&self, index: usize, tick: ProgressTick) {
        let _ = self.launches.lock()[index].control.send(Control::Progress(tick));
    }

    pub fn finish(&self, index: usize, result: Result<EncoderExit, EncodeError>) {
        let _ = self.launches.lock()[index].control.send(Control::Finish(result));
    }
}

#[async_trait]
impl EncoderBackend for FakeBackend {
    fn launch(&self, args: Vec<String>, kill: CancellationToken) -> Result<RunningEncoder, EncodeError> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(EncodeError::Spawn {
                binary: "ffmpeg".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
            });
        }

        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();

        if self.auto_complete {
            let _ = control_tx.send(Control::Finish(Ok(EncoderExit::Completed)));
        }

        let token = kill.clone();
        tokio::spawn(async move {
            let result = loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break Ok(EncoderExit::Killed),
                    control = control_rx.recv() => match control {
                        Some(Control::Progress(tick)) => {
                            let _ = progress_tx.send(tick);
                        }
                        Some(Control::Finish(result)) => break result,
                        None => break Err(EncodeError::Terminated),
                    },
                }
            };
            drop(progress_tx);
            let _ = exit_tx.send(result);
        });

        self.launches.lock().push(Launch {
            args,
            kill,
            control: control_tx,
        });

        Ok(RunningEncoder::from_parts(
            ProcessHandle::allocate(None),
            progress_rx,
            exit_rx,
        ))
    }

    async fn probe_duration(&self, _path: &Path) -> Result<f64, EncodeError> {
        Ok(self.duration)
    }
}

/// A call made against [`FakeNode`]
#[derive(Debug, Clone, PartialEq)]
pub enum NodeCall {
    Import(String),
    SourceExtension(String, String),
    Lengths(String, f64, String),
    Status(String, VideoStatus),
    UploadAdaptive {
        video_id: String,
        resolution: Resolution,
        files: Vec<PathBuf>,
    },
    UploadProgressive {
        video_id: String,
        format: OutputFormat,
        resolution: Resolution,
    },
    UploadStill(String, StillKind),
    NextExpected(String),
    Bandwidth(String),
    RemoveSegment(String, u64),
}

/// Node that records every call
pub struct FakeNode {
    calls: Mutex<Vec<NodeCall>>,
    next_expected: AtomicU64,
    bandwidth: AtomicU64,
    fail: AtomicBool,
    video_id: String,
    lengths_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeNode {
    pub fn new() -> Arc<Self> {
        Self::assigning("imported-video")
    }

    /// A Node that hands out `video_id` for every import
    pub fn assigning(video_id: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            next_expected: AtomicU64::new(0),
            bandwidth: AtomicU64::new(0),
            fail: AtomicBool::new(false),
            video_id: video_id.to_string(),
            lengths_gate: Mutex::new(None),
        })
    }

    /// Hold every `set_lengths` call after recording it until the returned
    /// semaphore gets a permit per call.
    pub fn gate_lengths(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.lengths_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<NodeCall> {
        self.calls.lock().clone()
    }

    pub fn set_next_expected(&self, index: u64) {
        self.next_expected.store(index, Ordering::SeqCst);
    }

    pub fn set_bandwidth(&self, bytes: u64) {
        self.bandwidth.store(bytes, Ordering::SeqCst);
    }

    pub fn fail_requests(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn record(&self, call: NodeCall) -> Result<(), NodeError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NodeError::Status {
                status: 503,
                message: "unavailable".to_string(),
            });
        }
        self.calls.lock().push(call);
        Ok(())
    }
}

#[async_trait]
impl NodeClient for FakeNode {
    async fn import_video(&self, details: &VideoDetails) -> Result<String, NodeError> {
        self.record(NodeCall::Import(details.title.clone()))?;
        Ok(self.video_id.clone())
    }

    async fn set_source_extension(&self, video_id: &str, extension: &str) -> Result<(), NodeError> {
        self.record(NodeCall::SourceExtension(video_id.to_string(), extension.to_string()))
    }

    async fn set_lengths(&self, video_id: &str, seconds: f64, timestamp: &str) -> Result<(), NodeError> {
        self.record(NodeCall::Lengths(video_id.to_string(), seconds, timestamp.to_string()))?;
        let gate = self.lengths_gate.lock().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        Ok(())
    }

    async fn set_status(&self, video_id: &str, status: VideoStatus) -> Result<(), NodeError> {
        self.record(NodeCall::Status(video_id.to_string(), status))
    }

    async fn upload_adaptive(
        &self,
        video_id: &str,
        _format: OutputFormat,
        resolution: Resolution,
        manifest: &Path,
        segments: &[PathBuf],
    ) -> Result<(), NodeError> {
        let mut files = vec![manifest.to_path_buf()];
        files.extend(segments.iter().cloned());
        self.record(NodeCall::UploadAdaptive {
            video_id: video_id.to_string(),
            resolution,
            files,
        })
    }

    async fn upload_progressive(
        &self,
        video_id: &str,
        format: OutputFormat,
        resolution: Resolution,
        _file: &Path,
    ) -> Result<(), NodeError> {
        self.record(NodeCall::UploadProgressive {
            video_id: video_id.to_string(),
            format,
            resolution,
        })
    }

    async fn upload_still(&self, video_id: &str, kind: StillKind, _file: &Path) -> Result<(), NodeError> {
        self.record(NodeCall::UploadStill(video_id.to_string(), kind))
    }

    async fn next_expected_segment_index(
        &self,
        video_id: &str,
        _format: OutputFormat,
        _resolution: Resolution,
    ) -> Result<u64, NodeError> {
        self.record(NodeCall::NextExpected(video_id.to_string()))?;
        Ok(self.next_expected.load(Ordering::SeqCst))
    }

    async fn bandwidth(&self, video_id: &str) -> Result<u64, NodeError> {
        self.record(NodeCall::Bandwidth(video_id.to_string()))?;
        Ok(self.bandwidth.load(Ordering::SeqCst))
    }

    async fn remove_segment(
        &self,
        video_id: &str,
        _format: OutputFormat,
        _resolution: Resolution,
        index: u64,
    ) -> Result<(), NodeError> {
        self.record(NodeCall::RemoveSegment(video_id.to_string(), index))
    }
}

/// A context wired to fakes, rooted in `root`
pub fn context(root: &Path, backend: Arc<FakeBackend>, node: Arc<FakeNode>) -> Context {
    let trackers = Arc::new(Trackers::new(Duration::from_secs(600)));
    let (bus, _upstream) = StatusBus::new(trackers.clone());
    Context {
        backend,
        node,
        bus: Arc::new(bus),
        trackers,
        layout: VideoLayout::new(root),
        agent: Arc::new(AgentStore::in_memory(ProcessingAgent::cpu())),
    }
}

/// Poll `condition` until it holds or a few seconds pass.
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Next bus event matching `filter`, or `None` after a few seconds
pub async fn next_event(
    rx: &mut broadcast::Receiver<BusMessage>,
    mut filter: impl FnMut(&VideoEvent) -> bool,
) -> Option<VideoEvent> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let message = tokio::time::timeout_at(deadline, rx.recv()).await.ok()?.ok()?;
        if filter(&message.event) {
            return Some(message.event);
        }
    }
}
