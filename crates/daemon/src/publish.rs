//! Publish job queue.
//!
//! Jobs wait in a FIFO pending queue. A periodic dispatcher tick drains job
//! completions and promotes pending jobs while fewer than `cap` are in
//! progress; only the tick mutates the in-progress set. When a video has no
//! jobs left, a finalization step reports the outcome to the Node and cleans
//! the transient output directories.

use crate::bus::VideoEvent;
use crate::context::Context;
use crate::encode::progress::format_timestamp;
use crate::encode::{
    resolve_args, EncodeError, EncodeInput, EncodeRequest, EncoderExit, OutputFormat,
    ProfileError, Resolution,
};
use crate::layout::{discard_files, valid_extension, valid_video_id};
use crate::node::{NodeError, VideoStatus};
use crate::tracker::{TrackerEntry, TrackerError, TrackerKind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Error type for a single job
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Profile error: {0}")]
    Profile(#[from] ProfileError),

    #[error("Encode failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("Upstream error: {0}")]
    Node(#[from] NodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The video's publish run is stopping
    #[error("Cancelled: video is stopping")]
    Cancelled,
}

impl JobError {
    /// Cancellation is a terminal state, not a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobError::Cancelled)
    }
}

/// Error type for queue operations
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("No publish targets given")]
    NoTargets,

    #[error("Invalid video id: {0:?}")]
    InvalidVideoId(String),

    #[error("Invalid source extension: {0:?}")]
    InvalidExtension(String),

    #[error("Job already queued for video {video_id}: {format} {resolution}")]
    Duplicate {
        video_id: String,
        format: OutputFormat,
        resolution: Resolution,
    },

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error("Video {0} is not publishing")]
    NotPublishing(String),

    /// The previous run is still reporting its outcome
    #[error("Publish of video {0} is finalizing")]
    Finalizing(String),

    #[error("Upstream error: {0}")]
    Node(#[from] NodeError),
}

/// One rendition to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublishTarget {
    pub format: OutputFormat,
    pub resolution: Resolution,
}

/// An encode + upload of one rendition of one video
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishJob {
    pub id: Uuid,
    pub video_id: String,
    pub format: OutputFormat,
    pub resolution: Resolution,
    pub source_extension: String,
}

impl PublishJob {
    pub fn new(video_id: &str, target: PublishTarget, source_extension: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            video_id: video_id.to_string(),
            format: target.format,
            resolution: target.resolution,
            source_extension: source_extension.to_string(),
        }
    }

    fn key(&self) -> (&str, OutputFormat, Resolution) {
        (&self.video_id, self.format, self.resolution)
    }
}

/// Stage of a job in the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStage {
    Pending,
    Dispatched,
    Encoding,
    Uploading,
}

impl JobStage {
    pub fn as_str(&self) -> &str {
        match self {
            JobStage::Pending => "pending",
            JobStage::Dispatched => "dispatched",
            JobStage::Encoding => "encoding",
            JobStage::Uploading => "uploading",
        }
    }
}

/// A job as shown by the queue snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: Uuid,
    pub video_id: String,
    pub format: OutputFormat,
    pub resolution: Resolution,
    pub stage: String,
}

impl JobView {
    fn new(job: &PublishJob, stage: &JobStage) -> Self {
        Self {
            id: job.id,
            video_id: job.video_id.clone(),
            format: job.format,
            resolution: job.resolution,
            stage: stage.as_str().to_string(),
        }
    }
}

/// Point-in-time view of the queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub cap: usize,
    pub pending: Vec<JobView>,
    pub in_progress: Vec<JobView>,
}

/// What one dispatcher tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Completions drained from running jobs
    pub completed: usize,
    /// Pending jobs started
    pub promoted: usize,
    /// Pending jobs dropped because their video is stopping
    pub short_circuited: usize,
    /// Videos whose last job just ended
    pub finalized: usize,
    /// Tracker tombstones evicted
    pub evicted: usize,
}

struct JobCompletion {
    job: PublishJob,
    result: Result<(), JobError>,
}

/// Outcome counts for a video's current publish run
#[derive(Debug, Clone, Default)]
struct Tally {
    source_extension: String,
    succeeded: usize,
    failed: usize,
    cancelled: usize,
}

struct InFlight {
    job: PublishJob,
    stage: JobStage,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<PublishJob>,
    in_progress: HashMap<Uuid, InFlight>,
    /// One entry per video with an open publish run
    tallies: HashMap<String, Tally>,
    /// Videos whose run has ended but is not yet finalized
    finalizing: HashSet<String>,
}

impl QueueState {
    fn contains(&self, key: (&str, OutputFormat, Resolution)) -> bool {
        self.pending.iter().any(|j| j.key() == key)
            || self.in_progress.values().any(|f| f.job.key() == key)
    }

    fn has_jobs_for(&self, video_id: &str) -> bool {
        self.pending.iter().any(|j| j.video_id == video_id)
            || self.in_progress.values().any(|f| f.job.video_id == video_id)
    }

    fn check_admissible(&self, video_id: &str, jobs: &[PublishJob]) -> Result<(), PublishError> {
        if self.finalizing.contains(video_id) {
            return Err(PublishError::Finalizing(video_id.to_string()));
        }
        match jobs.iter().find(|j| self.contains(j.key())) {
            Some(job) => Err(duplicate(job)),
            None => Ok(()),
        }
    }

    /// Close the video's run if nothing is left for it.
    fn take_idle_tally(&mut self, video_id: &str) -> Option<Tally> {
        if self.has_jobs_for(video_id) {
            return None;
        }
        let tally = self.tallies.remove(video_id)?;
        self.finalizing.insert(video_id.to_string());
        Some(tally)
    }
}

/// Bounded-concurrency publish queue
pub struct PublishQueue {
    ctx: Context,
    cap: usize,
    state: Mutex<QueueState>,
    completions_tx: mpsc::UnboundedSender<JobCompletion>,
    completions_rx: Mutex<mpsc::UnboundedReceiver<JobCompletion>>,
}

impl PublishQueue {
    pub fn new(ctx: Context, cap: usize) -> Arc<Self> {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            ctx,
            cap: cap.max(1),
            state: Mutex::new(QueueState::default()),
            completions_tx,
            completions_rx: Mutex::new(completions_rx),
        })
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Queue renditions of a video.
    ///
    /// Reports `publishing` to the Node first; an upstream failure aborts
    /// before anything is queued. A duplicate of a queued or running
    /// (video, format, resolution) rejects the whole request, as does a live
    /// stream of the video or a run of it that is still finalizing.
    pub async fn start_publish(
        &self,
        video_id: &str,
        source_extension: &str,
        targets: &[PublishTarget],
    ) -> Result<Vec<Uuid>, PublishError> {
        if !valid_video_id(video_id) {
            return Err(PublishError::InvalidVideoId(video_id.to_string()));
        }
        if !valid_extension(source_extension) {
            return Err(PublishError::InvalidExtension(source_extension.to_string()));
        }
        if targets.is_empty() {
            return Err(PublishError::NoTargets);
        }

        let mut seen = HashSet::new();
        let jobs: Vec<PublishJob> = targets
            .iter()
            .filter(|t| seen.insert(**t))
            .map(|t| PublishJob::new(video_id, *t, source_extension))
            .collect();

        self.check_admissible(video_id, &jobs)?;
        self.ctx
            .node
            .set_status(video_id, VideoStatus::Publishing)
            .await?;

        let mut state = self.state.lock();
        state.check_admissible(video_id, &jobs)?;
        let trackers = &self.ctx.trackers;
        trackers.exclusive(video_id, TrackerKind::Stream, || trackers.encoding.enlist(video_id))?;
        state
            .tallies
            .entry(video_id.to_string())
            .or_insert_with(|| Tally {
                source_extension: source_extension.to_string(),
                ..Tally::default()
            });

        let ids = jobs.iter().map(|j| j.id).collect();
        for job in jobs {
            info!(video_id = %job.video_id, format = %job.format, resolution = %job.resolution, "Job queued");
            state.pending.push_back(job);
        }
        Ok(ids)
    }

    fn check_admissible(&self, video_id: &str, jobs: &[PublishJob]) -> Result<(), PublishError> {
        if self.ctx.trackers.streams.is_active(video_id) {
            return Err(TrackerError::AlreadyActive {
                kind: TrackerKind::Stream,
                video_id: video_id.to_string(),
            }
            .into());
        }
        self.state.lock().check_admissible(video_id, jobs)
    }

    /// Stop a video's publish run: soft flag, then kill its encoders.
    ///
    /// Emits `publishing_stopping` once; `publishing_stopped` follows when the
    /// last job for the video has ended.
    pub fn stop_publish(self: &Arc<Self>, video_id: &str) -> Result<(), PublishError> {
        let entry = self
            .ctx
            .trackers
            .encoding
            .active(video_id)
            .ok_or_else(|| PublishError::NotPublishing(video_id.to_string()))?;

        if entry.cancellation().request_stop() {
            info!(video_id, "Stopping publish");
            self.ctx.bus.publish(VideoEvent::PublishingStopping {
                video_id: video_id.to_string(),
            });
        }
        entry.cancellation().terminate();

        let idle_tally = self.state.lock().take_idle_tally(video_id);
        if let Some(tally) = idle_tally {
            let queue = self.clone();
            let video_id = video_id.to_string();
            tokio::spawn(async move { queue.finalize(video_id, tally).await });
        }
        Ok(())
    }

    /// Drain completions, promote pending jobs up to the cap, start
    /// finalization for videos with no jobs left and evict old tracker entries.
    pub fn dispatch_tick(self: &Arc<Self>) -> TickReport {
        let mut report = TickReport::default();
        let mut touched: Vec<String> = Vec::new();
        let mut finished: Vec<(String, Tally)> = Vec::new();

        {
            let mut state = self.state.lock();

            {
                let mut completions = self.completions_rx.lock();
                while let Ok(completion) = completions.try_recv() {
                    state.in_progress.remove(&completion.job.id);
                    report.completed += 1;
                    let tally = state
                        .tallies
                        .entry(completion.job.video_id.clone())
                        .or_default();
                    match &completion.result {
                        Ok(()) => tally.succeeded += 1,
                        Err(e) if e.is_cancelled() => tally.cancelled += 1,
                        Err(_) => tally.failed += 1,
                    }
                    touched.push(completion.job.video_id);
                }
            }

            while state.in_progress.len() < self.cap {
                let Some(job) = state.pending.pop_front() else {
                    break;
                };

                let entry = match self.ctx.trackers.encoding.active(&job.video_id) {
                    Some(entry) if !entry.is_stopping() => entry,
                    _ => {
                        debug!(video_id = %job.video_id, format = %job.format, resolution = %job.resolution, "Dropping job for stopping video");
                        state
                            .tallies
                            .entry(job.video_id.clone())
                            .or_default()
                            .cancelled += 1;
                        report.short_circuited += 1;
                        touched.push(job.video_id);
                        continue;
                    }
                };

                info!(video_id = %job.video_id, format = %job.format, resolution = %job.resolution, "Job dispatched");
                state.in_progress.insert(
                    job.id,
                    InFlight {
                        job: job.clone(),
                        stage: JobStage::Dispatched,
                    },
                );
                report.promoted += 1;

                let queue = self.clone();
                tokio::spawn(async move { queue.run_job(job, entry).await });
            }

            touched.sort();
            touched.dedup();
            for video_id in touched {
                if let Some(tally) = state.take_idle_tally(&video_id) {
                    finished.push((video_id, tally));
                }
            }
        }

        report.finalized = finished.len();
        for (video_id, tally) in finished {
            let queue = self.clone();
            tokio::spawn(async move { queue.finalize(video_id, tally).await });
        }

        report.evicted = self.ctx.trackers.evict_expired(Instant::now());
        report
    }

    /// Tick every `interval` until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.dispatch_tick();
                    if report != TickReport::default() {
                        debug!(?report, "Dispatcher tick");
                    }
                }
            }
        }
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock();
        let mut in_progress: Vec<JobView> = state
            .in_progress
            .values()
            .map(|f| JobView::new(&f.job, &f.stage))
            .collect();
        in_progress.sort_by(|a, b| (&a.video_id, a.format, a.resolution).cmp(&(&b.video_id, b.format, b.resolution)));

        QueueSnapshot {
            cap: self.cap,
            pending: state
                .pending
                .iter()
                .map(|j| JobView::new(j, &JobStage::Pending))
                .collect(),
            in_progress,
        }
    }

    /// Number of jobs currently past dispatch
    pub fn in_progress_count(&self) -> usize {
        self.state.lock().in_progress.len()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn set_stage(&self, job_id: Uuid, stage: JobStage) {
        if let Some(flight) = self.state.lock().in_progress.get_mut(&job_id) {
            flight.stage = stage;
        }
    }

    async fn run_job(self: Arc<Self>, job: PublishJob, entry: Arc<TrackerEntry>) {
        let result = self.execute(&job, &entry).await;

        match &result {
            Ok(()) => {
                info!(video_id = %job.video_id, format = %job.format, resolution = %job.resolution, "Job done");
            }
            Err(e) if e.is_cancelled() => {
                info!(video_id = %job.video_id, format = %job.format, resolution = %job.resolution, "Job cancelled");
            }
            Err(e) => {
                warn!(video_id = %job.video_id, format = %job.format, resolution = %job.resolution, "Job failed: {}", e);
                self.ctx.bus.publish(VideoEvent::PublishingFailed {
                    video_id: job.video_id.clone(),
                    format: job.format,
                    resolution: job.resolution,
                    message: e.to_string(),
                });
            }
        }

        // the receiver lives as long as the queue
        let _ = self.completions_tx.send(JobCompletion { job, result });
    }

    async fn execute(&self, job: &PublishJob, entry: &TrackerEntry) -> Result<(), JobError> {
        let ctx = &self.ctx;
        let layout = &ctx.layout;
        if entry.is_stopping() {
            return Err(JobError::Cancelled);
        }

        let agent = ctx.agent.snapshot();
        let request = EncodeRequest {
            video_id: job.video_id.clone(),
            format: job.format,
            resolution: job.resolution,
            input: EncodeInput::File(layout.source_file(&job.video_id, &job.source_extension)),
            output: layout.output_target(&job.video_id, job.format, job.resolution),
            segment_pattern: job
                .format
                .is_segmented()
                .then(|| layout.segment_pattern(&job.video_id, job.resolution)),
            live: None,
        };
        let args = resolve_args(&request, &agent)?;
        layout
            .prepare_output(&job.video_id, job.format, job.resolution)
            .await?;

        if entry.is_stopping() {
            return Err(JobError::Cancelled);
        }

        self.set_stage(job.id, JobStage::Encoding);
        let kill = entry.cancellation().kill_token();
        let mut encoder = ctx.backend.launch(args, kill.clone())?;
        let handle = encoder.handle().clone();
        entry.attach(handle.clone());
        info!(video_id = %job.video_id, format = %job.format, resolution = %job.resolution, pid = ?handle.pid, "Encoder started");

        ctx.bus.publish(VideoEvent::Publishing {
            video_id: job.video_id.clone(),
            format: job.format,
            resolution: job.resolution,
            progress: 0,
        });

        let mut last_percent = 0u8;
        while let Some(tick) = encoder.next_progress().await {
            if let Some(percent) = tick.percent {
                if percent > last_percent && !entry.is_stopping() {
                    last_percent = percent;
                    ctx.bus.publish(VideoEvent::Publishing {
                        video_id: job.video_id.clone(),
                        format: job.format,
                        resolution: job.resolution,
                        progress: percent,
                    });
                }
            }
        }

        let exit = encoder.wait().await;
        entry.detach(handle.id);
        debug!(video_id = %job.video_id, pid = ?handle.pid, ?exit, "Encoder exited");

        match exit {
            Ok(EncoderExit::Completed) => {}
            Ok(EncoderExit::Killed) => return Err(JobError::Cancelled),
            Err(_) if entry.is_stopping() => return Err(JobError::Cancelled),
            Err(e) => return Err(e.into()),
        }

        if entry.is_stopping() {
            return Err(JobError::Cancelled);
        }

        self.set_stage(job.id, JobStage::Uploading);
        let uploaded = tokio::select! {
            _ = kill.cancelled() => return Err(JobError::Cancelled),
            uploaded = self.upload(job) => uploaded?,
        };
        discard_files(&uploaded).await;
        Ok(())
    }

    /// Upload the rendition; returns the local files that were sent.
    async fn upload(&self, job: &PublishJob) -> Result<Vec<PathBuf>, JobError> {
        let ctx = &self.ctx;
        if job.format.is_segmented() {
            let manifest = ctx.layout.manifest_file(&job.video_id, job.resolution);
            let segments = ctx.layout.list_segments(&job.video_id, job.resolution).await?;
            ctx.node
                .upload_adaptive(&job.video_id, job.format, job.resolution, &manifest, &segments)
                .await?;

            let mut uploaded = segments;
            uploaded.push(manifest);
            Ok(uploaded)
        } else {
            let file = ctx
                .layout
                .progressive_file(&job.video_id, job.format, job.resolution);
            ctx.node
                .upload_progressive(&job.video_id, job.format, job.resolution, &file)
                .await?;
            Ok(vec![file])
        }
    }

    /// Close out a video's publish run.
    async fn finalize(&self, video_id: String, tally: Tally) {
        let ctx = &self.ctx;
        let entry = ctx.trackers.encoding.get(&video_id);
        let stopping = entry.as_ref().map(|e| e.is_stopping()).unwrap_or(false);

        let event = if stopping || (tally.succeeded == 0 && tally.failed == 0) {
            info!(video_id = %video_id, cancelled = tally.cancelled, "Publish stopped");
            VideoEvent::PublishingStopped {
                video_id: video_id.clone(),
            }
        } else if tally.succeeded == 0 {
            warn!(video_id = %video_id, failed = tally.failed, "Every publish job failed");
            if let Err(e) = ctx.node.set_status(&video_id, VideoStatus::Error).await {
                error!(video_id = %video_id, "Failed to report error status: {}", e);
            }
            VideoEvent::Error {
                video_id: video_id.clone(),
                message: format!("all {} publish jobs failed", tally.failed),
            }
        } else {
            match self.report_published(&video_id, &tally.source_extension).await {
                Ok(length_seconds) => {
                    info!(video_id = %video_id, succeeded = tally.succeeded, failed = tally.failed, "Published");
                    VideoEvent::Published {
                        video_id: video_id.clone(),
                        length_seconds,
                    }
                }
                Err(e) => {
                    error!(video_id = %video_id, "Failed to finalize publish: {}", e);
                    VideoEvent::Error {
                        video_id: video_id.clone(),
                        message: e.to_string(),
                    }
                }
            }
        };

        if let Err(e) = ctx.layout.clean_transient(&video_id).await {
            warn!(video_id = %video_id, "Failed to clean working directories: {}", e);
        }
        if let Some(entry) = entry {
            entry.mark_finished();
        }
        self.state.lock().finalizing.remove(&video_id);
        ctx.bus.publish(event);
    }

    async fn report_published(&self, video_id: &str, source_extension: &str) -> Result<f64, JobError> {
        let ctx = &self.ctx;
        let source = ctx.layout.source_file(video_id, source_extension);
        let seconds = ctx.backend.probe_duration(&source).await?;
        ctx.node
            .set_lengths(video_id, seconds, &format_timestamp(seconds))
            .await?;
        ctx.node.set_status(video_id, VideoStatus::Published).await?;
        Ok(seconds)
    }
}

fn duplicate(job: &PublishJob) -> PublishError {
    PublishError::Duplicate {
        video_id: job.video_id.clone(),
        format: job.format,
        resolution: job.resolution,
    }
}
