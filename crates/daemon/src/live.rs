//! Live stream sessions.
//!
//! A session runs one long-lived encoder that listens for an inbound RTMP
//! stream and writes a segmented live rendition. Alongside it a poll loop asks
//! the Node which segment it expects next, forwards that segment with fresh
//! stills, and retires segments that fell out of the sliding window.
//!
//! Session states: starting, streaming, stopping, stopped. An encoder exit
//! that was not asked for is still reported as stopping then stopped, with
//! [`StopReason::ProcessExited`].

use crate::bus::{StopReason, VideoEvent};
use crate::config::LiveConfig;
use crate::context::Context;
use crate::encode::progress::format_timestamp;
use crate::encode::{
    extract_stills, resolve_args, EncodeError, EncodeInput, EncodeRequest, EncoderExit,
    LiveOptions, OutputFormat, ProfileError, Resolution, RunningEncoder,
};
use crate::layout::{remove_file_if_exists, valid_video_id};
use crate::node::{NodeError, VideoStatus};
use crate::tracker::{TrackerEntry, TrackerError, TrackerKind};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Error type for live stream operations
#[derive(Debug, Error)]
pub enum LiveError {
    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error("Profile error: {0}")]
    Profile(#[from] ProfileError),

    #[error("Encoder error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Upstream error: {0}")]
    Node(#[from] NodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Video {0} is not streaming")]
    NotStreaming(String),

    #[error("Invalid video id: {0:?}")]
    InvalidVideoId(String),
}

/// Options for one broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    pub rtmp_port: u16,
    pub resolution: Resolution,
    /// The Node keeps every segment
    #[serde(default)]
    pub retain_remotely: bool,
    /// Append every forwarded segment to a local recording
    #[serde(default)]
    pub record_locally: bool,
    #[serde(default)]
    pub title: Option<String>,
}

/// Listen URL for a stream
pub fn rtmp_listen_url(port: u16, video_id: &str) -> String {
    format!("rtmp://0.0.0.0:{}/live/{}", port, video_id)
}

/// Sliding-window retention cursor.
///
/// Each advance retires every index from the last boundary up to
/// `expected - window`, so nothing below the boundary survives even when the
/// expected index jumps by more than one between polls. The first retirement
/// covers at most one window: a session resuming far into a stream has
/// nothing older on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    window: u64,
    next_unretired: Option<u64>,
}

impl Retention {
    pub fn new(window: u64) -> Self {
        Self {
            window: window.max(1),
            next_unretired: None,
        }
    }

    /// Boundary index for an expected index, if the window has filled
    pub fn boundary(&self, expected: u64) -> Option<u64> {
        expected.checked_sub(self.window)
    }

    /// Indices newly retired by `expected`; `None` if nothing new.
    pub fn advance(&mut self, expected: u64) -> Option<RangeInclusive<u64>> {
        let boundary = self.boundary(expected)?;
        let start = self
            .next_unretired
            .unwrap_or_else(|| boundary.saturating_sub(self.window - 1));
        if boundary < start {
            return None;
        }
        self.next_unretired = Some(boundary + 1);
        Some(start..=boundary)
    }
}

/// Starts and stops live sessions
pub struct LiveSessions {
    ctx: Context,
    config: LiveConfig,
}

impl LiveSessions {
    pub fn new(ctx: Context, config: LiveConfig) -> Self {
        Self { ctx, config }
    }

    /// Start a broadcast for `video_id`. Rejected if one is already running or
    /// the video is being published, since both share its output directories.
    pub async fn start(&self, video_id: &str, settings: StreamSettings) -> Result<(), LiveError> {
        if !valid_video_id(video_id) {
            return Err(LiveError::InvalidVideoId(video_id.to_string()));
        }
        let trackers = &self.ctx.trackers;
        let entry = trackers.exclusive(video_id, TrackerKind::Encoding, || trackers.streams.begin(video_id))?;

        let encoder = match self.launch(video_id, &settings, &entry).await {
            Ok(encoder) => encoder,
            Err(e) => {
                warn!(video_id, "Failed to start stream: {}", e);
                entry.mark_finished();
                return Err(e);
            }
        };

        info!(video_id, port = settings.rtmp_port, resolution = %settings.resolution, "Stream started");
        self.ctx.bus.publish(VideoEvent::Streaming {
            video_id: video_id.to_string(),
            length_seconds: None,
            bandwidth: None,
        });

        let session = LiveSession {
            ctx: self.ctx.clone(),
            poll_interval: Duration::from_millis(self.config.poll_interval_ms.max(1)),
            still_offset_secs: self.config.still_offset_secs,
            retention: Retention::new(self.config.segment_window),
            video_id: video_id.to_string(),
            settings,
            entry,
        };
        tokio::spawn(session.run(encoder));
        Ok(())
    }

    async fn launch(
        &self,
        video_id: &str,
        settings: &StreamSettings,
        entry: &TrackerEntry,
    ) -> Result<RunningEncoder, LiveError> {
        let layout = &self.ctx.layout;
        layout
            .prepare_output(video_id, OutputFormat::Segmented, settings.resolution)
            .await?;
        fs::create_dir_all(layout.images_dir(video_id)).await?;
        if settings.record_locally {
            fs::create_dir_all(layout.source_dir(video_id)).await?;
        }

        let request = EncodeRequest {
            video_id: video_id.to_string(),
            format: OutputFormat::Segmented,
            resolution: settings.resolution,
            input: EncodeInput::Listen(rtmp_listen_url(settings.rtmp_port, video_id)),
            output: layout.manifest_file(video_id, settings.resolution),
            segment_pattern: Some(layout.segment_pattern(video_id, settings.resolution)),
            live: Some(LiveOptions {
                retain_remotely: settings.retain_remotely,
                list_size: self.config.segment_window,
                segment_duration_secs: self.config.segment_duration_secs,
            }),
        };
        let args = resolve_args(&request, &self.ctx.agent.snapshot())?;

        self.ctx
            .node
            .set_status(video_id, VideoStatus::Streaming)
            .await?;

        let encoder = self
            .ctx
            .backend
            .launch(args, entry.cancellation().kill_token())?;
        entry.attach(encoder.handle().clone());
        Ok(encoder)
    }

    /// Stop a broadcast: soft flag, `streaming_stopping`, then kill the encoder.
    /// `streaming_stopped` follows once the encoder has exited.
    pub fn stop(&self, video_id: &str) -> Result<(), LiveError> {
        let entry = self
            .ctx
            .trackers
            .streams
            .active(video_id)
            .ok_or_else(|| LiveError::NotStreaming(video_id.to_string()))?;

        if entry.cancellation().request_stop() {
            info!(video_id, "Stopping stream");
            self.ctx.bus.publish(VideoEvent::StreamingStopping {
                video_id: video_id.to_string(),
            });
        }
        entry.cancellation().terminate();
        Ok(())
    }
}

struct LiveSession {
    ctx: Context,
    poll_interval: Duration,
    still_offset_secs: f64,
    retention: Retention,
    video_id: String,
    settings: StreamSettings,
    entry: Arc<TrackerEntry>,
}

impl LiveSession {
    async fn run(mut self, encoder: RunningEncoder) {
        let (handle, mut progress, exit) = encoder.into_parts();
        let exit = exit.wait();
        tokio::pin!(exit);

        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut progress_open = true;

        let result = loop {
            tokio::select! {
                result = &mut exit => break result,
                tick = progress.recv(), if progress_open => match tick {
                    Some(tick) => self.report_length(tick.elapsed_secs).await,
                    None => progress_open = false,
                },
                _ = poll.tick() => {
                    if !self.entry.is_stopping() {
                        if let Err(e) = self.poll_once().await {
                            warn!(video_id = %self.video_id, "Live poll failed: {}", e);
                        }
                    }
                }
            }
        };

        self.entry.detach(handle.id);
        self.finish(result).await;
    }

    async fn report_length(&self, seconds: f64) {
        if let Err(e) = self
            .ctx
            .node
            .set_lengths(&self.video_id, seconds, &format_timestamp(seconds))
            .await
        {
            debug!(video_id = %self.video_id, "Failed to report stream length: {}", e);
        }
        self.ctx.bus.publish(VideoEvent::Streaming {
            video_id: self.video_id.clone(),
            length_seconds: Some(seconds),
            bandwidth: None,
        });
    }

    /// One poll: retire old segments, forward the expected one if it is ready.
    async fn poll_once(&mut self) -> Result<(), LiveError> {
        let resolution = self.settings.resolution;
        let expected = self
            .ctx
            .node
            .next_expected_segment_index(&self.video_id, OutputFormat::Segmented, resolution)
            .await?;

        let retired = self.retention.advance(expected);
        if let Some(range) = &retired {
            for index in range.clone() {
                let path = self.ctx.layout.segment_file(&self.video_id, resolution, index);
                if let Err(e) = remove_file_if_exists(&path).await {
                    warn!(video_id = %self.video_id, index, "Failed to retire segment: {}", e);
                }
            }
        }

        let forwarded = self.forward_segment(expected).await;

        if !self.settings.retain_remotely {
            if let Some(range) = retired {
                self.ctx
                    .node
                    .remove_segment(&self.video_id, OutputFormat::Segmented, resolution, *range.end())
                    .await?;
            }
        }

        forwarded
    }

    async fn forward_segment(&self, index: u64) -> Result<(), LiveError> {
        let ctx = &self.ctx;
        let resolution = self.settings.resolution;
        let manifest = ctx.layout.manifest_file(&self.video_id, resolution);
        let segment = ctx.layout.segment_file(&self.video_id, resolution, index);

        if !exists(&manifest).await || !exists(&segment).await {
            return Ok(());
        }

        let stills = extract_stills(
            ctx.backend.as_ref(),
            &segment,
            self.still_offset_secs,
            &ctx.layout.images_dir(&self.video_id),
            &self.entry.cancellation().kill_token(),
        )
        .await?;
        for (kind, path) in &stills {
            ctx.node.upload_still(&self.video_id, *kind, path).await?;
        }

        ctx.node
            .upload_adaptive(
                &self.video_id,
                OutputFormat::Segmented,
                resolution,
                &manifest,
                std::slice::from_ref(&segment),
            )
            .await?;
        debug!(video_id = %self.video_id, index, "Segment forwarded");

        if self.settings.record_locally {
            append_segment(&segment, &ctx.layout.live_recording_file(&self.video_id)).await?;
        }

        let bandwidth = ctx.node.bandwidth(&self.video_id).await?;
        ctx.bus.publish(VideoEvent::Streaming {
            video_id: self.video_id.clone(),
            length_seconds: None,
            bandwidth: Some(bandwidth),
        });
        Ok(())
    }

    async fn finish(&self, result: Result<EncoderExit, EncodeError>) {
        let cancellation = self.entry.cancellation();

        let reason = if cancellation.request_stop() {
            let code = match &result {
                Err(EncodeError::Exit(code)) => Some(*code),
                _ => None,
            };
            warn!(video_id = %self.video_id, ?result, "Encoder exited unexpectedly");
            self.ctx.bus.publish(VideoEvent::StreamingStopping {
                video_id: self.video_id.clone(),
            });
            StopReason::ProcessExited { code }
        } else {
            StopReason::UserStopped
        };
        // stills still running
        cancellation.terminate();

        if let Err(e) = self
            .ctx
            .node
            .set_status(&self.video_id, VideoStatus::Streamed)
            .await
        {
            warn!(video_id = %self.video_id, "Failed to report streamed status: {}", e);
        }
        if let Err(e) = self.ctx.layout.clean_transient(&self.video_id).await {
            warn!(video_id = %self.video_id, "Failed to clean working directories: {}", e);
        }

        info!(video_id = %self.video_id, ?reason, "Stream stopped");
        self.entry.mark_finished();
        self.ctx.bus.publish(VideoEvent::StreamingStopped {
            video_id: self.video_id.clone(),
            reason,
        });
    }
}

async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

/// Append a segment's bytes to the local recording.
async fn append_segment(segment: &Path, recording: &Path) -> std::io::Result<()> {
    let mut source = fs::File::open(segment).await?;
    let mut target = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(recording)
        .await?;
    tokio::io::copy(&mut source, &mut target).await?;
    target.flush().await
}
