//! Source imports.
//!
//! An import registers the video with the Node, streams the uploaded bytes
//! into the video's source directory and reports progress as it goes. A stop
//! request aborts the transfer; the partial file is left where it is.

use crate::bus::VideoEvent;
use crate::context::Context;
use crate::encode::progress::format_timestamp;
use crate::encode::EncodeError;
use crate::layout::{valid_extension, valid_video_id};
use crate::node::{NodeError, VideoDetails, VideoStatus};
use crate::tracker::{TrackerEntry, TrackerError};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Error type for imports
#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error("Upstream error: {0}")]
    Node(#[from] NodeError),

    #[error("Failed to probe source: {0}")]
    Probe(#[from] EncodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Invalid source extension: {0:?}")]
    InvalidExtension(String),

    #[error("Node assigned an unusable video id: {0:?}")]
    InvalidVideoId(String),

    #[error("Import of {0} was stopped")]
    Cancelled(String),

    #[error("Video {0} is not importing")]
    NotImporting(String),
}

/// What the caller knows about an upload before the bytes arrive
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub extension: String,
    pub total_bytes: u64,
}

/// Rate-limited import progress.
///
/// Percent is `floor(received * 100 / total)`. A value is emitted at most once
/// per interval and never twice in a row; 100 is always emitted once reached.
#[derive(Debug, Clone)]
pub struct ImportProgress {
    total: u64,
    received: u64,
    interval: Duration,
    last_emit: Option<Instant>,
    last_percent: Option<u8>,
}

impl ImportProgress {
    pub fn new(total: u64, interval: Duration) -> Self {
        Self {
            total,
            received: 0,
            interval,
            last_emit: None,
            last_percent: None,
        }
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        let percent = u128::from(self.received) * 100 / u128::from(self.total);
        percent.min(100) as u8
    }

    /// Account for `len` more bytes; returns the percent to report, if any.
    pub fn record(&mut self, len: u64, now: Instant) -> Option<u8> {
        self.received = self.received.saturating_add(len);
        let percent = self.percent();

        if self.last_percent == Some(percent) {
            return None;
        }
        let due = match self.last_emit {
            Some(last) => now.saturating_duration_since(last) >= self.interval,
            None => true,
        };
        if !due && percent < 100 {
            return None;
        }

        self.last_emit = Some(now);
        self.last_percent = Some(percent);
        Some(percent)
    }
}

/// Runs imports and their stop requests
pub struct ImportManager {
    ctx: Context,
    progress_interval: Duration,
}

impl ImportManager {
    pub fn new(ctx: Context, progress_interval: Duration) -> Self {
        Self {
            ctx,
            progress_interval,
        }
    }

    /// Import `body` as a new video. Returns the Node-assigned video id once
    /// the source is stored and probed.
    pub async fn import<S, E>(&self, request: ImportRequest, body: S) -> Result<String, ImportError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Display + Send,
    {
        let extension = request.extension.to_ascii_lowercase();
        if !valid_extension(&extension) {
            return Err(ImportError::InvalidExtension(request.extension));
        }

        let node = &self.ctx.node;
        let video_id = node
            .import_video(&VideoDetails {
                title: request.title.clone(),
                description: request.description.clone(),
                tags: request.tags.clone(),
            })
            .await?;
        if !valid_video_id(&video_id) {
            return Err(ImportError::InvalidVideoId(video_id));
        }
        node.set_source_extension(&video_id, &extension).await?;
        node.set_status(&video_id, VideoStatus::Importing).await?;

        let entry = self.ctx.trackers.imports.begin(&video_id)?;
        info!(video_id = %video_id, bytes = request.total_bytes, "Import started");

        let result = match self
            .receive(&video_id, &extension, request.total_bytes, body, &entry)
            .await
        {
            Ok(path) => self.complete(&video_id, path).await,
            Err(e) => Err(e),
        };

        entry.mark_finished();
        match result {
            Ok(length_seconds) => {
                info!(video_id = %video_id, length_seconds, "Import finished");
                self.ctx.bus.publish(VideoEvent::Imported {
                    video_id: video_id.clone(),
                    length_seconds,
                });
                Ok(video_id)
            }
            Err(ImportError::Cancelled(_)) => {
                info!(video_id = %video_id, "Import stopped");
                self.ctx.bus.publish(VideoEvent::ImportingStopped {
                    video_id: video_id.clone(),
                });
                Err(ImportError::Cancelled(video_id))
            }
            Err(e) => {
                warn!(video_id = %video_id, "Import failed: {}", e);
                if let Err(status_err) = node.set_status(&video_id, VideoStatus::Error).await {
                    warn!(video_id = %video_id, "Failed to report import error: {}", status_err);
                }
                self.ctx.bus.publish(VideoEvent::Error {
                    video_id,
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn receive<S, E>(
        &self,
        video_id: &str,
        extension: &str,
        total_bytes: u64,
        body: S,
        entry: &TrackerEntry,
    ) -> Result<PathBuf, ImportError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Display + Send,
    {
        tokio::fs::create_dir_all(self.ctx.layout.source_dir(video_id)).await?;
        let path = self.ctx.layout.source_file(video_id, extension);
        let mut file = tokio::fs::File::create(&path).await?;

        let kill = entry.cancellation().kill_token();
        let mut progress = ImportProgress::new(total_bytes, self.progress_interval);
        tokio::pin!(body);

        loop {
            let chunk = tokio::select! {
                biased;
                _ = kill.cancelled() => return Err(ImportError::Cancelled(video_id.to_string())),
                chunk = body.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            let chunk = chunk.map_err(|e| ImportError::Transfer(e.to_string()))?;
            file.write_all(&chunk).await?;

            if let Some(percent) = progress.record(chunk.len() as u64, Instant::now()) {
                if !entry.is_stopping() {
                    self.ctx.bus.publish(VideoEvent::Importing {
                        video_id: video_id.to_string(),
                        progress: percent,
                    });
                }
            }
        }
        file.flush().await?;

        if entry.is_stopping() {
            return Err(ImportError::Cancelled(video_id.to_string()));
        }
        debug!(video_id, bytes = progress.received(), path = %path.display(), "Source stored");
        Ok(path)
    }

    async fn complete(&self, video_id: &str, path: PathBuf) -> Result<f64, ImportError> {
        let length_seconds = self.ctx.backend.probe_duration(&path).await?;
        let node = &self.ctx.node;
        node.set_lengths(video_id, length_seconds, &format_timestamp(length_seconds))
            .await?;
        node.set_status(video_id, VideoStatus::Imported).await?;
        Ok(length_seconds)
    }

    /// Stop an import: progress stops, then the transfer is aborted.
    pub fn stop(&self, video_id: &str) -> Result<(), ImportError> {
        let entry = self
            .ctx
            .trackers
            .imports
            .active(video_id)
            .ok_or_else(|| ImportError::NotImporting(video_id.to_string()))?;

        if entry.cancellation().request_stop() {
            info!(video_id, "Stopping import");
            self.ctx.bus.publish(VideoEvent::ImportingStopping {
                video_id: video_id.to_string(),
            });
        }
        entry.cancellation().terminate();
        Ok(())
    }
}
