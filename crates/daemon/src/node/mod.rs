//! Client side of the remote Node.
//!
//! The core talks to the Node only through [`NodeClient`]; [`HttpNodeClient`]
//! is the production transport and [`realtime::RealtimeLink`] carries status
//! events over the Node's WebSocket channel.

pub mod http;
pub mod realtime;

use crate::encode::{OutputFormat, Resolution, StillKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use http::HttpNodeClient;
pub use realtime::RealtimeLink;

/// Error type for Node communication
#[derive(Debug, Error)]
pub enum NodeError {
    /// Transport-level failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-2xx response, or a reply flagged as an error
    #[error("Node returned {status}: {message}")]
    Status { status: u16, message: String },

    /// Reply body did not have the expected shape
    #[error("Failed to decode Node reply: {0}")]
    Decode(String),

    /// Reading a file to upload failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Video status values recorded on the Node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoStatus {
    Importing,
    Imported,
    Publishing,
    Published,
    Streaming,
    Streamed,
    Error,
}

impl VideoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoStatus::Importing => "importing",
            VideoStatus::Imported => "imported",
            VideoStatus::Publishing => "publishing",
            VideoStatus::Published => "published",
            VideoStatus::Streaming => "streaming",
            VideoStatus::Streamed => "streamed",
            VideoStatus::Error => "error",
        }
    }
}

/// Metadata for a new video
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoDetails {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Operations the agent needs from the Node
#[async_trait]
pub trait NodeClient: Send + Sync + 'static {
    /// Register a new video; returns its id
    async fn import_video(&self, details: &VideoDetails) -> Result<String, NodeError>;

    async fn set_source_extension(&self, video_id: &str, extension: &str) -> Result<(), NodeError>;

    /// Record the video length in seconds and as `HH:MM:SS`
    async fn set_lengths(&self, video_id: &str, seconds: f64, timestamp: &str) -> Result<(), NodeError>;

    async fn set_status(&self, video_id: &str, status: VideoStatus) -> Result<(), NodeError>;

    /// Upload a manifest and its segments
    async fn upload_adaptive(
        &self,
        video_id: &str,
        format: OutputFormat,
        resolution: Resolution,
        manifest: &Path,
        segments: &[PathBuf],
    ) -> Result<(), NodeError>;

    /// Upload a single-file rendition
    async fn upload_progressive(
        &self,
        video_id: &str,
        format: OutputFormat,
        resolution: Resolution,
        file: &Path,
    ) -> Result<(), NodeError>;

    async fn upload_still(&self, video_id: &str, kind: StillKind, file: &Path) -> Result<(), NodeError>;

    /// Index of the segment the Node expects next for a live rendition
    async fn next_expected_segment_index(
        &self,
        video_id: &str,
        format: OutputFormat,
        resolution: Resolution,
    ) -> Result<u64, NodeError>;

    /// Current viewer bandwidth for a video, bytes per second
    async fn bandwidth(&self, video_id: &str) -> Result<u64, NodeError>;

    /// Ask the Node to drop one live segment
    async fn remove_segment(
        &self,
        video_id: &str,
        format: OutputFormat,
        resolution: Resolution,
        index: u64,
    ) -> Result<(), NodeError>;
}
