//! On-disk layout of a video's working directory.
//!
//! Every video lives under `<videos_root>/<video_id>/`:
//!
//! ```text
//! source/<id>.<ext>                                  imported source, or live recording (.ts)
//! images/{thumbnail,preview,poster}.jpg              stills
//! adaptive/<format>/<res>/manifest-<res>.m3u8        segmented output
//! adaptive/<format>/<res>/segment-<res>-<n>.ts
//! progressive/<format>/<res>/<res>.<format>          single-file output
//! ```
//!
//! `adaptive/` and `progressive/` are transient and removed once a publish
//! or stream finishes.

use crate::encode::{OutputFormat, Resolution, StillKind};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

/// Path builder rooted at the videos directory
#[derive(Debug, Clone)]
pub struct VideoLayout {
    root: PathBuf,
}

impl VideoLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn video_dir(&self, video_id: &str) -> PathBuf {
        self.root.join(video_id)
    }

    pub fn source_dir(&self, video_id: &str) -> PathBuf {
        self.video_dir(video_id).join("source")
    }

    /// Imported source file `source/<id>.<ext>`
    pub fn source_file(&self, video_id: &str, extension: &str) -> PathBuf {
        self.source_dir(video_id)
            .join(format!("{}.{}", video_id, extension.trim_start_matches('.')))
    }

    /// Local recording of a live stream
    pub fn live_recording_file(&self, video_id: &str) -> PathBuf {
        self.source_file(video_id, "ts")
    }

    pub fn images_dir(&self, video_id: &str) -> PathBuf {
        self.video_dir(video_id).join("images")
    }

    pub fn still_file(&self, video_id: &str, kind: StillKind) -> PathBuf {
        self.images_dir(video_id).join(kind.file_name())
    }

    pub fn adaptive_root(&self, video_id: &str) -> PathBuf {
        self.video_dir(video_id).join("adaptive")
    }

    pub fn progressive_root(&self, video_id: &str) -> PathBuf {
        self.video_dir(video_id).join("progressive")
    }

    /// Output directory for one (format, resolution)
    pub fn output_dir(&self, video_id: &str, format: OutputFormat, resolution: Resolution) -> PathBuf {
        let root = if format.is_segmented() {
            self.adaptive_root(video_id)
        } else {
            self.progressive_root(video_id)
        };
        root.join(format.as_str()).join(resolution.as_str())
    }

    pub fn manifest_file(&self, video_id: &str, resolution: Resolution) -> PathBuf {
        self.output_dir(video_id, OutputFormat::Segmented, resolution)
            .join(format!("manifest-{}.m3u8", resolution))
    }

    pub fn segment_file(&self, video_id: &str, resolution: Resolution, index: u64) -> PathBuf {
        self.output_dir(video_id, OutputFormat::Segmented, resolution)
            .join(segment_file_name(resolution, index))
    }

    /// `-hls_segment_filename` pattern matching [`Self::segment_file`]
    pub fn segment_pattern(&self, video_id: &str, resolution: Resolution) -> PathBuf {
        self.output_dir(video_id, OutputFormat::Segmented, resolution)
            .join(format!("segment-{}-%d.ts", resolution))
    }

    pub fn progressive_file(&self, video_id: &str, format: OutputFormat, resolution: Resolution) -> PathBuf {
        self.output_dir(video_id, format, resolution)
            .join(format!("{}.{}", resolution, format))
    }

    /// Encoder output target: the manifest for segmented output, the file otherwise
    pub fn output_target(&self, video_id: &str, format: OutputFormat, resolution: Resolution) -> PathBuf {
        if format.is_segmented() {
            self.manifest_file(video_id, resolution)
        } else {
            self.progressive_file(video_id, format, resolution)
        }
    }

    /// Create an empty output directory, clearing leftovers from an earlier run.
    pub async fn prepare_output(
        &self,
        video_id: &str,
        format: OutputFormat,
        resolution: Resolution,
    ) -> io::Result<PathBuf> {
        let dir = self.output_dir(video_id, format, resolution);
        remove_dir_if_exists(&dir).await?;
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Remove the transient `adaptive/` and `progressive/` trees.
    pub async fn clean_transient(&self, video_id: &str) -> io::Result<()> {
        remove_dir_if_exists(&self.adaptive_root(video_id)).await?;
        remove_dir_if_exists(&self.progressive_root(video_id)).await
    }

    /// Segment files currently in a segmented output dir, ordered by index
    pub async fn list_segments(&self, video_id: &str, resolution: Resolution) -> io::Result<Vec<PathBuf>> {
        let dir = self.output_dir(video_id, OutputFormat::Segmented, resolution);
        let mut entries = fs::read_dir(&dir).await?;
        let mut segments = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(index) = name.to_str().and_then(|n| parse_segment_index(n, resolution)) {
                segments.push((index, entry.path()));
            }
        }

        segments.sort_by_key(|(index, _)| *index);
        Ok(segments.into_iter().map(|(_, path)| path).collect())
    }
}

/// Video ids name directories under the root: 1 to 64 of `[A-Za-z0-9_-]`.
pub fn valid_video_id(video_id: &str) -> bool {
    !video_id.is_empty()
        && video_id.len() <= 64
        && video_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Source extensions: 1 to 16 ASCII alphanumerics.
pub fn valid_extension(extension: &str) -> bool {
    !extension.is_empty()
        && extension.len() <= 16
        && extension.chars().all(|c| c.is_ascii_alphanumeric())
}

/// `segment-<res>-<n>.ts`
pub fn segment_file_name(resolution: Resolution, index: u64) -> String {
    format!("segment-{}-{}.ts", resolution, index)
}

/// Index of a segment file name for `resolution`, if it is one
pub fn parse_segment_index(name: &str, resolution: Resolution) -> Option<u64> {
    name.strip_prefix("segment-")?
        .strip_prefix(resolution.as_str())?
        .strip_prefix('-')?
        .strip_suffix(".ts")?
        .parse()
        .ok()
}

async fn remove_dir_if_exists(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Remove a file, treating "already gone" as success.
pub async fn remove_file_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Best-effort removal of uploaded artifacts; failures are only logged.
pub async fn discard_files(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = remove_file_if_exists(path).await {
            warn!(path = %path.display(), "Failed to delete local copy: {}", e);
        }
    }
}
