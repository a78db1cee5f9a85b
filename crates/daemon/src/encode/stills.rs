//! Still-image extraction from live segments
//!
//! Three fixed sizes are grabbed from a single frame: a square thumbnail,
//! a preview and a poster. Each is scaled up to cover its box and center-cropped.

use super::ffmpeg::{run_to_exit, EncodeError, EncoderBackend, EncoderExit};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Which still image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StillKind {
    Thumbnail,
    Preview,
    Poster,
}

impl StillKind {
    pub const ALL: [StillKind; 3] = [StillKind::Thumbnail, StillKind::Preview, StillKind::Poster];

    pub fn as_str(&self) -> &'static str {
        match self {
            StillKind::Thumbnail => "thumbnail",
            StillKind::Preview => "preview",
            StillKind::Poster => "poster",
        }
    }

    /// Output box (width, height)
    pub fn size(&self) -> (u32, u32) {
        match self {
            StillKind::Thumbnail => (100, 100),
            StillKind::Preview => (512, 288),
            StillKind::Poster => (1280, 720),
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.jpg", self.as_str())
    }
}

/// Arguments to grab one frame at `offset_secs` into `output`.
pub fn still_args(input: &Path, offset_secs: f64, kind: StillKind, output: &Path) -> Vec<String> {
    let (w, h) = kind.size();
    vec![
        "-ss".to_string(),
        format!("{:.3}", offset_secs.max(0.0)),
        "-i".to_string(),
        input.to_string_lossy().to_string(),
        "-frames:v".to_string(),
        "1".to_string(),
        "-vf".to_string(),
        format!(
            "scale={w}:{h}:force_original_aspect_ratio=increase,crop={w}:{h}",
            w = w,
            h = h
        ),
        output.to_string_lossy().to_string(),
    ]
}

/// Extract all three stills from `segment` into `images_dir`, concurrently.
///
/// Returns the written paths in [`StillKind::ALL`] order. Fails if any
/// extraction fails or is killed.
pub async fn extract_stills(
    backend: &dyn EncoderBackend,
    segment: &Path,
    offset_secs: f64,
    images_dir: &Path,
    kill: &CancellationToken,
) -> Result<Vec<(StillKind, PathBuf)>, EncodeError> {
    let jobs = StillKind::ALL.into_iter().map(|kind| {
        let output = images_dir.join(kind.file_name());
        let args = still_args(segment, offset_secs, kind, &output);
        let kill = kill.child_token();
        async move {
            match run_to_exit(backend, args, kill).await? {
                EncoderExit::Completed => Ok((kind, output)),
                EncoderExit::Killed => Err(EncodeError::Terminated),
            }
        }
    });

    futures::future::try_join_all(jobs).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_still_sizes() {
        assert_eq!(StillKind::Thumbnail.size(), (100, 100));
        assert_eq!(StillKind::Preview.size(), (512, 288));
        assert_eq!(StillKind::Poster.size(), (1280, 720));
        assert_eq!(StillKind::Poster.file_name(), "poster.jpg");
    }

    #[test]
    fn test_still_args_cover_and_crop() {
        let args = still_args(
            Path::new("/v/segment-720p-3.ts"),
            1.5,
            StillKind::Preview,
            Path::new("/v/images/preview.jpg"),
        );
        assert_eq!(args[0..2], ["-ss".to_string(), "1.500".to_string()]);
        assert!(args.contains(&"scale=512:288:force_original_aspect_ratio=increase,crop=512:288".to_string()));
        assert_eq!(args.last().unwrap(), "/v/images/preview.jpg");
    }
}
